//! Provider Fallback Coordinator
//!
//! Tries an ordered candidate list for one capability until a candidate
//! succeeds, aggregating per-candidate failures. Performs no I/O of its
//! own; every call is delegated through the supplied closure.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::AgentError;
use crate::tools::ToolResult;

/// Invoke candidates in order until one succeeds.
///
/// The first result whose `error` is absent is returned immediately,
/// tagged with the candidate that produced it. If the list is exhausted
/// the failure carries every per-candidate message, each attributable to
/// its provider. Callers that surface an error to the chat themselves set
/// `errors_already_sent` afterwards; the coordinator always leaves it
/// false.
pub async fn try_with_fallback<F, Fut>(candidates: &[String], mut invoke: F) -> ToolResult
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ToolResult>,
{
    let mut failures: Vec<String> = Vec::new();

    for candidate in candidates {
        debug!("Trying provider '{}'", candidate);
        let mut result = invoke(candidate.clone()).await;

        if result.error.is_none() {
            result.provider_used = Some(candidate.clone());
            return result;
        }

        // A candidate's own failure carries just its message, not the
        // aggregate framing.
        let message = match result.error {
            Some(AgentError::AllProvidersFailed { details }) => details,
            Some(e) => e.to_string(),
            None => "unknown error".to_string(),
        };
        warn!("Provider '{}' failed: {}", candidate, message);
        failures.push(format!("{}: {}", candidate, message));
    }

    let details = if failures.is_empty() {
        "no providers configured".to_string()
    } else {
        failures.join("\n")
    };

    ToolResult::failed(AgentError::AllProvidersFailed { details })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn list(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let calls = AtomicUsize::new(0);
        let candidates = list(&["a", "b", "c"]);

        let result = try_with_fallback(&candidates, |name| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { ToolResult::ok(format!("made by {}", name)) }
        })
        .await;

        assert!(result.success);
        assert_eq!(result.provider_used.as_deref(), Some("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_through_to_second() {
        let candidates = list(&["a", "b"]);

        let result = try_with_fallback(&candidates, |name| async move {
            if name == "a" {
                ToolResult::failed(AgentError::AllProvidersFailed {
                    details: "a is down".into(),
                })
            } else {
                ToolResult::ok("done")
            }
        })
        .await;

        assert!(result.success);
        assert_eq!(result.provider_used.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_exhaustion_aggregates_errors() {
        let candidates = list(&["a", "b"]);

        let result = try_with_fallback(&candidates, |name| async move {
            ToolResult::failed(AgentError::AllProvidersFailed {
                details: format!("{} broke", name),
            })
        })
        .await;

        assert!(!result.success);
        assert!(!result.errors_already_sent);
        match result.error {
            Some(AgentError::AllProvidersFailed { details }) => {
                assert!(details.contains("a:"));
                assert!(details.contains("b:"));
                assert!(details.contains("a broke"));
                assert!(details.contains("b broke"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_candidate_never_retries() {
        let calls = AtomicUsize::new(0);
        let candidates = list(&["grok"]);

        let result = try_with_fallback(&candidates, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                ToolResult::failed(AgentError::AllProvidersFailed {
                    details: "grok quota exceeded".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result.error {
            Some(AgentError::AllProvidersFailed { details }) => {
                assert!(details.contains("grok"));
                assert!(!details.contains('\n'));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let result = try_with_fallback(&[], |_: String| async { ToolResult::ok("x") }).await;
        assert!(!result.success);
        assert!(result
            .error
            .unwrap()
            .to_string()
            .contains("no providers configured"));
    }
}
