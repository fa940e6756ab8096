//! Error taxonomy for the orchestration core.
//!
//! Tool and provider failures travel inside `ToolResult` as values; only
//! transport failures while delivering the final reply escape as `Err`.

/// Errors produced by the orchestration core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("Missing required parameter: {param}")]
    RequiredParameterMissing { param: String },

    #[error("Provider '{provider}' cannot produce {kind} output")]
    ProviderMismatch { provider: String, kind: String },

    #[error("All providers failed:\n{details}")]
    AllProvidersFailed { details: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Planner output could not be parsed")]
    PlanParseFailure,

    #[error("Failed to deliver reply: {0}")]
    DownstreamTransportFailure(String),
}

impl AgentError {
    /// Short stable tag, used in logs and persisted tool-call records
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RequiredParameterMissing { .. } => "required_parameter_missing",
            Self::ProviderMismatch { .. } => "provider_mismatch",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::UnknownTool(_) => "unknown_tool",
            Self::PlanParseFailure => "plan_parse_failure",
            Self::DownstreamTransportFailure(_) => "transport_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = AgentError::RequiredParameterMissing {
            param: "prompt".into(),
        };
        assert!(e.to_string().contains("prompt"));

        let e = AgentError::ProviderMismatch {
            provider: "suno".into(),
            kind: "image".into(),
        };
        assert!(e.to_string().contains("suno"));
        assert!(e.to_string().contains("image"));
    }

    #[test]
    fn test_error_tags() {
        assert_eq!(AgentError::UnknownTool("x".into()).tag(), "unknown_tool");
        assert_eq!(AgentError::PlanParseFailure.tag(), "plan_parse_failure");
    }
}
