//! Agent Flow Integration Tests
//!
//! End-to-end request handling with a canned planner model and a
//! recording transport: plan repair, provider exhaustion, suppression,
//! and delivery failure behavior.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use mediabot::agent::Agent;
use mediabot::config::Config;
use mediabot::error::AgentError;
use mediabot::history::HistoryStore;
use mediabot::llm::PlannerModel;
use mediabot::providers::GenerationClient;
use mediabot::transport::{ChatTransport, NormalizedRequest, OutboundItem, TransportError};

/// Planner model that pops canned responses in order
struct CannedModel {
    responses: Mutex<VecDeque<String>>,
}

impl CannedModel {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
        })
    }
}

#[async_trait]
impl PlannerModel for CannedModel {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("no canned response left"))
    }
}

/// Transport that records every send as a tagged line
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
}

impl RecordingTransport {
    fn log(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(
        &self,
        _chat_id: i64,
        text: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(format!("text:{}", text));
        Ok(())
    }

    async fn send_image(
        &self,
        _chat_id: i64,
        url: &str,
        _caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(format!("image:{}", url));
        Ok(())
    }

    async fn send_video(
        &self,
        _chat_id: i64,
        url: &str,
        _caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(format!("video:{}", url));
        Ok(())
    }

    async fn send_audio(
        &self,
        _chat_id: i64,
        url: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(format!("audio:{}", url));
        Ok(())
    }

    async fn send_poll(
        &self,
        _chat_id: i64,
        question: &str,
        _options: &[String],
    ) -> Result<(), TransportError> {
        self.sent.lock().push(format!("poll:{}", question));
        Ok(())
    }

    async fn send_location(
        &self,
        _chat_id: i64,
        latitude: f64,
        longitude: f64,
        _description: Option<&str>,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .push(format!("location:{},{}", latitude, longitude));
        Ok(())
    }
}

/// Transport whose sends always fail
struct BrokenTransport;

#[async_trait]
impl ChatTransport for BrokenTransport {
    async fn send_text(
        &self,
        _chat_id: i64,
        _text: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }

    async fn send_image(
        &self,
        _chat_id: i64,
        _url: &str,
        _caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }

    async fn send_video(
        &self,
        _chat_id: i64,
        _url: &str,
        _caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }

    async fn send_audio(
        &self,
        _chat_id: i64,
        _url: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }

    async fn send_poll(
        &self,
        _chat_id: i64,
        _question: &str,
        _options: &[String],
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }

    async fn send_location(
        &self,
        _chat_id: i64,
        _latitude: f64,
        _longitude: f64,
        _description: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::SendFailed("socket closed".into()))
    }
}

fn test_config(temp: &TempDir) -> Config {
    Config {
        model_api_key: None,
        model_url: None,
        // A port nothing listens on, so generation calls fail fast.
        generation_url: "http://127.0.0.1:9".to_string(),
        generation_api_key: None,
        search_url: None,
        db_path: temp.path().join("agent.db"),
        history_limit: 20,
        lease_ttl_secs: 60,
        dedup_ttl_secs: 60,
    }
}

fn build_agent(
    temp: &TempDir,
    model: Arc<dyn PlannerModel>,
    transport: Arc<dyn ChatTransport>,
) -> Agent {
    let config = test_config(temp);
    let history = Arc::new(HistoryStore::open(&config.db_path).unwrap());
    let generation = GenerationClient::from_config(&config);
    Agent::new(config, history, model, generation, transport)
}

#[tokio::test]
async fn test_provider_exhaustion_notice_sent_directly() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let model = CannedModel::new(&[
        r#"{"tool": "create_image", "parameters": {"prompt": "a cat", "provider": "grok"}}"#,
    ]);
    let agent = build_agent(&temp, model, transport.clone());

    let request = NormalizedRequest::text(1, "use grok to draw a cat");
    let items = agent.handle_request(&request).await.unwrap();

    // The capability already delivered its own error; assembly must not
    // add a second failure message on top.
    assert!(items.is_empty());
    let log = transport.log();
    assert_eq!(log.len(), 1);
    assert!(log[0].starts_with("text:"));
    assert!(log[0].contains("could not generate the image"));
}

#[tokio::test]
async fn test_messy_plan_output_repaired_and_executed() {
    let raw_plan = r#"Here is the plan:
```json
{
  "isMultiStep": true,
  "reasoning": "poll first, then the meeting point",
  "steps": [
    {"stepNumber": 1, "tool": "create_poll", "action": "ask when",
     "parameters": {"question": "When do we meet?", "options": ["noon", "evening"]},},
    {"stepNumber": 2, "tool": "send_location", "action": "show where",
     "parameters": {"latitude": 41.4, "longitude": 2.2, "description": "the square"}}
  ],
}
```"#;
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let agent = build_agent(&temp, CannedModel::new(&[raw_plan]), transport.clone());

    let request = NormalizedRequest::text(1, "make a poll and then send the location");
    let items = agent.handle_request(&request).await.unwrap();

    // Both steps ran despite fences and dangling commas, the reply comes
    // out in fixed order, and the location suppresses the narrative.
    let kinds: Vec<_> = items.iter().map(|i| i.kind()).collect();
    assert_eq!(kinds, vec!["location", "poll"]);

    let log = transport.log();
    assert_eq!(log[0], "location:41.4,2.2");
    assert_eq!(log[1], "poll:When do we meet?");
}

#[tokio::test]
async fn test_poll_reply_keeps_its_text() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let model = CannedModel::new(&[
        r#"{"tool": "create_poll", "parameters": {"question": "Pizza night?", "options": ["yes", "no"]}}"#,
    ]);
    let agent = build_agent(&temp, model, transport.clone());

    let request = NormalizedRequest::text(1, "ask everyone about pizza night");
    let items = agent.handle_request(&request).await.unwrap();

    let kinds: Vec<_> = items.iter().map(|i| i.kind()).collect();
    assert_eq!(kinds, vec!["poll", "text"]);
    match &items[1] {
        OutboundItem::Text(t) => assert!(t.contains("Pizza night?")),
        other => panic!("unexpected item: {:?}", other),
    }
}

#[tokio::test]
async fn test_delivery_failure_surfaces_as_error() {
    let temp = TempDir::new().unwrap();
    let model = CannedModel::new(&["not json", "Hello!"]);
    let agent = build_agent(&temp, model, Arc::new(BrokenTransport));

    let request = NormalizedRequest::text(1, "hi");
    let err = agent.handle_request(&request).await.unwrap_err();

    match err {
        AgentError::DownstreamTransportFailure(msg) => assert!(msg.contains("socket closed")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_chats_do_not_share_state() {
    let temp = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let model = CannedModel::new(&["not json", "reply A", "not json", "reply B"]);
    let agent = build_agent(&temp, model, transport.clone());

    agent
        .handle_request(&NormalizedRequest::text(1, "hello from chat one"))
        .await
        .unwrap();
    agent
        .handle_request(&NormalizedRequest::text(2, "hello from chat two"))
        .await
        .unwrap();

    let log = transport.log();
    assert_eq!(log, vec!["text:reply A".to_string(), "text:reply B".to_string()]);
}
