//! Planner Model Client
//!
//! HTTP client for the language model that powers plan decomposition and
//! single-tool selection. The orchestration core only depends on the
//! `PlannerModel` trait; tests substitute canned responses.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_MODEL_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL_ID: &str = "claude-3-5-haiku-20241022";

/// Text-in, text-out generation seam used by the planner
#[async_trait]
pub trait PlannerModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Message in conversation
#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// API request
#[derive(Debug, Serialize)]
struct MessageRequest {
    model: String,
    max_tokens: usize,
    system: String,
    messages: Vec<Message>,
}

/// API response
#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

/// HTTP-backed planner model
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: Option<String>,
    url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: Option<&str>, url: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            url: url.unwrap_or(DEFAULT_MODEL_URL).to_string(),
            model: DEFAULT_MODEL_ID.to_string(),
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.model_api_key.as_deref(), config.model_url.as_deref())
    }

    /// Check if an API key is configured
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("No model API key configured"))?;

        let request = MessageRequest {
            model: self.model.clone(),
            max_tokens: 2048,
            system: system.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Model API error {}: {}", status, body));
        }

        let parsed: MessageResponse = response.json().await?;
        let text = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        debug!("Model returned {} chars", text.len());
        Ok(text)
    }
}

#[async_trait]
impl PlannerModel for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.complete(
            "You are the planning component of a chat assistant. \
             Answer only in the requested format.",
            prompt,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability() {
        let client = LlmClient::new(None, None);
        assert!(!client.is_available());

        let client = LlmClient::new(Some("key"), None);
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_generate_without_key_fails() {
        let client = LlmClient::new(None, None);
        let err = client.generate("hello").await.unwrap_err();
        assert!(err.to_string().contains("API key"));
    }
}
