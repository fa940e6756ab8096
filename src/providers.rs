//! Generation Provider Catalog
//!
//! Interchangeable backends per media kind, with a default fallback order.
//! The catalog is static data; actual rendering happens behind the
//! generation gateway and is out of scope here.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AgentError;

/// Media kinds a provider can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
    Music,
    Speech,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Music => "music",
            Self::Speech => "speech",
        }
    }
}

// Default candidate order per kind; first entry is the default provider.
static IMAGE_PROVIDERS: &[&str] = &["gemini", "grok", "openai"];
static VIDEO_PROVIDERS: &[&str] = &["kling", "runway", "luma"];
static MUSIC_PROVIDERS: &[&str] = &["suno", "udio"];
static SPEECH_PROVIDERS: &[&str] = &["elevenlabs", "openai"];

/// Default candidate list for a media kind
pub fn default_candidates(kind: MediaKind) -> &'static [&'static str] {
    match kind {
        MediaKind::Image => IMAGE_PROVIDERS,
        MediaKind::Video => VIDEO_PROVIDERS,
        MediaKind::Music => MUSIC_PROVIDERS,
        MediaKind::Speech => SPEECH_PROVIDERS,
    }
}

/// Resolve the ordered candidate list for one capability call.
///
/// An explicitly named provider is validated against the kind and becomes
/// the only candidate: the user's choice is never silently overridden by
/// fallback. Without an explicit choice the full default order applies.
pub fn candidates_for(kind: MediaKind, explicit: Option<&str>) -> Result<Vec<String>, AgentError> {
    let defaults = default_candidates(kind);

    match explicit {
        Some(name) => {
            let name = name.trim().to_lowercase();
            if defaults.iter().any(|p| *p == name) {
                Ok(vec![name])
            } else {
                Err(AgentError::ProviderMismatch {
                    provider: name,
                    kind: kind.as_str().to_string(),
                })
            }
        }
        None => Ok(defaults.iter().map(|p| p.to_string()).collect()),
    }
}

/// Request sent to the generation gateway
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Asset returned by a provider
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedAsset {
    pub url: String,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Thin HTTP client for the generation gateway.
///
/// One POST per call, no retries; fallback across providers is the
/// coordinator's job, not this client's.
#[derive(Clone)]
pub struct GenerationClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GenerationClient {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(|s| s.to_string()),
        }
    }

    /// Create from config
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            &config.generation_url,
            config.generation_api_key.as_deref(),
        )
    }

    /// Invoke one provider for one media kind
    pub async fn generate(
        &self,
        kind: MediaKind,
        provider: &str,
        request: &GenerationRequest,
    ) -> Result<GeneratedAsset> {
        let url = format!("{}/{}/{}", self.base_url, kind.as_str(), provider);
        debug!("Generation call: {}", url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} returned {}: {}", provider, status, body));
        }

        Ok(response.json().await?)
    }
}
