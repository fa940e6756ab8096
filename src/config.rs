//! Configuration management

use anyhow::Result;
use std::path::PathBuf;

/// Agent configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Planner model API key (optional - without it planning degrades to
    /// conversational replies)
    pub model_api_key: Option<String>,

    /// Planner model endpoint override
    pub model_url: Option<String>,

    /// Generation gateway base URL (providers are routed by key under it)
    pub generation_url: String,

    /// Generation gateway API key
    pub generation_api_key: Option<String>,

    /// Web search endpoint (optional - search tools fail soft without it)
    pub search_url: Option<String>,

    /// SQLite database path for history and tasks
    pub db_path: PathBuf,

    /// Max conversation messages injected as planning context
    pub history_limit: usize,

    /// Chat lease expiry in seconds
    pub lease_ttl_secs: u64,

    /// Scheduling dedup window in seconds
    pub dedup_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let model_api_key = std::env::var("MEDIABOT_MODEL_API_KEY").ok();
        let model_url = std::env::var("MEDIABOT_MODEL_URL").ok();

        let generation_url = std::env::var("MEDIABOT_GENERATION_URL")
            .unwrap_or_else(|_| "http://localhost:8810".to_string());
        let generation_api_key = std::env::var("MEDIABOT_GENERATION_API_KEY").ok();

        let search_url = std::env::var("MEDIABOT_SEARCH_URL").ok();

        let db_path = std::env::var("MEDIABOT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".local/share/mediabot"))
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join("mediabot.db")
            });

        let history_limit = std::env::var("MEDIABOT_HISTORY_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let lease_ttl_secs = std::env::var("MEDIABOT_LEASE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        let dedup_ttl_secs = std::env::var("MEDIABOT_DEDUP_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            model_api_key,
            model_url,
            generation_url,
            generation_api_key,
            search_url,
            db_path,
            history_limit,
            lease_ttl_secs,
            dedup_ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // from_env never fails; unset vars fall back to defaults
        let config = Config::from_env().unwrap();
        assert!(config.history_limit > 0);
        assert!(config.lease_ttl_secs > 0);
        assert!(!config.generation_url.is_empty());
    }
}
