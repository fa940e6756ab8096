//! mediabot dry-run entry point.
//!
//! Reads messages from stdin, one per line, and runs each through the
//! full orchestration path with a transport that only logs what it
//! would send. Real deployments embed the library behind a platform
//! adapter instead.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use mediabot::agent::Agent;
use mediabot::config::Config;
use mediabot::history::HistoryStore;
use mediabot::llm::LlmClient;
use mediabot::providers::GenerationClient;
use mediabot::transport::{DryRunTransport, NormalizedRequest};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    if std::env::args().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into())),
        )
        .init();

    let config = Config::from_env()?;
    let history = Arc::new(HistoryStore::open(&config.db_path)?);

    let llm = LlmClient::from_config(&config);
    if !llm.is_available() {
        info!("No model API key configured; planning degrades to conversational replies");
    }

    let generation = GenerationClient::from_config(&config);
    let agent = Agent::new(
        config,
        history,
        Arc::new(llm),
        generation,
        Arc::new(DryRunTransport),
    );

    info!("mediabot dry-run ready; type a message and press enter");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        let request = NormalizedRequest::text(1, text);
        if let Err(e) = agent.handle_request(&request).await {
            eprintln!("request failed: {}", e);
        }
    }

    info!("mediabot shutting down");
    Ok(())
}

fn print_help() {
    println!("mediabot - conversational media agent (dry run)");
    println!();
    println!("Usage: mediabot");
    println!();
    println!("Reads one message per line from stdin and logs the reply");
    println!("items instead of sending them. Type /quit to exit.");
    println!();
    println!("Environment:");
    println!("  MEDIABOT_MODEL_API_KEY       planner model API key");
    println!("  MEDIABOT_MODEL_URL           planner model endpoint override");
    println!("  MEDIABOT_GENERATION_URL      generation gateway base URL");
    println!("  MEDIABOT_GENERATION_API_KEY  generation gateway API key");
    println!("  MEDIABOT_SEARCH_URL          web search endpoint");
    println!("  MEDIABOT_DB_PATH             SQLite database path");
    println!("  MEDIABOT_HISTORY_LIMIT       messages injected as context");
    println!("  MEDIABOT_LEASE_TTL           chat lease expiry (seconds)");
    println!("  MEDIABOT_DEDUP_TTL           schedule dedup window (seconds)");
}
