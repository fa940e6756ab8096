//! mediabot - conversational media agent core
//!
//! The orchestration core of a chat assistant that turns free-form
//! messages into capability calls: media generation with provider
//! fallback, multi-step plan compilation from lenient model output, and
//! a response assembly pass that decides which artifacts and text
//! actually reach the chat.
//!
//! The messaging platform itself stays outside this crate; adapters
//! implement [`transport::ChatTransport`] and feed the core
//! [`transport::NormalizedRequest`] values.

pub mod agent;
pub mod assembly;
pub mod config;
pub mod error;
pub mod fallback;
pub mod history;
pub mod lease;
pub mod llm;
pub mod planner;
pub mod providers;
pub mod tools;
pub mod transport;

pub use agent::Agent;
pub use config::Config;
pub use error::AgentError;
pub use transport::{ChatTransport, NormalizedRequest, OutboundItem};
