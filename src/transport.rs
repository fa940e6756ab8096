//! Chat Transport Boundary
//!
//! Normalized inbound requests and the outbound send primitives. The real
//! messaging adapter (message parsing, media download, webhook delivery)
//! lives outside this crate; it implements `ChatTransport` and produces
//! `NormalizedRequest` records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Error types for transport operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid chat: {0}")]
    InvalidChat(i64),

    #[error("Media upload failed: {0}")]
    MediaUploadFailed(String),

    #[error("Transport not ready")]
    NotReady,
}

/// Chat type for an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Private,
    Group,
}

/// Quoted-message context attached to a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub id: String,
    pub text: String,
    pub media_url: Option<String>,
}

/// One normalized inbound message, the sole input to the orchestration core.
///
/// Produced by the external message parser; the core never sees raw
/// platform payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub sender_name: String,
    /// Free user text (caption when the message carries media)
    pub text: String,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub quoted: Option<QuotedMessage>,
    /// Detected language code ("en", "es", ...)
    pub language: String,
    /// Per-capability authorization flags
    pub media_allowed: bool,
    pub search_allowed: bool,
}

impl NormalizedRequest {
    /// Minimal text-only request, used throughout the tests
    pub fn text(chat_id: i64, text: &str) -> Self {
        Self {
            chat_id,
            chat_kind: ChatKind::Private,
            sender_name: String::new(),
            text: text.to_string(),
            image_url: None,
            video_url: None,
            audio_url: None,
            quoted: None,
            language: "en".to_string(),
            media_allowed: true,
            search_allowed: true,
        }
    }
}

/// Poll payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPayload {
    pub question: String,
    pub options: Vec<String>,
}

/// Location payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub description: Option<String>,
}

/// One item of the final assembled reply, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundItem {
    Location(LocationPayload),
    Poll(PollPayload),
    Image { url: String, caption: Option<String> },
    Video { url: String, caption: Option<String> },
    Audio { url: String },
    Text(String),
}

impl OutboundItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Location(_) => "location",
            Self::Poll(_) => "poll",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
            Self::Text(_) => "text",
        }
    }
}

/// Outbound send primitives, one per item kind.
///
/// Implementations perform the actual network delivery; the orchestration
/// core never performs raw sends itself.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        quoted_id: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn send_image(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        quoted_id: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn send_video(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        quoted_id: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn send_audio(
        &self,
        chat_id: i64,
        url: &str,
        quoted_id: Option<&str>,
    ) -> Result<(), TransportError>;

    async fn send_poll(
        &self,
        chat_id: i64,
        question: &str,
        options: &[String],
    ) -> Result<(), TransportError>;

    async fn send_location(
        &self,
        chat_id: i64,
        latitude: f64,
        longitude: f64,
        description: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// Dispatch one assembled item through the matching send primitive
pub async fn deliver(
    transport: &dyn ChatTransport,
    chat_id: i64,
    item: &OutboundItem,
) -> Result<(), TransportError> {
    match item {
        OutboundItem::Location(loc) => {
            transport
                .send_location(
                    chat_id,
                    loc.latitude,
                    loc.longitude,
                    loc.description.as_deref(),
                )
                .await
        }
        OutboundItem::Poll(poll) => {
            transport
                .send_poll(chat_id, &poll.question, &poll.options)
                .await
        }
        OutboundItem::Image { url, caption } => {
            transport
                .send_image(chat_id, url, caption.as_deref(), None)
                .await
        }
        OutboundItem::Video { url, caption } => {
            transport
                .send_video(chat_id, url, caption.as_deref(), None)
                .await
        }
        OutboundItem::Audio { url } => transport.send_audio(chat_id, url, None).await,
        OutboundItem::Text(text) => transport.send_text(chat_id, text, None).await,
    }
}

/// Transport that only logs, for standalone dry runs
pub struct DryRunTransport;

#[async_trait]
impl ChatTransport for DryRunTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        info!("[dry-run] text -> {}: {}", chat_id, text);
        Ok(())
    }

    async fn send_image(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        info!("[dry-run] image -> {}: {} ({:?})", chat_id, url, caption);
        Ok(())
    }

    async fn send_video(
        &self,
        chat_id: i64,
        url: &str,
        caption: Option<&str>,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        info!("[dry-run] video -> {}: {} ({:?})", chat_id, url, caption);
        Ok(())
    }

    async fn send_audio(
        &self,
        chat_id: i64,
        url: &str,
        _quoted_id: Option<&str>,
    ) -> Result<(), TransportError> {
        info!("[dry-run] audio -> {}: {}", chat_id, url);
        Ok(())
    }

    async fn send_poll(
        &self,
        chat_id: i64,
        question: &str,
        options: &[String],
    ) -> Result<(), TransportError> {
        info!("[dry-run] poll -> {}: {} {:?}", chat_id, question, options);
        Ok(())
    }

    async fn send_location(
        &self,
        chat_id: i64,
        latitude: f64,
        longitude: f64,
        description: Option<&str>,
    ) -> Result<(), TransportError> {
        info!(
            "[dry-run] location -> {}: {},{} ({:?})",
            chat_id, latitude, longitude, description
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = NormalizedRequest::text(42, "hello");
        assert_eq!(req.chat_id, 42);
        assert_eq!(req.chat_kind, ChatKind::Private);
        assert!(req.media_allowed);
        assert!(req.image_url.is_none());
    }

    #[test]
    fn test_item_kinds() {
        assert_eq!(OutboundItem::Text("x".into()).kind(), "text");
        assert_eq!(OutboundItem::Audio { url: "u".into() }.kind(), "audio");
    }

    #[tokio::test]
    async fn test_dry_run_delivery() {
        let transport = DryRunTransport;
        let item = OutboundItem::Poll(PollPayload {
            question: "Cats?".into(),
            options: vec!["yes".into(), "no".into()],
        });
        deliver(&transport, 1, &item).await.unwrap();
    }
}
