//! Narrow boundary to the vendor voice platform.
//!
//! The session controller only ever sees this trait and the six events
//! below; the vendor's actual API surface stays behind [`crate::vapi`].

use crate::config::AssistantConfig;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("API key is missing or invalid")]
    InvalidApiKey,
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Events delivered by the vendor platform over the lifetime of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established, audio is flowing.
    CallStart,
    /// The call ended, either side.
    CallEnd,
    /// The assistant started speaking.
    SpeechStart,
    /// The assistant finished speaking.
    SpeechEnd,
    /// Runtime failure reported by the vendor.
    Error { message: String },
    /// The start request was accepted but the call never came up.
    CallStartFailed { message: String },
}

impl ClientEvent {
    /// Build an `Error` event from an optional vendor payload message.
    pub fn error(message: Option<String>) -> Self {
        ClientEvent::Error {
            message: message.unwrap_or_else(|| "Unknown error".to_string()),
        }
    }

    /// Build a `CallStartFailed` event from an optional vendor payload message.
    pub fn call_start_failed(message: Option<String>) -> Self {
        ClientEvent::CallStartFailed {
            message: message.unwrap_or_else(|| "Unknown error".to_string()),
        }
    }
}

/// Handle to the vendor voice client.
///
/// `start` and `stop` are fire-and-forget: they return once the request is
/// dispatched, and the actual call outcome arrives later as [`ClientEvent`]s
/// on the subscription.
#[async_trait]
pub trait VoiceClient: Send + Sync {
    /// Request a new call with the given assistant configuration.
    async fn start(&self, assistant: &AssistantConfig) -> Result<(), ClientError>;

    /// End the active call, if any.
    async fn stop(&self) -> Result<(), ClientError>;

    /// Subscribe to call lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}
