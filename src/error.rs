use crate::history::GatewayError;
use crate::upload::UploadError;
use thiserror::Error;

/// Caller-facing failure taxonomy. Connection-level problems never surface
/// here; they show up as state changes (a `failed` status, a
/// `disconnected` event) instead.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// Network-class failure after the retry budget was exhausted.
    #[error("transient network failure: {0}")]
    Transient(String),
    /// Rejected before anything left the device (empty content, disallowed
    /// file type, oversized attachment). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The operation raced server-side state (e.g. reacting to a deleted
    /// message). Local state is left unchanged.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The server rejected the operation outright (e.g. blocked
    /// recipient). Manual retry required.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The chat is not open in this session.
    #[error("chat {0} is not open")]
    ChatNotOpen(String),
}

impl From<GatewayError> for ChatError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Transient(msg) => ChatError::Transient(msg),
            GatewayError::Timeout => ChatError::Transient("request timed out".to_string()),
            GatewayError::Validation(msg) => ChatError::Validation(msg),
            GatewayError::Conflict(msg) => ChatError::Conflict(msg),
            GatewayError::Permanent(msg) => ChatError::Permanent(msg),
        }
    }
}

impl From<UploadError> for ChatError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::UnsupportedType(_) | UploadError::TooLarge { .. } => {
                ChatError::Validation(e.to_string())
            }
            UploadError::Cancelled => ChatError::Conflict("upload cancelled".to_string()),
            UploadError::Failed(msg) => ChatError::Transient(msg),
            UploadError::Rejected(msg) => ChatError::Permanent(msg),
        }
    }
}
