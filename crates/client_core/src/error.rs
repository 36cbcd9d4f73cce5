use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network request failed: {0}")]
    Network(String),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("server rejected request: {0}")]
    Rejected(#[from] ApiError),
    #[error("malformed server response: {0}")]
    Decode(String),
    #[error("push channel failed: {0}")]
    Channel(String),
    #[error("transport is not connected")]
    NotConnected,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether retrying the same request later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Channel(_) => true,
            Self::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            Self::Rejected(_) | Self::Decode(_) | Self::NotConnected | Self::Exhausted { .. } => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("microphone access denied: {reason}")]
pub struct PermissionError {
    pub reason: String,
}

impl PermissionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("attachment has no file name")]
    MissingFileName,
    #[error("file type .{extension} is not allowed for security reasons")]
    BlockedFileType { extension: String },
    #[error("file too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("no messages selected")]
    EmptySelection,
    #[error("a delete request is already in progress")]
    DeleteInProgress,
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("engine has shut down")]
    Closed,
}
