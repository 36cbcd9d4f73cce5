use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported inside a `{ "success": false, "error": ... }` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn check(success: bool, error: Option<String>) -> Result<(), ApiError> {
        if success {
            return Ok(());
        }
        Err(Self::new(
            error.unwrap_or_else(|| "request failed without an error message".to_string()),
        ))
    }
}
