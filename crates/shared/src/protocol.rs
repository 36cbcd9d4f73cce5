use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

impl SenderSummary {
    pub fn display_name(&self) -> &str {
        match self.first_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: MessageId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "message_type", default)]
    pub kind: MessageKind,
    pub sender: SenderSummary,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
}

/// Response body of both the text send endpoint and the upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<InboundMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendMessageResponse {
    pub fn into_message(self) -> Result<InboundMessage, ApiError> {
        ApiError::check(self.success, self.error)?;
        self.message
            .ok_or_else(|| ApiError::new("server acknowledged send without a message"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PollResponse {
    pub fn into_messages(self) -> Result<Vec<InboundMessage>, ApiError> {
        ApiError::check(self.success, self.error)?;
        Ok(self.messages)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceResponse {
    #[serde(default)]
    pub online_users: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PresenceResponse {
    pub fn into_online_users(self) -> Result<Vec<UserId>, ApiError> {
        match self.error {
            Some(error) => Err(ApiError::new(error)),
            None => Ok(self.online_users),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteRequest {
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDeleteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDeleteOutcome {
    pub deleted_count: u64,
    pub message: Option<String>,
}

impl BatchDeleteResponse {
    pub fn into_outcome(self, requested: usize) -> Result<BatchDeleteOutcome, ApiError> {
        ApiError::check(self.success, self.error)?;
        Ok(BatchDeleteOutcome {
            deleted_count: self.deleted_count.unwrap_or(requested as u64),
            message: self.message,
        })
    }
}

/// Frames delivered by the server over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    Message {
        message: InboundMessage,
    },
    Typing {
        user: SenderSummary,
        #[serde(default)]
        is_typing: bool,
    },
    #[serde(alias = "presence_online")]
    UserOnline {
        user_id: UserId,
    },
    #[serde(alias = "presence_offline")]
    UserOffline {
        user_id: UserId,
    },
    #[serde(other)]
    Unknown,
}

/// Frames the client writes to the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Text { content: String },
    MediaUploaded { message_id: MessageId },
    Typing { is_typing: bool },
}
