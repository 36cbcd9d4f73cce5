use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{
    header::{COOKIE, REFERER},
    multipart::{Form, Part},
    Client, RequestBuilder,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{
        BatchDeleteOutcome, BatchDeleteRequest, BatchDeleteResponse, InboundMessage,
        PollResponse, PresenceResponse, SendMessageResponse,
    },
};
use tracing::{debug, warn};

use crate::error::TransportError;

pub const CSRF_HEADER: &str = "X-CSRFToken";

/// Authenticated session the HTTP endpoints and the push handshake ride on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub user_id: UserId,
    pub csrf_token: Option<String>,
    /// Raw `Cookie` header value, e.g. `sessionid=...; csrftoken=...`.
    pub cookie: Option<String>,
}

impl SessionState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            csrf_token: None,
            cookie: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub room_id: RoomId,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
    pub duration_seconds: Option<u32>,
}

/// Request/response surface of the chat server.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send_text(
        &self,
        room_id: &RoomId,
        content: &str,
    ) -> Result<InboundMessage, TransportError>;

    async fn upload(&self, request: UploadRequest) -> Result<InboundMessage, TransportError>;

    /// Messages strictly newer than `since`, oldest first. `None` returns the
    /// most recent page.
    async fn fetch_since(
        &self,
        room_id: &RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundMessage>, TransportError>;

    async fn online_users(&self) -> Result<Vec<UserId>, TransportError>;

    async fn delete_messages(
        &self,
        ids: &[MessageId],
    ) -> Result<BatchDeleteOutcome, TransportError>;
}

pub struct HttpChatService {
    http: Client,
    base_url: String,
    session: SessionState,
}

impl HttpChatService {
    pub fn new(base_url: impl Into<String>, session: SessionState) -> Self {
        Self::with_client(Client::new(), base_url, session)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, session: SessionState) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authenticated(self.http.get(format!("{}{path}", self.base_url)))
    }

    /// Mutating requests also carry the CSRF token and a same-origin referer.
    fn post(&self, path: &str) -> RequestBuilder {
        let mut request = self.authenticated(self.http.post(format!("{}{path}", self.base_url)));
        if let Some(token) = &self.session.csrf_token {
            request = request
                .header(CSRF_HEADER, token)
                .header(REFERER, format!("{}/", self.base_url));
        }
        request
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session.cookie {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }
}

async fn read_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, TransportError> {
    let response = request.send().await?.error_for_status()?;
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|err| TransportError::Decode(err.to_string()))
}

#[async_trait]
impl ChatService for HttpChatService {
    async fn send_text(
        &self,
        room_id: &RoomId,
        content: &str,
    ) -> Result<InboundMessage, TransportError> {
        let response: SendMessageResponse = read_json(
            self.post(&format!("/api/send-message/{room_id}/"))
                .form(&[("content", content)]),
        )
        .await?;
        Ok(response.into_message()?)
    }

    async fn upload(&self, request: UploadRequest) -> Result<InboundMessage, TransportError> {
        let size = request.bytes.len();
        let mut part = Part::bytes(request.bytes).file_name(request.file_name.clone());
        if let Some(mime_type) = &request.mime_type {
            part = part
                .mime_str(mime_type)
                .map_err(|err| TransportError::Decode(format!("invalid mime type: {err}")))?;
        }
        let mut form = Form::new()
            .part("file", part)
            .text("room_id", request.room_id.to_string());
        if let Some(caption) = request.caption {
            form = form.text("caption", caption);
        }
        if let Some(duration) = request.duration_seconds {
            form = form.text("duration", duration.to_string());
        }

        debug!(
            room_id = %request.room_id,
            file_name = %request.file_name,
            size,
            "api: uploading attachment"
        );
        let response: SendMessageResponse =
            read_json(self.post("/api/upload/").multipart(form)).await?;
        Ok(response.into_message()?)
    }

    async fn fetch_since(
        &self,
        room_id: &RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let mut request = self.get(&format!("/api/get-messages/{room_id}/"));
        if let Some(since) = since {
            request = request.query(&[(
                "last_time",
                since.to_rfc3339_opts(SecondsFormat::Micros, true),
            )]);
        }
        let response: PollResponse = read_json(request).await?;
        Ok(response.into_messages()?)
    }

    async fn online_users(&self) -> Result<Vec<UserId>, TransportError> {
        let response: PresenceResponse = read_json(self.get("/api/online-status/")).await?;
        Ok(response.into_online_users()?)
    }

    async fn delete_messages(
        &self,
        ids: &[MessageId],
    ) -> Result<BatchDeleteOutcome, TransportError> {
        let body = BatchDeleteRequest {
            message_ids: ids.to_vec(),
        };
        let response: BatchDeleteResponse =
            read_json(self.post("/api/delete-messages/").json(&body)).await?;
        Ok(response.into_outcome(ids.len())?)
    }
}

/// Runs `op` up to `attempts` times, sleeping `delay` between tries, while the
/// failure is transient. Permanent failures are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    label: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= attempts => {
                return Err(TransportError::Exhausted {
                    attempts,
                    last: Box::new(err),
                })
            }
            Err(err) => {
                warn!(attempt, attempts, error = %err, "{label}: transient failure, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
