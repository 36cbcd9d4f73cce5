mod poll;
mod push;
mod queue;

use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ClientTempId, MessageKind, RoomId, UserId},
    protocol::{InboundMessage, SenderSummary},
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub use poll::{PollOutcome, SyncCursor};
pub use queue::OutboundQueue;

use crate::{
    api::{retry_transient, ChatService, UploadRequest},
    config::{ClientSettings, TransportMode},
    error::TransportError,
    recording::VoiceClip,
    validation::{classify_attachment, voice_file_name},
};

use self::{poll::PollTransport, push::PushTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    LocalEcho,
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message {
        message: InboundMessage,
        source: DeliverySource,
    },
    Typing {
        user: SenderSummary,
        is_typing: bool,
    },
    UserOnline(UserId),
    UserOffline(UserId),
    PresenceSnapshot(Vec<UserId>),
    StateChanged(TransportState),
    /// Intents accepted as `Queued` that were dropped without being written.
    Undelivered {
        intents: Vec<IntentRef>,
        error: TransportError,
    },
}

pub type InboundHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Media(MediaAttachment),
    Voice(VoiceClip),
}

impl OutboundPayload {
    /// Kind the server files the payload under once stored.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Media(media) => classify_attachment(&media.file_name),
            Self::Voice(_) => MessageKind::Voice,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundIntent {
    pub client_temp_id: ClientTempId,
    pub kind: MessageKind,
    pub payload: OutboundPayload,
}

impl OutboundIntent {
    pub fn new(payload: OutboundPayload) -> Self {
        Self::with_kind(payload.kind(), payload)
    }

    /// For payloads already classified during validation.
    pub fn with_kind(kind: MessageKind, payload: OutboundPayload) -> Self {
        Self {
            client_temp_id: ClientTempId::generate(),
            kind,
            payload,
        }
    }

    pub fn reference(&self) -> IntentRef {
        IntentRef {
            client_temp_id: self.client_temp_id,
            kind: self.kind,
        }
    }
}

/// Identifies an intent after its payload has been handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentRef {
    pub client_temp_id: ClientTempId,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The server stored the message and echoed it back.
    Delivered(InboundMessage),
    /// Accepted by the push channel's outbound queue; the message arrives later
    /// as a push frame.
    Queued,
}

#[async_trait]
pub(crate) trait TransportStrategy: Send + Sync {
    fn kind(&self) -> TransportKind;
    /// `false` once the strategy's workers have exited for good.
    fn is_alive(&self) -> bool;
    async fn send(&self, intent: OutboundIntent) -> Result<SendOutcome, TransportError>;
    async fn send_typing(&self, is_typing: bool);
    async fn shutdown(&self);
}

/// Delivers strategy output to the registered handler and publishes state.
#[derive(Clone)]
pub(crate) struct Emitter {
    handler: Option<InboundHandler>,
    state: Arc<watch::Sender<TransportState>>,
}

impl Emitter {
    pub(crate) fn emit(&self, event: TransportEvent) {
        match &self.handler {
            Some(handler) => handler(event),
            None => debug!(?event, "transport: no inbound handler registered"),
        }
    }

    pub(crate) fn set_state(&self, next: TransportState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "transport: state changed");
            self.emit(TransportEvent::StateChanged(next));
        }
    }
}

struct ActiveTransport {
    room_id: RoomId,
    strategy: Arc<dyn TransportStrategy>,
}

/// Owns at most one delivery strategy and gives callers a single surface for
/// sending and receiving regardless of which one is active.
pub struct TransportManager {
    settings: ClientSettings,
    cookie: Option<String>,
    service: Arc<dyn ChatService>,
    handler: StdMutex<Option<InboundHandler>>,
    state: Arc<watch::Sender<TransportState>>,
    active: Mutex<Option<ActiveTransport>>,
    /// Held for the whole of `connect`; sends wait on it instead of failing
    /// while a handshake is in progress.
    connecting: Mutex<()>,
}

impl TransportManager {
    pub fn new(
        settings: ClientSettings,
        service: Arc<dyn ChatService>,
        cookie: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            settings,
            cookie,
            service,
            handler: StdMutex::new(None),
            state: Arc::new(state),
            active: Mutex::new(None),
            connecting: Mutex::new(()),
        }
    }

    /// Registers the sink for inbound events. Takes effect on the next
    /// `connect`.
    pub fn on_inbound(&self, handler: InboundHandler) {
        *self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    pub async fn kind(&self) -> Option<TransportKind> {
        self.strategy().await.map(|strategy| strategy.kind())
    }

    pub async fn connect(&self, room_id: RoomId) -> Result<TransportKind, TransportError> {
        let _connecting = self.connecting.lock().await;
        self.stop_active().await;

        let emitter = Emitter {
            handler: self
                .handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            state: self.state.clone(),
        };
        let push_url = self.settings.push_url(&room_id);
        if self.settings.transport_mode == TransportMode::Push && push_url.is_err() {
            return Err(TransportError::Channel(format!(
                "invalid push channel url for room {room_id}"
            )));
        }
        emitter.set_state(TransportState::Connecting);

        let strategy: Arc<dyn TransportStrategy> = match (self.settings.transport_mode, push_url) {
            (TransportMode::Poll, _) => self.start_poll(&room_id, emitter),
            (TransportMode::Push, Ok(url)) => {
                let stream = match push::open_channel(&url, self.cookie.as_deref()).await {
                    Ok(stream) => Some(stream),
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "push: initial handshake failed");
                        None
                    }
                };
                self.start_push(&room_id, url, stream, emitter)
            }
            (TransportMode::Push | TransportMode::Auto, push_url) => {
                let opened = match push_url {
                    Ok(url) => push::open_channel(&url, self.cookie.as_deref())
                        .await
                        .map(|stream| (url, stream)),
                    Err(err) => Err(TransportError::Channel(err.to_string())),
                };
                match opened {
                    Ok((url, stream)) => self.start_push(&room_id, url, Some(stream), emitter),
                    Err(err) => {
                        info!(room_id = %room_id, error = %err, "transport: push unavailable, falling back to polling");
                        self.start_poll(&room_id, emitter)
                    }
                }
            }
        };

        let kind = strategy.kind();
        info!(room_id = %room_id, ?kind, "transport: connected strategy");
        *self.active.lock().await = Some(ActiveTransport { room_id, strategy });
        Ok(kind)
    }

    /// Waits out a `connect` in progress, then hands the intent to the active
    /// strategy.
    pub async fn send(&self, intent: OutboundIntent) -> Result<SendOutcome, TransportError> {
        drop(self.connecting.lock().await);
        let strategy = self.strategy().await.ok_or(TransportError::NotConnected)?;
        strategy.send(intent).await
    }

    pub async fn send_typing(&self, is_typing: bool) {
        if let Some(strategy) = self.strategy().await {
            strategy.send_typing(is_typing).await;
        }
    }

    pub async fn disconnect(&self) {
        let _connecting = self.connecting.lock().await;
        self.stop_active().await;
        let _ = self.state.send_if_modified(|current| {
            if *current == TransportState::Disconnected {
                return false;
            }
            *current = TransportState::Disconnected;
            true
        });
    }

    async fn stop_active(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.strategy.shutdown().await;
            info!(room_id = %active.room_id, "transport: disconnected");
        }
    }

    async fn strategy(&self) -> Option<Arc<dyn TransportStrategy>> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|active| active.strategy.is_alive())
            .map(|active| active.strategy.clone())
    }

    fn start_poll(&self, room_id: &RoomId, emitter: Emitter) -> Arc<dyn TransportStrategy> {
        Arc::new(PollTransport::start(
            room_id.clone(),
            self.service.clone(),
            &self.settings,
            emitter,
        ))
    }

    fn start_push(
        &self,
        room_id: &RoomId,
        url: url::Url,
        stream: Option<push::PushStream>,
        emitter: Emitter,
    ) -> Arc<dyn TransportStrategy> {
        Arc::new(PushTransport::start(
            room_id.clone(),
            url,
            self.cookie.clone(),
            self.service.clone(),
            &self.settings,
            stream,
            emitter,
        ))
    }
}

/// Request/response delivery of one intent with the per-intent retry budget.
pub(crate) async fn deliver_over_http(
    service: &dyn ChatService,
    room_id: &RoomId,
    settings: &ClientSettings,
    intent: OutboundIntent,
) -> Result<InboundMessage, TransportError> {
    debug!(
        client_temp_id = %intent.client_temp_id,
        kind = ?intent.kind,
        "transport: delivering over http"
    );
    let request = match intent.payload {
        OutboundPayload::Media(media) => UploadRequest {
            room_id: room_id.clone(),
            file_name: media.file_name,
            bytes: media.bytes,
            mime_type: media.mime_type,
            caption: media.caption,
            duration_seconds: None,
        },
        OutboundPayload::Voice(clip) => UploadRequest {
            room_id: room_id.clone(),
            file_name: voice_file_name(&clip.mime_type, Utc::now().timestamp_millis()),
            bytes: clip.bytes,
            mime_type: Some(clip.mime_type),
            caption: None,
            duration_seconds: Some(clip.duration_seconds),
        },
        OutboundPayload::Text(content) => {
            return retry_transient(
                settings.send_retry_attempts,
                settings.send_retry_delay(),
                "send",
                || service.send_text(room_id, &content),
            )
            .await
        }
    };
    retry_transient(
        settings.send_retry_attempts,
        settings.send_retry_delay(),
        "upload",
        || service.upload(request.clone()),
    )
    .await
}

/// Periodic presence snapshots, the first one immediately. Fetching the
/// snapshot is also what keeps the local user marked online server-side.
pub(crate) fn spawn_presence_refresh(
    service: Arc<dyn ChatService>,
    emitter: Emitter,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match service.online_users().await {
                Ok(users) => emitter.emit(TransportEvent::PresenceSnapshot(users)),
                // left for the next tick
                Err(err) => warn!(error = %err, "presence: snapshot failed"),
            }
        }
    })
}

#[cfg(test)]
#[path = "../tests/transport_tests.rs"]
mod tests;
