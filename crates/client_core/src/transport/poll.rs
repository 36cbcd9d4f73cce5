use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::RoomId;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{
    deliver_over_http, spawn_presence_refresh, DeliverySource, Emitter, OutboundIntent,
    SendOutcome, TransportEvent, TransportKind, TransportState, TransportStrategy,
};
use crate::{api::ChatService, config::ClientSettings, error::TransportError};

/// High-water mark of `created_at` values seen in poll responses. Never moves
/// backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    last_seen: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    /// Returns whether the cursor moved.
    pub fn observe(&mut self, created_at: DateTime<Utc>) -> bool {
        match self.last_seen {
            Some(current) if current >= created_at => false,
            _ => {
                self.last_seen = Some(created_at);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another fetch was still outstanding.
    Skipped,
    Fetched(usize),
    Failed,
}

pub(crate) struct PollWorker {
    room_id: RoomId,
    service: Arc<dyn ChatService>,
    cursor: Mutex<SyncCursor>,
    in_flight: AtomicBool,
    emitter: Emitter,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PollWorker {
    pub(crate) fn new(room_id: RoomId, service: Arc<dyn ChatService>, emitter: Emitter) -> Self {
        Self {
            room_id,
            service,
            cursor: Mutex::new(SyncCursor::default()),
            in_flight: AtomicBool::new(false),
            emitter,
        }
    }

    pub(crate) async fn cursor(&self) -> SyncCursor {
        *self.cursor.lock().await
    }

    /// One fetch-since-cursor round. Every returned message advances the
    /// cursor and is handed on; dedup happens downstream.
    pub(crate) async fn tick(&self) -> PollOutcome {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!(room_id = %self.room_id, "poll: fetch still in flight, skipping tick");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let since = self.cursor.lock().await.last_seen();
        match self.service.fetch_since(&self.room_id, since).await {
            Ok(messages) => {
                {
                    let mut cursor = self.cursor.lock().await;
                    for message in &messages {
                        cursor.observe(message.created_at);
                    }
                }
                self.emitter.set_state(TransportState::Connected);
                let count = messages.len();
                for message in messages {
                    self.emitter.emit(TransportEvent::Message {
                        message,
                        source: DeliverySource::Poll,
                    });
                }
                PollOutcome::Fetched(count)
            }
            Err(err) => {
                warn!(room_id = %self.room_id, error = %err, "poll: fetch failed");
                self.emitter.set_state(TransportState::Reconnecting);
                PollOutcome::Failed
            }
        }
    }
}

pub(crate) struct PollTransport {
    room_id: RoomId,
    service: Arc<dyn ChatService>,
    settings: ClientSettings,
    emitter: Emitter,
    fetch_task: JoinHandle<()>,
    presence_task: JoinHandle<()>,
}

impl PollTransport {
    pub(crate) fn start(
        room_id: RoomId,
        service: Arc<dyn ChatService>,
        settings: &ClientSettings,
        emitter: Emitter,
    ) -> Self {
        emitter.set_state(TransportState::Connected);

        let worker = Arc::new(PollWorker::new(
            room_id.clone(),
            service.clone(),
            emitter.clone(),
        ));
        let poll_interval = settings.poll_interval();
        let fetch_task = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                worker.tick().await;
            }
        });

        let presence_task = spawn_presence_refresh(
            service.clone(),
            emitter.clone(),
            settings.presence_interval(),
        );

        Self {
            room_id,
            service,
            settings: settings.clone(),
            emitter,
            fetch_task,
            presence_task,
        }
    }
}

#[async_trait]
impl TransportStrategy for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn is_alive(&self) -> bool {
        !self.fetch_task.is_finished()
    }

    async fn send(&self, intent: OutboundIntent) -> Result<SendOutcome, TransportError> {
        let message =
            deliver_over_http(self.service.as_ref(), &self.room_id, &self.settings, intent)
                .await?;
        Ok(SendOutcome::Delivered(message))
    }

    async fn send_typing(&self, _is_typing: bool) {}

    async fn shutdown(&self) {
        self.fetch_task.abort();
        self.presence_task.abort();
        self.emitter.set_state(TransportState::Disconnected);
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        self.fetch_task.abort();
        self.presence_task.abort();
    }
}
