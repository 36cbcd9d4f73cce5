use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::RoomId,
    protocol::{ClientFrame, PushFrame},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    deliver_over_http, queue::OutboundQueue, spawn_presence_refresh, DeliverySource, Emitter,
    IntentRef, OutboundIntent, OutboundPayload, SendOutcome, TransportEvent, TransportKind,
    TransportState, TransportStrategy,
};
use crate::{
    api::ChatService, config::ClientSettings, error::TransportError, reconnect::ReconnectPolicy,
};

pub(crate) type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) async fn open_channel(
    url: &Url,
    cookie: Option<&str>,
) -> Result<PushStream, TransportError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| TransportError::Channel(err.to_string()))?;
    if let Some(cookie) = cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|err| TransportError::Channel(format!("invalid session cookie: {err}")))?;
        request.headers_mut().insert(COOKIE, value);
    }
    let (stream, _) = connect_async(request)
        .await
        .map_err(|err| TransportError::Channel(err.to_string()))?;
    Ok(stream)
}

#[derive(Debug)]
enum PushCommand {
    Enqueue(ClientFrame, Option<IntentRef>),
    Typing(bool),
    Shutdown,
}

enum SessionEnd {
    Lost(TransportError),
    Shutdown,
}

enum Backoff {
    Elapsed,
    Shutdown,
    Exhausted,
}

pub(crate) struct PushTransport {
    room_id: RoomId,
    service: Arc<dyn ChatService>,
    settings: ClientSettings,
    commands: mpsc::UnboundedSender<PushCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    presence: JoinHandle<()>,
}

impl PushTransport {
    /// Spawns the channel worker. Without an already open `stream` the worker
    /// starts in `Reconnecting` and opens the channel itself.
    pub(crate) fn start(
        room_id: RoomId,
        url: Url,
        cookie: Option<String>,
        service: Arc<dyn ChatService>,
        settings: &ClientSettings,
        stream: Option<PushStream>,
        emitter: Emitter,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = PushWorker {
            room_id: room_id.clone(),
            url,
            cookie,
            policy: ReconnectPolicy::from_settings(&settings.reconnect),
            queue: OutboundQueue::new(),
            commands: command_rx,
            emitter: emitter.clone(),
        };
        let worker = tokio::spawn(worker.run(stream));
        let presence =
            spawn_presence_refresh(service.clone(), emitter, settings.presence_interval());

        Self {
            room_id,
            service,
            settings: settings.clone(),
            commands,
            worker: Mutex::new(Some(worker)),
            presence,
        }
    }

    fn enqueue(&self, frame: ClientFrame, intent: Option<IntentRef>) -> Result<(), TransportError> {
        self.commands
            .send(PushCommand::Enqueue(frame, intent))
            .map_err(|_| TransportError::NotConnected)
    }
}

impl Drop for PushTransport {
    fn drop(&mut self) {
        self.presence.abort();
    }
}

#[async_trait]
impl TransportStrategy for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn send(&self, intent: OutboundIntent) -> Result<SendOutcome, TransportError> {
        if let OutboundPayload::Text(content) = &intent.payload {
            let frame = ClientFrame::Text {
                content: content.clone(),
            };
            self.enqueue(frame, Some(intent.reference()))?;
            return Ok(SendOutcome::Queued);
        }
        let message =
            deliver_over_http(self.service.as_ref(), &self.room_id, &self.settings, intent)
                .await?;
        // The message is already stored; a lost announcement is not a send failure.
        self.enqueue(
            ClientFrame::MediaUploaded {
                message_id: message.id.clone(),
            },
            None,
        )?;
        Ok(SendOutcome::Delivered(message))
    }

    async fn send_typing(&self, is_typing: bool) {
        let _ = self.commands.send(PushCommand::Typing(is_typing));
    }

    async fn shutdown(&self) {
        self.presence.abort();
        let _ = self.commands.send(PushCommand::Shutdown);
        if let Some(mut worker) = self.worker.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut worker)
                .await
                .is_err()
            {
                warn!(room_id = %self.room_id, "push: worker did not stop in time, aborting");
                worker.abort();
            }
        }
    }
}

/// Owns the socket, the outbound queue and the reconnect loop.
struct PushWorker {
    room_id: RoomId,
    url: Url,
    cookie: Option<String>,
    policy: ReconnectPolicy,
    queue: OutboundQueue,
    commands: mpsc::UnboundedReceiver<PushCommand>,
    emitter: Emitter,
}

impl PushWorker {
    async fn run(mut self, mut stream: Option<PushStream>) {
        let mut last_error = TransportError::Channel("push channel never opened".into());
        if stream.is_none() {
            self.emitter.set_state(TransportState::Reconnecting);
        }
        let failure = loop {
            let socket = match stream.take() {
                Some(socket) => socket,
                None => {
                    match self.wait_backoff().await {
                        Backoff::Elapsed => {}
                        Backoff::Shutdown => break TransportError::NotConnected,
                        Backoff::Exhausted => {
                            break TransportError::Exhausted {
                                attempts: self.policy.attempts(),
                                last: Box::new(last_error),
                            }
                        }
                    }
                    match open_channel(&self.url, self.cookie.as_deref()).await {
                        Ok(socket) => socket,
                        Err(err) => {
                            warn!(room_id = %self.room_id, error = %err, "push: reconnect attempt failed");
                            last_error = err;
                            continue;
                        }
                    }
                }
            };

            self.policy.reset();
            self.emitter.set_state(TransportState::Connected);
            info!(room_id = %self.room_id, queued = self.queue.len(), "push: channel opened");

            match self.serve(socket).await {
                SessionEnd::Shutdown => break TransportError::NotConnected,
                SessionEnd::Lost(err) => {
                    info!(room_id = %self.room_id, queued = self.queue.len(), error = %err, "push: channel closed");
                    last_error = err;
                    self.emitter.set_state(TransportState::Reconnecting);
                }
            }
        };
        self.abandon_queue(failure);
        self.emitter.set_state(TransportState::Disconnected);
    }

    /// Reports every intent still waiting, including ones sent after the
    /// worker stopped reading commands.
    fn abandon_queue(&mut self, error: TransportError) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let PushCommand::Enqueue(frame, intent) = command {
                self.queue.push_back(frame, intent);
            }
        }
        if self.queue.is_empty() {
            return;
        }
        let dropped = self.queue.len();
        let intents = self.queue.abandon();
        warn!(room_id = %self.room_id, dropped, error = %error, "push: discarding undelivered frames");
        if !intents.is_empty() {
            self.emitter
                .emit(TransportEvent::Undelivered { intents, error });
        }
    }

    async fn serve(&mut self, socket: PushStream) -> SessionEnd {
        let (mut sink, mut frames) = socket.split();

        if let Err(err) = self.queue.flush(&mut sink).await {
            warn!(room_id = %self.room_id, error = %err, "push: flush failed");
            return SessionEnd::Lost(err);
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(PushCommand::Shutdown) => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                    Some(PushCommand::Enqueue(frame, intent)) => {
                        self.queue.push_back(frame, intent);
                        if let Err(err) = self.queue.flush(&mut sink).await {
                            warn!(room_id = %self.room_id, error = %err, "push: write failed");
                            return SessionEnd::Lost(err);
                        }
                    }
                    Some(PushCommand::Typing(is_typing)) => {
                        let frame = ClientFrame::Typing { is_typing };
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(room_id = %self.room_id, error = %err, "push: typing write failed");
                            return SessionEnd::Lost(TransportError::Channel(err.to_string()));
                        }
                    }
                },
                incoming = frames.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost(TransportError::Channel(
                            "closed by server".into(),
                        ))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(room_id = %self.room_id, error = %err, "push: read failed");
                        return SessionEnd::Lost(TransportError::Channel(err.to_string()));
                    }
                },
            }
        }
    }

    /// Sleeps out the next backoff delay while still accepting frames for the
    /// queue.
    async fn wait_backoff(&mut self) -> Backoff {
        let Some(delay) = self.policy.next_delay() else {
            warn!(room_id = %self.room_id, attempts = self.policy.attempts(), "push: reconnect budget exhausted");
            return Backoff::Exhausted;
        };
        debug!(
            room_id = %self.room_id,
            attempt = self.policy.attempts(),
            delay_ms = delay.as_millis() as u64,
            "push: scheduling reconnect"
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Backoff::Elapsed,
                command = self.commands.recv() => match command {
                    None | Some(PushCommand::Shutdown) => return Backoff::Shutdown,
                    Some(PushCommand::Enqueue(frame, intent)) => self.queue.push_back(frame, intent),
                    Some(PushCommand::Typing(_)) => {}
                },
            }
        }
    }

    fn dispatch(&self, raw: &str) {
        let frame = match serde_json::from_str::<PushFrame>(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(room_id = %self.room_id, error = %err, "push: dropping malformed frame");
                return;
            }
        };
        let event = match frame {
            PushFrame::Message { message } => TransportEvent::Message {
                message,
                source: DeliverySource::Push,
            },
            PushFrame::Typing { user, is_typing } => TransportEvent::Typing { user, is_typing },
            PushFrame::UserOnline { user_id } => TransportEvent::UserOnline(user_id),
            PushFrame::UserOffline { user_id } => TransportEvent::UserOffline(user_id),
            PushFrame::Unknown => {
                debug!(room_id = %self.room_id, frame = raw, "push: ignoring unrecognized frame");
                return;
            }
        };
        self.emitter.emit(event);
    }
}
