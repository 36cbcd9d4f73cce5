use std::{future::pending, sync::Arc, time::Duration};

use shared::{
    domain::{ClientTempId, MessageId, MessageKind, RoomId, UserId},
    protocol::{BatchDeleteOutcome, InboundMessage},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::{JoinHandle, JoinSet},
    time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    api::{ChatService, SessionState},
    config::ClientSettings,
    dedup::MessageDeduper,
    error::{EngineError, PermissionError, TransportError, ValidationError},
    presence::PresenceTracker,
    recording::{
        AcquireOutcome, AudioFragment, AudioSource, CaptureStream, Finalized,
        RecordingController, RecordingState,
    },
    selection::SelectionCoordinator,
    transport::{
        DeliverySource, IntentRef, MediaAttachment, OutboundIntent, OutboundPayload,
        SendOutcome, TransportEvent, TransportKind, TransportManager, TransportState,
    },
    typing::{TypingCoordinator, TypingIndicator, TypingSignal},
    validation::{validate_attachment, validate_text},
};

const EVENT_CAPACITY: usize = 1024;
const ELAPSED_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageRendered {
        message: InboundMessage,
        source: DeliverySource,
    },
    MessagesRemoved {
        ids: Vec<MessageId>,
    },
    ConnectionStateChanged(TransportState),
    TransportSelected(TransportKind),
    PresenceChanged {
        online: Vec<UserId>,
    },
    TypingIndicatorChanged(Option<TypingIndicator>),
    RecordingStateChanged(RecordingState),
    RecordingElapsed {
        seconds: u64,
    },
    SelectionChanged {
        active: bool,
        selected: Vec<MessageId>,
    },
    SendQueued {
        client_temp_id: ClientTempId,
        kind: MessageKind,
    },
    SendFailed {
        client_temp_id: ClientTempId,
        kind: MessageKind,
        error: TransportError,
    },
    Notice {
        severity: NoticeSeverity,
        message: String,
    },
}

/// Point-in-time view of the engine's state machines.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub room_id: Option<RoomId>,
    pub transport_state: TransportState,
    pub transport_kind: Option<TransportKind>,
    pub online_users: Vec<UserId>,
    pub typing_indicator: Option<TypingIndicator>,
    pub recording_state: RecordingState,
    pub selected: Vec<MessageId>,
    pub rendered_count: usize,
}

enum EngineCommand {
    Connect(RoomId),
    Send(OutboundIntent),
    UserInput,
    StartRecording,
    StopRecording,
    CancelRecording,
    EnterSelection(MessageId),
    ToggleSelection(MessageId),
    ExitSelection,
    DeleteSelected(oneshot::Sender<Result<Vec<MessageId>, ValidationError>>),
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Teardown,
}

enum Completion {
    Connected(Result<TransportKind, TransportError>),
    Sent {
        intent: IntentRef,
        voice: bool,
        result: Result<SendOutcome, TransportError>,
    },
    MicOpened(Result<CaptureStream, PermissionError>),
    Deleted {
        ids: Vec<MessageId>,
        result: Result<BatchDeleteOutcome, TransportError>,
    },
}

pub struct ChatEngine;

impl ChatEngine {
    /// Spawns the engine actor. Must be called inside a tokio runtime.
    pub fn create(
        settings: ClientSettings,
        session: SessionState,
        service: Arc<dyn ChatService>,
        audio: Arc<dyn AudioSource>,
    ) -> EngineHandle {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (completions, completion_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(TransportManager::new(
            settings.clone(),
            service.clone(),
            session.cookie.clone(),
        ));
        transport.on_inbound(Arc::new(move |event| {
            let _ = transport_tx.send(event);
        }));

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let outbound_task = tokio::spawn(run_outbound(
            transport.clone(),
            outbound_rx,
            completions.clone(),
        ));

        let actor = EngineActor {
            service,
            audio,
            transport,
            events: events.clone(),
            commands: command_rx,
            transport_events: transport_rx,
            completions,
            completion_rx,
            outbound,
            outbound_task,
            tasks: JoinSet::new(),
            room_id: None,
            deduper: MessageDeduper::new(),
            presence: PresenceTracker::new(),
            typing: TypingCoordinator::new(session.user_id.clone(), settings.typing_timeout()),
            recording: RecordingController::new(),
            published_recording: RecordingState::Idle,
            capture: None,
            elapsed: None,
            selection: SelectionCoordinator::new(),
        };
        let task = tokio::spawn(actor.run());

        EngineHandle {
            commands,
            events,
            max_upload_bytes: settings.max_upload_bytes,
            task,
        }
    }
}

/// Owner-side handle to a running engine. Dropping it without calling
/// [`EngineHandle::teardown`] leaves the actor to wind down once the command
/// channel closes.
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    events: broadcast::Sender<ClientEvent>,
    max_upload_bytes: u64,
    task: JoinHandle<()>,
}

impl EngineHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connect(&self, room_id: RoomId) -> Result<(), EngineError> {
        self.command(EngineCommand::Connect(room_id))
    }

    pub fn send_text(&self, content: &str) -> Result<ClientTempId, EngineError> {
        let content = validate_text(content)?;
        self.submit(OutboundIntent::new(OutboundPayload::Text(content.to_string())))
    }

    pub fn send_attachment(&self, attachment: MediaAttachment) -> Result<ClientTempId, EngineError> {
        let kind = validate_attachment(
            &attachment.file_name,
            attachment.bytes.len() as u64,
            self.max_upload_bytes,
        )?;
        self.submit(OutboundIntent::with_kind(
            kind,
            OutboundPayload::Media(attachment),
        ))
    }

    /// A keystroke in the composer.
    pub fn notify_input(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::UserInput)
    }

    pub fn start_recording(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::StartRecording)
    }

    pub fn stop_recording(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::StopRecording)
    }

    pub fn cancel_recording(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::CancelRecording)
    }

    pub fn enter_selection(&self, id: MessageId) -> Result<(), EngineError> {
        self.command(EngineCommand::EnterSelection(id))
    }

    pub fn toggle_selection(&self, id: MessageId) -> Result<(), EngineError> {
        self.command(EngineCommand::ToggleSelection(id))
    }

    pub fn exit_selection(&self) -> Result<(), EngineError> {
        self.command(EngineCommand::ExitSelection)
    }

    /// Starts a batch delete of the current selection and returns the ids
    /// sent. The outcome arrives as `MessagesRemoved` or a notice.
    pub async fn delete_selected(&self) -> Result<Vec<MessageId>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::DeleteSelected(reply))?;
        Ok(rx.await.map_err(|_| EngineError::Closed)??)
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.command(EngineCommand::Snapshot(reply))?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Stops every timer, the push worker and any open capture, then waits for
    /// the actor to exit.
    pub async fn teardown(self) {
        let _ = self.commands.send(EngineCommand::Teardown);
        if let Err(err) = self.task.await {
            warn!(error = %err, "engine: actor ended abnormally");
        }
    }

    fn submit(&self, intent: OutboundIntent) -> Result<ClientTempId, EngineError> {
        let client_temp_id = intent.client_temp_id;
        self.command(EngineCommand::Send(intent))?;
        Ok(client_temp_id)
    }

    fn command(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Closed)
    }
}

enum OutboundJob {
    Connect(RoomId),
    Send { intent: OutboundIntent, voice: bool },
}

/// Runs connects and sends strictly one after another, so submission order
/// holds on every transport and nothing submitted after a connect reaches the
/// transport before it.
async fn run_outbound(
    transport: Arc<TransportManager>,
    mut jobs: mpsc::UnboundedReceiver<OutboundJob>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(job) = jobs.recv().await {
        let completion = match job {
            OutboundJob::Connect(room_id) => Completion::Connected(transport.connect(room_id).await),
            OutboundJob::Send { intent, voice } => {
                let reference = intent.reference();
                Completion::Sent {
                    intent: reference,
                    voice,
                    result: transport.send(intent).await,
                }
            }
        };
        if completions.send(completion).is_err() {
            break;
        }
    }
}

struct EngineActor {
    service: Arc<dyn ChatService>,
    audio: Arc<dyn AudioSource>,
    transport: Arc<TransportManager>,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    outbound: mpsc::UnboundedSender<OutboundJob>,
    outbound_task: JoinHandle<()>,
    tasks: JoinSet<()>,
    room_id: Option<RoomId>,
    deduper: MessageDeduper,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    recording: RecordingController,
    published_recording: RecordingState,
    capture: Option<CaptureStream>,
    elapsed: Option<Interval>,
    selection: SelectionCoordinator,
}

async fn signal_typing(transport: &TransportManager, signal: TypingSignal) {
    transport.send_typing(signal.is_typing()).await;
}

async fn typing_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_fragment(capture: &mut Option<CaptureStream>) -> Option<AudioFragment> {
    match capture {
        Some(stream) => stream.next_fragment().await,
        None => pending().await,
    }
}

async fn elapsed_tick(elapsed: &mut Option<Interval>) {
    match elapsed {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

impl EngineActor {
    async fn run(mut self) {
        info!("engine: started");
        loop {
            let deadline = self.typing.deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(EngineCommand::Teardown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.transport_events.recv() => self.handle_transport_event(event),
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                Some(joined) = self.tasks.join_next() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "engine: background task failed");
                    }
                }
                _ = typing_deadline(deadline) => self.on_typing_deadline().await,
                fragment = next_fragment(&mut self.capture) => self.on_capture(fragment),
                _ = elapsed_tick(&mut self.elapsed) => self.on_elapsed_tick(),
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.request_stop();
        }
        self.elapsed = None;
        self.outbound_task.abort();
        self.tasks.abort_all();
        self.transport.disconnect().await;
        info!("engine: torn down");
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn notice(&self, severity: NoticeSeverity, message: impl Into<String>) {
        self.emit(ClientEvent::Notice {
            severity,
            message: message.into(),
        });
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect(room_id) => {
                self.room_id = Some(room_id.clone());
                if self.outbound.send(OutboundJob::Connect(room_id)).is_err() {
                    self.notice(NoticeSeverity::Error, "Could not connect: engine is stopping");
                }
            }
            EngineCommand::Send(intent) => {
                if matches!(intent.payload, OutboundPayload::Text(_)) {
                    if let Some(signal) = self.typing.on_send() {
                        signal_typing(&self.transport, signal).await;
                    }
                }
                self.enqueue_outbound(intent, false);
            }
            EngineCommand::UserInput => {
                if let Some(signal) = self.typing.on_user_input(Instant::now()) {
                    signal_typing(&self.transport, signal).await;
                }
            }
            EngineCommand::StartRecording => {
                if self.recording.request_start() {
                    let audio = self.audio.clone();
                    let completions = self.completions.clone();
                    self.tasks.spawn(async move {
                        let opened = audio.open().await;
                        let _ = completions.send(Completion::MicOpened(opened));
                    });
                }
            }
            EngineCommand::StopRecording => {
                if self.recording.stop() {
                    self.stop_capture();
                }
                self.publish_recording();
            }
            EngineCommand::CancelRecording => {
                if self.recording.cancel() {
                    self.stop_capture();
                }
                self.publish_recording();
            }
            EngineCommand::EnterSelection(id) => {
                if self.selection.enter(id) {
                    self.publish_selection();
                }
            }
            EngineCommand::ToggleSelection(id) => {
                self.selection.toggle(id);
                self.publish_selection();
            }
            EngineCommand::ExitSelection => {
                if self.selection.is_active() {
                    self.selection.exit();
                    self.publish_selection();
                }
            }
            EngineCommand::DeleteSelected(reply) => {
                let claimed = self.selection.delete_request();
                if let Ok(ids) = &claimed {
                    let service = self.service.clone();
                    let completions = self.completions.clone();
                    let ids = ids.clone();
                    self.tasks.spawn(async move {
                        let result = service.delete_messages(&ids).await;
                        let _ = completions.send(Completion::Deleted { ids, result });
                    });
                }
                let _ = reply.send(claimed);
            }
            EngineCommand::Snapshot(reply) => {
                let snapshot = self.snapshot().await;
                let _ = reply.send(snapshot);
            }
            EngineCommand::Teardown => {}
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { message, source } => self.render(message, source),
            TransportEvent::Typing { user, is_typing } => {
                if self.typing.on_remote_typing(&user, is_typing) {
                    self.emit(ClientEvent::TypingIndicatorChanged(
                        self.typing.indicator().cloned(),
                    ));
                }
            }
            TransportEvent::UserOnline(user_id) => {
                if self.presence.mark_online(user_id) {
                    self.publish_presence();
                }
            }
            TransportEvent::UserOffline(user_id) => {
                if self.presence.mark_offline(&user_id) {
                    self.publish_presence();
                }
            }
            TransportEvent::PresenceSnapshot(users) => {
                if self.presence.replace_snapshot(users) {
                    self.publish_presence();
                }
            }
            TransportEvent::StateChanged(state) => {
                self.emit(ClientEvent::ConnectionStateChanged(state));
            }
            TransportEvent::Undelivered { intents, error } => {
                warn!(count = intents.len(), error = %error, "engine: queued messages were not delivered");
                self.notice(
                    NoticeSeverity::Error,
                    format!("{} message(s) not sent: {error}", intents.len()),
                );
                for intent in intents {
                    self.emit(ClientEvent::SendFailed {
                        client_temp_id: intent.client_temp_id,
                        kind: intent.kind,
                        error: error.clone(),
                    });
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected(Ok(kind)) => {
                self.typing.set_push_enabled(kind == TransportKind::Push);
                self.emit(ClientEvent::TransportSelected(kind));
            }
            Completion::Connected(Err(err)) => {
                warn!(error = %err, "engine: connect failed");
                self.notice(NoticeSeverity::Error, format!("Could not connect: {err}"));
            }
            Completion::Sent {
                intent,
                voice,
                result,
            } => {
                match result {
                    Ok(SendOutcome::Delivered(message)) => {
                        self.render(message, DeliverySource::LocalEcho)
                    }
                    Ok(SendOutcome::Queued) => self.emit(ClientEvent::SendQueued {
                        client_temp_id: intent.client_temp_id,
                        kind: intent.kind,
                    }),
                    Err(error) => {
                        warn!(client_temp_id = %intent.client_temp_id, kind = ?intent.kind, error = %error, "engine: send failed");
                        self.notice(NoticeSeverity::Error, failure_notice(intent.kind, &error));
                        self.emit(ClientEvent::SendFailed {
                            client_temp_id: intent.client_temp_id,
                            kind: intent.kind,
                            error,
                        });
                    }
                }
                if voice {
                    self.recording.on_upload_finished();
                    self.publish_recording();
                }
            }
            Completion::MicOpened(Ok(mut stream)) => {
                match self.recording.on_acquired(Instant::now(), stream.mime_type()) {
                    AcquireOutcome::Capture => {
                        self.capture = Some(stream);
                        let mut ticker =
                            interval_at(Instant::now() + ELAPSED_TICK, ELAPSED_TICK);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        self.elapsed = Some(ticker);
                    }
                    AcquireOutcome::Stop => {
                        debug!("engine: recording stopped while the microphone opened");
                        stream.request_stop();
                        self.capture = Some(stream);
                    }
                    AcquireOutcome::Release => {
                        debug!("engine: recording cancelled while the microphone opened");
                        stream.request_stop();
                    }
                }
                self.publish_recording();
            }
            Completion::MicOpened(Err(err)) => {
                self.recording.on_permission_denied();
                self.notice(NoticeSeverity::Error, err.to_string());
            }
            Completion::Deleted {
                ids,
                result: Ok(outcome),
            } => {
                info!(requested = ids.len(), deleted = outcome.deleted_count, "engine: messages deleted");
                self.selection.on_delete_succeeded();
                self.emit(ClientEvent::MessagesRemoved { ids });
                self.publish_selection();
                if let Some(message) = outcome.message {
                    self.notice(NoticeSeverity::Info, message);
                }
            }
            Completion::Deleted {
                ids,
                result: Err(err),
            } => {
                warn!(requested = ids.len(), error = %err, "engine: delete failed");
                self.selection.on_delete_failed();
                self.notice(
                    NoticeSeverity::Error,
                    format!("Could not delete messages: {err}"),
                );
            }
        }
    }

    fn render(&mut self, message: InboundMessage, source: DeliverySource) {
        if self.deduper.should_render(&message) {
            self.emit(ClientEvent::MessageRendered { message, source });
        } else {
            debug!(message_id = %message.id, ?source, "engine: duplicate suppressed");
        }
    }

    async fn on_typing_deadline(&mut self) {
        if let Some(signal) = self.typing.on_timer(Instant::now()) {
            signal_typing(&self.transport, signal).await;
        }
    }

    fn on_capture(&mut self, fragment: Option<AudioFragment>) {
        if let Some(fragment) = fragment {
            self.recording.on_fragment(fragment);
            return;
        }
        self.capture = None;
        self.elapsed = None;
        match self.recording.on_device_stopped(Instant::now()) {
            Finalized::Upload(clip) => {
                info!(
                    bytes = clip.bytes.len(),
                    duration_seconds = clip.duration_seconds,
                    "engine: uploading voice clip"
                );
                self.enqueue_outbound(OutboundIntent::new(OutboundPayload::Voice(clip)), true);
            }
            Finalized::Discarded => debug!("engine: recording discarded"),
            Finalized::Empty => {
                self.notice(NoticeSeverity::Warning, "No audio was recorded");
            }
            Finalized::Ignored => {}
        }
        self.publish_recording();
    }

    fn on_elapsed_tick(&mut self) {
        if let Some(elapsed) = self.recording.elapsed(Instant::now()) {
            self.emit(ClientEvent::RecordingElapsed {
                seconds: elapsed.as_secs(),
            });
        }
    }

    fn stop_capture(&mut self) {
        self.elapsed = None;
        if let Some(capture) = self.capture.as_mut() {
            capture.request_stop();
        }
    }

    fn enqueue_outbound(&mut self, intent: OutboundIntent, voice: bool) {
        let reference = intent.reference();
        if self.outbound.send(OutboundJob::Send { intent, voice }).is_err() {
            self.emit(ClientEvent::SendFailed {
                client_temp_id: reference.client_temp_id,
                kind: reference.kind,
                error: TransportError::NotConnected,
            });
            if voice {
                self.recording.on_upload_finished();
            }
        }
    }

    fn publish_recording(&mut self) {
        let state = self.recording.state();
        if state != self.published_recording {
            self.published_recording = state;
            self.emit(ClientEvent::RecordingStateChanged(state));
        }
    }

    fn publish_selection(&self) {
        self.emit(ClientEvent::SelectionChanged {
            active: self.selection.is_active(),
            selected: self.selection.selected().cloned().collect(),
        });
    }

    fn publish_presence(&self) {
        self.emit(ClientEvent::PresenceChanged {
            online: self.presence.online_users(),
        });
    }

    async fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            room_id: self.room_id.clone(),
            transport_state: self.transport.state(),
            transport_kind: self.transport.kind().await,
            online_users: self.presence.online_users(),
            typing_indicator: self.typing.indicator().cloned(),
            recording_state: self.recording.state(),
            selected: self.selection.selected().cloned().collect(),
            rendered_count: self.deduper.len(),
        }
    }
}

fn failure_notice(kind: MessageKind, error: &TransportError) -> String {
    let what = match kind {
        MessageKind::Image => "Image",
        MessageKind::Video => "Video",
        MessageKind::Audio => "Audio file",
        MessageKind::Voice => "Voice message",
        MessageKind::File => "File",
        _ => "Message",
    };
    format!("{what} not sent: {error}")
}
