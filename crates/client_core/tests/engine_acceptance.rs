use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::{DateTime, TimeZone, Utc};
use client_core::{
    AudioSource, CaptureStream, ChatEngine, ChatService, ClientEvent, ClientSettings,
    DeliverySource, EngineError, EngineHandle, MediaAttachment, MissingAudioSource,
    NoticeSeverity, PermissionError, RecordingState, SessionState, TransportError,
    TransportKind, TransportMode, UploadRequest, ValidationError,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    protocol::{BatchDeleteOutcome, InboundMessage, SenderSummary},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(5);

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn message(id: &str, sender: &str, seconds: i64) -> InboundMessage {
    InboundMessage {
        id: MessageId::from(id),
        content: format!("text {id}"),
        kind: MessageKind::Text,
        sender: SenderSummary {
            id: UserId::from(sender),
            username: sender.to_string(),
            first_name: None,
            last_name: None,
            profile_picture: None,
        },
        created_at: at(seconds),
        file_url: None,
        file_size: None,
        duration_seconds: None,
    }
}

/// In-memory server that filters like the real endpoint: strictly newer than
/// `last_time`.
#[derive(Default)]
struct FakeChatServer {
    store: Mutex<Vec<InboundMessage>>,
    uploads: Mutex<Vec<UploadRequest>>,
    deleted: Mutex<Vec<Vec<MessageId>>>,
    fetches: AtomicUsize,
    reject_uploads: AtomicBool,
}

impl FakeChatServer {
    fn seeded(messages: Vec<InboundMessage>) -> Self {
        Self {
            store: Mutex::new(messages),
            ..Self::default()
        }
    }

    async fn append(&self, id: String, sender: &str, content: &str) -> InboundMessage {
        let mut store = self.store.lock().await;
        let seconds = 100 + store.len() as i64;
        let mut stored = message(&id, sender, seconds);
        stored.content = content.to_string();
        store.push(stored.clone());
        stored
    }
}

#[async_trait]
impl ChatService for FakeChatServer {
    async fn send_text(
        &self,
        _room_id: &RoomId,
        content: &str,
    ) -> Result<InboundMessage, TransportError> {
        let id = format!("echo-{}", self.store.lock().await.len());
        Ok(self.append(id, "me", content).await)
    }

    async fn upload(&self, request: UploadRequest) -> Result<InboundMessage, TransportError> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(TransportError::Status(413));
        }
        let caption = request.caption.clone().unwrap_or_default();
        self.uploads.lock().await.push(request);
        let id = format!("file-{}", self.store.lock().await.len());
        Ok(self.append(id, "me", &caption).await)
    }

    async fn fetch_since(
        &self,
        _room_id: &RoomId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let store = self.store.lock().await;
        Ok(store
            .iter()
            .filter(|message| since.map_or(true, |since| message.created_at > since))
            .cloned()
            .collect())
    }

    async fn online_users(&self) -> Result<Vec<UserId>, TransportError> {
        Ok(vec![UserId::from("me"), UserId::from("u2")])
    }

    async fn delete_messages(
        &self,
        ids: &[MessageId],
    ) -> Result<BatchDeleteOutcome, TransportError> {
        self.deleted.lock().await.push(ids.to_vec());
        Ok(BatchDeleteOutcome {
            deleted_count: ids.len() as u64,
            message: None,
        })
    }
}

/// Microphone that emits the given fragments, then waits for a stop request
/// and closes.
struct ScriptedMicrophone {
    fragments: Vec<Vec<u8>>,
}

#[async_trait]
impl AudioSource for ScriptedMicrophone {
    async fn open(&self) -> Result<CaptureStream, PermissionError> {
        let (fragment_tx, fragment_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let fragments = self.fragments.clone();
        tokio::spawn(async move {
            for fragment in fragments {
                if fragment_tx.send(fragment).await.is_err() {
                    return;
                }
            }
            let _ = stop_rx.await;
        });
        Ok(CaptureStream::new(fragment_rx, stop_tx, "audio/ogg"))
    }
}

fn poll_settings() -> ClientSettings {
    ClientSettings {
        transport_mode: TransportMode::Poll,
        poll_interval_ms: 50,
        presence_interval_ms: 60_000,
        send_retry_delay_ms: 1,
        ..ClientSettings::default()
    }
}

fn start_engine(
    server: Arc<FakeChatServer>,
    audio: Arc<dyn AudioSource>,
) -> (EngineHandle, broadcast::Receiver<ClientEvent>) {
    start_engine_with(poll_settings(), server, audio)
}

fn start_engine_with(
    settings: ClientSettings,
    server: Arc<FakeChatServer>,
    audio: Arc<dyn AudioSource>,
) -> (EngineHandle, broadcast::Receiver<ClientEvent>) {
    let engine = ChatEngine::create(
        settings,
        SessionState::new(UserId::from("me")),
        server,
        audio,
    );
    let events = engine.subscribe_events();
    (engine, events)
}

async fn next_event<F>(events: &mut broadcast::Receiver<ClientEvent>, mut wanted: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("engine event stream closed"),
            }
        }
    })
    .await
    .expect("expected event in time")
}

async fn wait_for_fetches(server: &FakeChatServer, count: usize) {
    timeout(WAIT, async {
        while server.fetches.load(Ordering::SeqCst) < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poll ticks in time");
}

fn rendered_ids(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<(MessageId, DeliverySource)> {
    let mut rendered = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::MessageRendered { message, source } = event {
            rendered.push((message.id, source));
        }
    }
    rendered
}

#[tokio::test]
async fn poll_history_and_local_echo_render_exactly_once() {
    let server = Arc::new(FakeChatServer::seeded(vec![
        message("m1", "u2", 1),
        message("m2", "u2", 2),
        message("m3", "u2", 3),
    ]));
    let (engine, mut events) = start_engine(server.clone(), Arc::new(MissingAudioSource));
    let mut observer = engine.subscribe_events();

    engine.connect(RoomId::from("r1")).expect("connect");
    for expected in ["m1", "m2", "m3"] {
        let event = next_event(&mut events, |event| {
            matches!(event, ClientEvent::MessageRendered { .. })
        })
        .await;
        let ClientEvent::MessageRendered { message, source } = event else {
            unreachable!();
        };
        assert_eq!(message.id, MessageId::from(expected));
        assert_eq!(source, DeliverySource::Poll);
    }

    engine.send_text("  hello  ").expect("valid text");
    let echoed = next_event(&mut events, |event| {
        matches!(event, ClientEvent::MessageRendered { .. })
    })
    .await;
    let ClientEvent::MessageRendered { message, .. } = echoed else {
        unreachable!();
    };
    assert_eq!(message.id, MessageId::from("echo-3"));
    assert_eq!(message.content, "hello");

    let seen = server.fetches.load(Ordering::SeqCst);
    wait_for_fetches(&server, seen + 3).await;

    let rendered = rendered_ids(&mut observer);
    let ids: Vec<&str> = rendered.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "echo-3"]);

    let snapshot = engine.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.rendered_count, 4);
    assert_eq!(snapshot.room_id, Some(RoomId::from("r1")));
    assert!(snapshot.online_users.contains(&UserId::from("u2")));

    engine.teardown().await;
}

#[tokio::test]
async fn cancelling_before_any_audio_never_uploads() {
    let server = Arc::new(FakeChatServer::default());
    let (engine, mut events) = start_engine(
        server.clone(),
        Arc::new(ScriptedMicrophone {
            fragments: Vec::new(),
        }),
    );

    engine.start_recording().expect("start");
    next_event(&mut events, |event| {
        matches!(event, ClientEvent::RecordingStateChanged(RecordingState::Capturing))
    })
    .await;

    engine.cancel_recording().expect("cancel");
    next_event(&mut events, |event| {
        matches!(event, ClientEvent::RecordingStateChanged(RecordingState::Cancelled))
    })
    .await;

    let snapshot = engine.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.recording_state, RecordingState::Cancelled);
    assert!(server.uploads.lock().await.is_empty());

    engine.teardown().await;
}

#[tokio::test]
async fn stopped_recording_uploads_one_voice_clip() {
    let server = Arc::new(FakeChatServer::default());
    let (engine, mut events) = start_engine(
        server.clone(),
        Arc::new(ScriptedMicrophone {
            fragments: vec![vec![1, 2], vec![3]],
        }),
    );
    engine.connect(RoomId::from("r1")).expect("connect");

    engine.start_recording().expect("start");
    next_event(&mut events, |event| {
        matches!(event, ClientEvent::RecordingStateChanged(RecordingState::Capturing))
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    engine.stop_recording().expect("stop");

    next_event(&mut events, |event| {
        matches!(event, ClientEvent::RecordingStateChanged(RecordingState::Idle))
    })
    .await;

    let uploads = server.uploads.lock().await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].bytes, vec![1, 2, 3]);
    assert!(uploads[0].file_name.starts_with("voice_"));
    assert_eq!(uploads[0].mime_type.as_deref(), Some("audio/ogg"));
    assert!(uploads[0].duration_seconds.is_some());
    drop(uploads);

    engine.teardown().await;
}

#[tokio::test]
async fn denied_microphone_surfaces_notice_and_stays_idle() {
    let (engine, mut events) = start_engine(
        Arc::new(FakeChatServer::default()),
        Arc::new(MissingAudioSource),
    );
    engine.start_recording().expect("start");

    let notice = next_event(&mut events, |event| {
        matches!(event, ClientEvent::Notice { .. })
    })
    .await;
    assert!(matches!(
        notice,
        ClientEvent::Notice {
            severity: NoticeSeverity::Error,
            ..
        }
    ));
    assert_eq!(
        engine.snapshot().await.expect("snapshot").recording_state,
        RecordingState::Idle
    );
    engine.teardown().await;
}

#[tokio::test]
async fn batch_delete_removes_selection_and_exits() {
    let server = Arc::new(FakeChatServer::default());
    let (engine, mut events) = start_engine(server.clone(), Arc::new(MissingAudioSource));

    assert!(matches!(
        engine.delete_selected().await,
        Err(EngineError::Validation(ValidationError::EmptySelection))
    ));

    engine.enter_selection(MessageId::from("m2")).expect("enter");
    engine.toggle_selection(MessageId::from("m1")).expect("toggle");
    let claimed = engine.delete_selected().await.expect("delete");
    assert_eq!(claimed, vec![MessageId::from("m1"), MessageId::from("m2")]);

    let removed = next_event(&mut events, |event| {
        matches!(event, ClientEvent::MessagesRemoved { .. })
    })
    .await;
    let ClientEvent::MessagesRemoved { ids } = removed else {
        unreachable!();
    };
    assert_eq!(ids, claimed);
    next_event(&mut events, |event| {
        matches!(event, ClientEvent::SelectionChanged { active: false, .. })
    })
    .await;

    assert_eq!(*server.deleted.lock().await, vec![claimed]);
    assert!(engine.snapshot().await.expect("snapshot").selected.is_empty());
    engine.teardown().await;
}

#[tokio::test]
async fn invalid_input_is_rejected_before_any_request() {
    let server = Arc::new(FakeChatServer::default());
    let (engine, _events) = start_engine(server.clone(), Arc::new(MissingAudioSource));

    assert!(matches!(
        engine.send_text(" \n "),
        Err(EngineError::Validation(ValidationError::EmptyMessage))
    ));
    assert!(matches!(
        engine.send_attachment(MediaAttachment {
            file_name: "installer.exe".into(),
            bytes: vec![0; 4],
            mime_type: None,
            caption: None,
        }),
        Err(EngineError::Validation(ValidationError::BlockedFileType { .. }))
    ));
    assert!(server.uploads.lock().await.is_empty());
    engine.teardown().await;
}

#[tokio::test]
async fn teardown_stops_polling() {
    let server = Arc::new(FakeChatServer::default());
    let (engine, _events) = start_engine(server.clone(), Arc::new(MissingAudioSource));
    engine.connect(RoomId::from("r1")).expect("connect");
    wait_for_fetches(&server, 2).await;

    engine.teardown().await;
    let after_teardown = server.fetches.load(Ordering::SeqCst);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(server.fetches.load(Ordering::SeqCst), after_teardown);
}

/// Push endpoint for one client: frames it writes land in `received`, frames
/// queued on `outgoing` are written back to it.
#[derive(Clone)]
struct PushChannel {
    received: mpsc::UnboundedSender<Value>,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
}

struct PushServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<String>,
}

impl PushServer {
    async fn start() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (received, received_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let channel = PushChannel {
            received,
            outgoing: Arc::new(Mutex::new(Some(outgoing_rx))),
        };
        let app = Router::new()
            .route("/ws/chat/:room_id/", get(push_upgrade))
            .with_state(channel);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            addr,
            received: received_rx,
            outgoing,
        }
    }

    fn settings(&self) -> ClientSettings {
        ClientSettings {
            ws_url: Some(format!("ws://{}", self.addr)),
            transport_mode: TransportMode::Push,
            presence_interval_ms: 60_000,
            typing_timeout_ms: 200,
            send_retry_delay_ms: 1,
            ..ClientSettings::default()
        }
    }

    async fn next_frame(&mut self) -> Value {
        timeout(WAIT, self.received.recv())
            .await
            .expect("frame in time")
            .expect("server running")
    }

    fn push(&self, frame: Value) {
        self.outgoing.send(frame.to_string()).expect("socket open");
    }
}

async fn push_upgrade(ws: WebSocketUpgrade, State(channel): State<PushChannel>) -> Response {
    ws.on_upgrade(move |socket| serve_push(socket, channel))
}

async fn serve_push(socket: WebSocket, channel: PushChannel) {
    let Some(mut outgoing) = channel.outgoing.lock().await.take() else {
        return;
    };
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str(&text) {
                        let _ = channel.received.send(frame);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
            Some(frame) = outgoing.recv() => {
                if sink.send(WsMessage::Text(frame)).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn connect_push(engine: &EngineHandle, events: &mut broadcast::Receiver<ClientEvent>) {
    engine.connect(RoomId::from("r1")).expect("connect");
    next_event(events, |event| {
        matches!(
            event,
            ClientEvent::TransportSelected(TransportKind::Push)
        )
    })
    .await;
}

#[tokio::test]
async fn push_typing_signals_start_expire_and_stop_before_the_message() {
    let mut push = PushServer::start().await;
    let (engine, mut events) = start_engine_with(
        push.settings(),
        Arc::new(FakeChatServer::default()),
        Arc::new(MissingAudioSource),
    );
    connect_push(&engine, &mut events).await;

    let started = Instant::now();
    engine.notify_input().expect("input");
    engine.notify_input().expect("input");
    assert_eq!(push.next_frame().await, json!({"type": "typing", "is_typing": true}));
    assert_eq!(push.next_frame().await, json!({"type": "typing", "is_typing": false}));
    assert!(started.elapsed() >= Duration::from_millis(200));

    engine.notify_input().expect("input");
    assert_eq!(push.next_frame().await, json!({"type": "typing", "is_typing": true}));
    let client_temp_id = engine.send_text("hi").expect("valid text");
    assert_eq!(push.next_frame().await, json!({"type": "typing", "is_typing": false}));
    assert_eq!(push.next_frame().await, json!({"type": "text", "content": "hi"}));

    let queued = next_event(&mut events, |event| {
        matches!(event, ClientEvent::SendQueued { .. })
    })
    .await;
    assert!(matches!(
        queued,
        ClientEvent::SendQueued { client_temp_id: id, kind: MessageKind::Text } if id == client_temp_id
    ));
    engine.teardown().await;
}

#[tokio::test]
async fn pushed_copy_of_uploaded_media_does_not_render_twice() {
    let mut push = PushServer::start().await;
    let server = Arc::new(FakeChatServer::default());
    let (engine, mut events) = start_engine_with(
        push.settings(),
        server.clone(),
        Arc::new(MissingAudioSource),
    );
    connect_push(&engine, &mut events).await;

    engine
        .send_attachment(MediaAttachment {
            file_name: "cat.png".into(),
            bytes: vec![0; 8],
            mime_type: Some("image/png".into()),
            caption: Some("look".into()),
        })
        .expect("valid attachment");
    let echoed = next_event(&mut events, |event| {
        matches!(event, ClientEvent::MessageRendered { .. })
    })
    .await;
    assert!(matches!(
        echoed,
        ClientEvent::MessageRendered { ref message, source: DeliverySource::LocalEcho }
            if message.id == MessageId::from("file-0")
    ));
    assert_eq!(
        push.next_frame().await,
        json!({"type": "media_uploaded", "message_id": "file-0"})
    );

    let stored = server.store.lock().await[0].clone();
    push.push(json!({"type": "message", "message": stored}));
    push.push(json!({"type": "message", "message": message("p2", "u2", 500)}));

    let mut rendered = Vec::new();
    timeout(WAIT, async {
        while !rendered.iter().any(|(id, _)| id == &MessageId::from("p2")) {
            if let Ok(ClientEvent::MessageRendered { message, source }) = events.recv().await {
                rendered.push((message.id, source));
            }
        }
    })
    .await
    .expect("later push message rendered");
    assert_eq!(rendered, vec![(MessageId::from("p2"), DeliverySource::Push)]);
    assert_eq!(engine.snapshot().await.expect("snapshot").rendered_count, 2);
    engine.teardown().await;
}

#[tokio::test]
async fn failed_voice_named_upload_reports_voice_kind() {
    let server = Arc::new(FakeChatServer {
        reject_uploads: AtomicBool::new(true),
        ..FakeChatServer::default()
    });
    let (engine, mut events) = start_engine(server, Arc::new(MissingAudioSource));
    engine.connect(RoomId::from("r1")).expect("connect");

    let client_temp_id = engine
        .send_attachment(MediaAttachment {
            file_name: "voice_memo.ogg".into(),
            bytes: vec![1, 2, 3],
            mime_type: Some("audio/ogg".into()),
            caption: None,
        })
        .expect("valid attachment");

    let failed = next_event(&mut events, |event| {
        matches!(event, ClientEvent::SendFailed { .. })
    })
    .await;
    let ClientEvent::SendFailed {
        client_temp_id: id,
        kind,
        error,
    } = failed
    else {
        unreachable!();
    };
    assert_eq!(id, client_temp_id);
    assert_eq!(kind, MessageKind::Voice);
    assert_eq!(error, TransportError::Status(413));
    engine.teardown().await;
}
