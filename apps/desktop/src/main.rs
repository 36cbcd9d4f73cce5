use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatEngine, ClientEvent, EngineHandle, HttpChatService, MediaAttachment,
    MissingAudioSource, SessionState, TransportMode,
};
use shared::domain::{MessageId, RoomId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    transport: Option<TransportMode>,
    #[arg(long)]
    room: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    csrf_token: Option<String>,
    /// Raw Cookie header carrying the authenticated session.
    #[arg(long)]
    cookie: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(mode) = args.transport {
        settings.transport_mode = mode;
    }

    let session = SessionState {
        user_id: UserId::new(args.user_id),
        csrf_token: args.csrf_token,
        cookie: args.cookie,
    };
    let service = Arc::new(HttpChatService::new(settings.api_base(), session.clone()));
    let engine = ChatEngine::create(settings, session, service, Arc::new(MissingAudioSource));

    let mut events = engine.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("! skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    engine.connect(RoomId::new(args.room))?;
    println!("commands: /file <path> [caption], /record, /stop, /cancel, /select <id>, /toggle <id>, /unselect, /delete, /status, /exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&engine, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("! {err:#}"),
        }
    }

    engine.teardown().await;
    printer.abort();
    Ok(())
}

/// Returns `false` once the user asks to leave.
async fn run_command(engine: &EngineHandle, line: &str) -> Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "" => {}
        "/exit" | "/quit" => return Ok(false),
        "/file" => {
            let (path, caption) = match rest.split_once(' ') {
                Some((path, caption)) => (path, Some(caption.trim().to_string())),
                None => (rest, None),
            };
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read '{path}'"))?;
            let file_name = PathBuf::from(path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();
            engine.send_attachment(MediaAttachment {
                file_name,
                bytes,
                mime_type: None,
                caption,
            })?;
        }
        "/record" => engine.start_recording()?,
        "/stop" => engine.stop_recording()?,
        "/cancel" => engine.cancel_recording()?,
        "/select" => engine.enter_selection(MessageId::from(rest))?,
        "/toggle" => engine.toggle_selection(MessageId::from(rest))?,
        "/unselect" => engine.exit_selection()?,
        "/delete" => {
            let ids = engine.delete_selected().await?;
            println!("deleting {} message(s)", ids.len());
        }
        "/status" => {
            let snapshot = engine.snapshot().await?;
            println!(
                "transport={:?}/{:?} online={} recording={:?} selected={}",
                snapshot.transport_kind,
                snapshot.transport_state,
                snapshot.online_users.len(),
                snapshot.recording_state,
                snapshot.selected.len()
            );
        }
        _ => {
            engine.notify_input()?;
            engine.send_text(line)?;
        }
    }
    Ok(true)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessageRendered { message, .. } => {
            let body = match &message.file_url {
                Some(url) if message.content.is_empty() => format!("[{:?}] {url}", message.kind),
                Some(url) => format!("{} [{:?}] {url}", message.content, message.kind),
                None => message.content.clone(),
            };
            println!(
                "[{}] {} ({}): {body}",
                message.created_at.format("%H:%M:%S"),
                message.sender.display_name(),
                message.id
            );
        }
        ClientEvent::MessagesRemoved { ids } => println!("* removed {} message(s)", ids.len()),
        ClientEvent::ConnectionStateChanged(state) => println!("* connection {state:?}"),
        ClientEvent::TransportSelected(kind) => println!("* using {kind:?} transport"),
        ClientEvent::PresenceChanged { online } => println!("* {} online", online.len()),
        ClientEvent::TypingIndicatorChanged(Some(indicator)) => {
            println!("* {} is typing...", indicator.display_name)
        }
        ClientEvent::TypingIndicatorChanged(None) => {}
        ClientEvent::RecordingStateChanged(state) => println!("* recording {state:?}"),
        ClientEvent::RecordingElapsed { seconds } => {
            println!("* recording {:02}:{:02}", seconds / 60, seconds % 60)
        }
        ClientEvent::SelectionChanged { active, selected } => {
            if *active {
                println!("* {} selected", selected.len());
            } else {
                println!("* selection cleared");
            }
        }
        ClientEvent::SendQueued {
            client_temp_id,
            kind,
        } => println!("* queued {kind:?} {client_temp_id}"),
        ClientEvent::SendFailed {
            client_temp_id,
            kind,
            error,
        } => println!("! {kind:?} {client_temp_id} failed: {error}"),
        ClientEvent::Notice { severity, message } => println!("! {severity:?}: {message}"),
    }
}
