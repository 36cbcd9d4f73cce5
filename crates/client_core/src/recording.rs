use std::time::Duration;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::error::PermissionError;

pub type AudioFragment = Vec<u8>;

pub const DEFAULT_CAPTURE_MIME: &str = "audio/webm";

/// A live microphone capture. Fragments arrive on the channel until the device
/// finishes; the channel closing is the device's stop callback.
pub struct CaptureStream {
    fragments: mpsc::Receiver<AudioFragment>,
    stop: Option<oneshot::Sender<()>>,
    mime_type: String,
}

impl CaptureStream {
    pub fn new(
        fragments: mpsc::Receiver<AudioFragment>,
        stop: oneshot::Sender<()>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            fragments,
            stop: Some(stop),
            mime_type: mime_type.into(),
        }
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Asks the device to stop. Buffered fragments may still be delivered
    /// before the channel closes.
    pub fn request_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// `None` once the device has stopped.
    pub async fn next_fragment(&mut self) -> Option<AudioFragment> {
        self.fragments.recv().await
    }
}

#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open(&self) -> Result<CaptureStream, PermissionError>;
}

pub struct MissingAudioSource;

#[async_trait]
impl AudioSource for MissingAudioSource {
    async fn open(&self) -> Result<CaptureStream, PermissionError> {
        Err(PermissionError::new("no audio capture device available"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Capturing,
    /// Stop requested; waiting for the device to flush and close.
    Stopping,
    Uploading,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Upload(VoiceClip),
    Discarded,
    /// The device stopped without producing any audio.
    Empty,
    /// Finalization arrived while no session was open.
    Ignored,
}

/// What the owner should do with a freshly opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Keep the stream and start capturing.
    Capture,
    /// A stop arrived while the device opened: keep the stream but ask the
    /// device to stop right away so whatever it buffered still finalizes.
    Stop,
    /// Cancelled or stale; stop the device and drop the stream.
    Release,
}

#[derive(Debug)]
struct RecordingSession {
    started_at: Instant,
    chunks: Vec<AudioFragment>,
    mime_type: String,
}

/// Voice capture lifecycle. The controller is pure state: the owner opens and
/// stops the device and feeds its callbacks back in.
#[derive(Debug)]
pub struct RecordingController {
    state: RecordingState,
    session: Option<RecordingSession>,
    acquiring: bool,
    stop_pending: bool,
    discard: bool,
}

impl Default for RecordingController {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingController {
    pub fn new() -> Self {
        Self {
            state: RecordingState::Idle,
            session: None,
            acquiring: false,
            stop_pending: false,
            discard: false,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Returns `true` when the caller should open the microphone.
    pub fn request_start(&mut self) -> bool {
        if self.acquiring
            || matches!(
                self.state,
                RecordingState::Capturing | RecordingState::Stopping | RecordingState::Uploading
            )
        {
            return false;
        }
        self.acquiring = true;
        self.stop_pending = false;
        self.discard = false;
        true
    }

    /// Device opened. A cancel during acquisition ends the session cancelled;
    /// a stop during acquisition opens it already `Stopping`. An empty mime
    /// type falls back to [`DEFAULT_CAPTURE_MIME`].
    pub fn on_acquired(&mut self, now: Instant, mime_type: &str) -> AcquireOutcome {
        if !self.acquiring {
            return AcquireOutcome::Release;
        }
        self.acquiring = false;
        if self.discard {
            self.stop_pending = false;
            self.state = RecordingState::Cancelled;
            return AcquireOutcome::Release;
        }
        let mime_type = match mime_type.trim() {
            "" => DEFAULT_CAPTURE_MIME,
            mime_type => mime_type,
        };
        self.session = Some(RecordingSession {
            started_at: now,
            chunks: Vec::new(),
            mime_type: mime_type.to_string(),
        });
        if std::mem::take(&mut self.stop_pending) {
            self.state = RecordingState::Stopping;
            return AcquireOutcome::Stop;
        }
        self.state = RecordingState::Capturing;
        AcquireOutcome::Capture
    }

    /// Microphone denied. The state is left as it was.
    pub fn on_permission_denied(&mut self) {
        self.acquiring = false;
        self.stop_pending = false;
        self.discard = false;
    }

    pub fn on_fragment(&mut self, fragment: AudioFragment) {
        if !matches!(
            self.state,
            RecordingState::Capturing | RecordingState::Stopping
        ) {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            if !fragment.is_empty() {
                session.chunks.push(fragment);
            }
        }
    }

    /// Returns `true` when the caller should ask the device to stop. A stop
    /// during acquisition is remembered and applied once the device opens.
    pub fn stop(&mut self) -> bool {
        if self.acquiring {
            self.stop_pending = true;
            return false;
        }
        if self.state != RecordingState::Capturing {
            return false;
        }
        self.state = RecordingState::Stopping;
        true
    }

    /// Marks the session for discard. The flag survives until finalization, so
    /// a device stop racing with this call still ends in `Cancelled`.
    /// Returns `true` when the caller should ask the device to stop.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            RecordingState::Capturing => {
                self.discard = true;
                self.state = RecordingState::Stopping;
                true
            }
            RecordingState::Stopping => {
                self.discard = true;
                false
            }
            _ if self.acquiring => {
                self.discard = true;
                false
            }
            _ => false,
        }
    }

    /// The device's stop callback; also covers a device that stops on its own.
    pub fn on_device_stopped(&mut self, now: Instant) -> Finalized {
        if !matches!(
            self.state,
            RecordingState::Capturing | RecordingState::Stopping
        ) {
            return Finalized::Ignored;
        }
        let Some(session) = self.session.take() else {
            self.state = RecordingState::Idle;
            return Finalized::Ignored;
        };
        if self.discard {
            self.state = RecordingState::Cancelled;
            return Finalized::Discarded;
        }
        if session.chunks.is_empty() {
            self.state = RecordingState::Idle;
            return Finalized::Empty;
        }
        self.state = RecordingState::Uploading;
        let elapsed = now.saturating_duration_since(session.started_at);
        Finalized::Upload(VoiceClip {
            bytes: session.chunks.concat(),
            mime_type: session.mime_type,
            duration_seconds: rounded_seconds(elapsed),
        })
    }

    pub fn on_upload_finished(&mut self) {
        if self.state == RecordingState::Uploading {
            self.state = RecordingState::Idle;
        }
    }

    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        match self.state {
            RecordingState::Capturing => self
                .session
                .as_ref()
                .map(|session| now.saturating_duration_since(session.started_at)),
            _ => None,
        }
    }
}

fn rounded_seconds(elapsed: Duration) -> u32 {
    let millis = elapsed.as_millis().saturating_add(500) / 1000;
    u32::try_from(millis).unwrap_or(u32::MAX)
}

#[cfg(test)]
#[path = "tests/recording_tests.rs"]
mod tests;
