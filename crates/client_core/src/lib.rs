pub mod api;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod presence;
pub mod reconnect;
pub mod recording;
pub mod selection;
pub mod transport;
pub mod typing;
pub mod validation;

pub use api::{ChatService, HttpChatService, SessionState, UploadRequest};
pub use config::{load_settings, ClientSettings, ReconnectSettings, TransportMode};
pub use dedup::MessageDeduper;
pub use engine::{ChatEngine, ClientEvent, EngineHandle, EngineSnapshot, NoticeSeverity};
pub use error::{EngineError, PermissionError, TransportError, ValidationError};
pub use presence::PresenceTracker;
pub use reconnect::ReconnectPolicy;
pub use recording::{
    AcquireOutcome, AudioSource, CaptureStream, Finalized, MissingAudioSource, RecordingController,
    RecordingState, VoiceClip,
};
pub use selection::SelectionCoordinator;
pub use transport::{
    DeliverySource, IntentRef, MediaAttachment, OutboundIntent, OutboundPayload, SendOutcome,
    TransportEvent, TransportKind, TransportManager, TransportState,
};
pub use typing::{TypingCoordinator, TypingIndicator, TypingSignal, TypingState};
