use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use shared::domain::RoomId;
use url::Url;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Try the push channel once at connect time, fall back to polling.
    #[default]
    Auto,
    Push,
    Poll,
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "push" | "websocket" | "ws" => Ok(Self::Push),
            "poll" | "polling" => Ok(Self::Poll),
            other => Err(anyhow!("unknown transport mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub ws_url: Option<String>,
    pub transport_mode: TransportMode,
    pub poll_interval_ms: u64,
    pub presence_interval_ms: u64,
    pub typing_timeout_ms: u64,
    pub send_retry_attempts: u32,
    pub send_retry_delay_ms: u64,
    pub max_upload_bytes: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            ws_url: None,
            transport_mode: TransportMode::Auto,
            poll_interval_ms: 3_000,
            presence_interval_ms: 10_000,
            typing_timeout_ms: 3_000,
            send_retry_attempts: 3,
            send_retry_delay_ms: 500,
            max_upload_bytes: 25 * 1024 * 1024,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms.max(1))
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn api_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Push channel endpoint for a room. Derived from `server_url` unless
    /// `ws_url` overrides the base.
    pub fn push_url(&self, room_id: &RoomId) -> Result<Url> {
        let base = match &self.ws_url {
            Some(ws_url) => ws_url.trim_end_matches('/').to_string(),
            None => websocket_base(self.api_base())?,
        };
        let raw = format!("{base}/ws/chat/{room_id}/");
        Url::parse(&raw).with_context(|| format!("invalid push channel url '{raw}'"))
    }
}

fn websocket_base(server_url: &str) -> Result<String> {
    if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(anyhow!("server_url must start with http:// or https://"))
    }
}

/// Defaults, then the TOML file (if present), then `APP__*` environment
/// overrides.
pub fn load_settings(path: Option<&Path>) -> Result<ClientSettings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientSettings>(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read settings file '{}'", path.display()))
        }
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_env_overrides(
    settings: &mut ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__WS_URL") {
        settings.ws_url = Some(v);
    }
    if let Some(v) = lookup("APP__TRANSPORT_MODE") {
        settings.transport_mode = v.parse()?;
    }
    if let Some(v) = lookup("APP__POLL_INTERVAL_MS") {
        settings.poll_interval_ms = parse_number("APP__POLL_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("APP__PRESENCE_INTERVAL_MS") {
        settings.presence_interval_ms = parse_number("APP__PRESENCE_INTERVAL_MS", &v)?;
    }
    if let Some(v) = lookup("APP__TYPING_TIMEOUT_MS") {
        settings.typing_timeout_ms = parse_number("APP__TYPING_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = lookup("APP__SEND_RETRY_ATTEMPTS") {
        settings.send_retry_attempts = parse_number("APP__SEND_RETRY_ATTEMPTS", &v)?;
    }
    if let Some(v) = lookup("APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = parse_number("APP__MAX_UPLOAD_BYTES", &v)?;
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS") {
        settings.reconnect.max_attempts = Some(parse_number("APP__RECONNECT_MAX_ATTEMPTS", &v)?);
    }
    Ok(())
}

fn parse_number<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid value for {key}: '{raw}'"))
}
