//! Configuration
//!
//! Loaded in three layers: built-in defaults, an optional JSON file named by
//! `REPLAYCAM_CONFIG`, then individual environment overrides. A `.env` file
//! in the working directory is read first.
//!
//! | Env Var                    | Overrides                         |
//! |----------------------------|-----------------------------------|
//! | `REPLAYCAM_ROLE`           | `role`                            |
//! | `REPLAYCAM_TRANSPORT`      | `transport.kind`                  |
//! | `REPLAYCAM_LISTEN`         | `transport.listenAddr`            |
//! | `REPLAYCAM_PEER`           | `transport.peer`                  |
//! | `REPLAYCAM_CODE`           | `transport.code`                  |
//! | `REPLAYCAM_RELAY_URL`      | `transport.relayUrl`              |
//! | `REPLAYCAM_RELAY_AUTH`     | `transport.relayAuth`             |
//! | `REPLAYCAM_SEGMENT_LIST`   | `buffer.segmentList`              |
//! | `REPLAYCAM_HIGHLIGHTS_DIR` | `clip.highlightsDir`              |

use crate::buffer::{BufferError, SegmentConfig};
use crate::protocol::{Role, DEFAULT_COALESCE_WINDOW};
use crate::session::SessionCode;
use crate::transport::{ConnectTarget, TransportKind, TransportOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "REPLAYCAM_CONFIG";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    Override { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<BufferError> for ConfigError {
    fn from(error: BufferError) -> Self {
        ConfigError::Invalid(error.to_string())
    }
}

/// Session timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is considered lost
    pub heartbeat_timeout_ms: u64,
    /// Flat delay between reconnect attempts
    pub reconnect_backoff_ms: u64,
    /// Overrides the transport's recommended connect timeout
    pub connect_timeout_ms: Option<u64>,
    pub coalesce_window_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 3_000,
            heartbeat_timeout_ms: 9_000,
            reconnect_backoff_ms: 3_000,
            connect_timeout_ms: None,
            coalesce_window_ms: DEFAULT_COALESCE_WINDOW.as_millis() as u64,
        }
    }
}

impl SessionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 || self.reconnect_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and reconnect backoff must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout {}ms must exceed the interval {}ms",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "connect timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Link selection and addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub kind: TransportKind,
    /// Bind address for listening transports
    pub listen_addr: String,
    /// Camera address a remote connects to
    pub peer: Option<String>,
    /// Session code; the camera generates one when unset
    pub code: Option<String>,
    pub relay_url: Option<String>,
    pub relay_auth: Option<String>,
    pub poll_interval_ms: u64,
    pub keepalive_interval_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Stream,
            listen_addr: "0.0.0.0:7878".to_string(),
            peer: None,
            code: None,
            relay_url: None,
            relay_auth: None,
            poll_interval_ms: 500,
            keepalive_interval_ms: 5_000,
        }
    }
}

impl TransportSettings {
    pub fn options(&self, role: Role) -> TransportOptions {
        TransportOptions {
            kind: self.kind,
            role,
            listen_addr: self.listen_addr.clone(),
            relay_url: self.relay_url.clone(),
            relay_auth: self.relay_auth.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
        }
    }

    pub fn session_code(&self) -> Result<Option<SessionCode>, ConfigError> {
        self.code
            .as_deref()
            .map(|code| {
                SessionCode::parse(code).map_err(|e| ConfigError::Invalid(format!("code: {}", e)))
            })
            .transpose()
    }

    /// Where a remote connects. Plain TCP never looks at the code, so one
    /// is generated when none was configured.
    pub fn connect_target(&self) -> Result<ConnectTarget, ConfigError> {
        let code = match self.session_code()? {
            Some(code) => code,
            None if self.kind == TransportKind::Stream => SessionCode::generate(),
            None => {
                return Err(ConfigError::Invalid(format!(
                    "a {} remote needs a session code",
                    self.kind
                )))
            }
        };
        let address = match self.kind {
            TransportKind::Stream | TransportKind::Duplex => self.peer.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("a {} remote needs a peer address", self.kind))
            })?,
            TransportKind::Radio => self.peer.clone().unwrap_or_default(),
            TransportKind::PollRelay | TransportKind::CloudRelay => {
                self.relay_url.clone().unwrap_or_default()
            }
        };
        Ok(ConnectTarget::new(address, code))
    }
}

/// Rolling buffer and capture boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferSettings {
    pub segment_duration_secs: u32,
    pub keyframe_interval_secs: u32,
    pub frame_rate: u32,
    pub retention_secs: u64,
    /// CSV segment list written by the encoder
    pub segment_list: Option<PathBuf>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        let segment = SegmentConfig::default();
        Self {
            segment_duration_secs: segment.segment_duration_secs,
            keyframe_interval_secs: segment.keyframe_interval_secs,
            frame_rate: segment.frame_rate,
            retention_secs: 300,
            segment_list: None,
        }
    }
}

impl BufferSettings {
    pub fn segment_config(&self) -> Result<SegmentConfig, BufferError> {
        SegmentConfig::new(
            self.segment_duration_secs,
            self.keyframe_interval_secs,
            self.frame_rate,
        )
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Clip output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClipSettings {
    /// Used when a capture carries no duration
    pub default_duration_secs: u32,
    pub highlights_dir: PathBuf,
    /// Mirror the ledger to `highlights.json`
    pub persist_index: bool,
    pub ffmpeg_path: PathBuf,
    /// Extra wait past one segment duration for the trigger to be buffered
    pub coverage_grace_ms: u64,
}

impl Default for ClipSettings {
    fn default() -> Self {
        Self {
            default_duration_secs: 30,
            highlights_dir: PathBuf::from("highlights"),
            persist_index: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            coverage_grace_ms: 2_000,
        }
    }
}

impl ClipSettings {
    pub fn coverage_grace(&self) -> Duration {
        Duration::from_millis(self.coverage_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub role: Role,
    pub session: SessionSettings,
    pub transport: TransportSettings,
    pub buffer: BufferSettings,
    pub clip: ClipSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: Role::Camera,
            session: SessionSettings::default(),
            transport: TransportSettings::default(),
            buffer: BufferSettings::default(),
            clip: ClipSettings::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, then `REPLAYCAM_CONFIG`, then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `REPLAYCAM_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("REPLAYCAM_ROLE") {
            self.role = value.parse().map_err(|_| ConfigError::Override {
                var: "REPLAYCAM_ROLE",
                value,
            })?;
        }
        if let Some(value) = get("REPLAYCAM_TRANSPORT") {
            self.transport.kind = value.parse().map_err(|_| ConfigError::Override {
                var: "REPLAYCAM_TRANSPORT",
                value,
            })?;
        }
        if let Some(value) = get("REPLAYCAM_LISTEN") {
            self.transport.listen_addr = value;
        }
        if let Some(value) = get("REPLAYCAM_PEER") {
            self.transport.peer = Some(value);
        }
        if let Some(value) = get("REPLAYCAM_CODE") {
            self.transport.code = Some(value);
        }
        if let Some(value) = get("REPLAYCAM_RELAY_URL") {
            self.transport.relay_url = Some(value);
        }
        if let Some(value) = get("REPLAYCAM_RELAY_AUTH") {
            self.transport.relay_auth = Some(value);
        }
        if let Some(value) = get("REPLAYCAM_SEGMENT_LIST") {
            self.buffer.segment_list = Some(PathBuf::from(value));
        }
        if let Some(value) = get("REPLAYCAM_HIGHLIGHTS_DIR") {
            self.clip.highlights_dir = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;

        let segment = self.buffer.segment_config()?;
        if self.buffer.retention_secs < segment.segment_duration_secs as u64 {
            return Err(ConfigError::Invalid(format!(
                "retention {}s is shorter than one segment ({}s)",
                self.buffer.retention_secs, segment.segment_duration_secs
            )));
        }
        if self.clip.default_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "default clip duration must be positive".to_string(),
            ));
        }
        if self.transport.poll_interval_ms == 0 || self.transport.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll and keepalive intervals must be positive".to_string(),
            ));
        }
        if matches!(
            self.transport.kind,
            TransportKind::PollRelay | TransportKind::CloudRelay
        ) && self.transport.relay_url.is_none()
        {
            return Err(ConfigError::Invalid(format!(
                "{} transport needs a relay URL",
                self.transport.kind
            )));
        }

        self.transport.session_code()?;
        if self.role == Role::Remote {
            self.transport.connect_target()?;
        }
        Ok(())
    }
}
