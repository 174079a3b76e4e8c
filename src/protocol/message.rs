//! Signaling messages
//!
//! The wire vocabulary exchanged between a camera and its remotes. Every
//! message is one textual JSON record:
//!
//! ```text
//! {"type":"register","role":"remote"}
//! {"type":"capture","timestamp":1718000000000,"duration":30}
//! {"type":"ping","timestamp":1718000000000}
//! {"type":"status","message":"saved 3f2a… 30s"}
//! ```
//!
//! Stream transports terminate each record with a newline; framed transports
//! carry one record per frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest record a transport will accept before treating it as malformed
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Device role within a session. Set once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Films into the rolling buffer and produces clips
    Camera,
    /// Sends capture signals
    Remote,
}

impl Role {
    /// The role on the other side of a pairing
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Camera => Role::Remote,
            Role::Remote => Role::Camera,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Camera => "camera",
            Role::Remote => "remote",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(Role::Camera),
            "remote" => Ok(Role::Remote),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// One signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Sent once per low-level connection, immediately after connect
    Register { role: Role },

    /// Remote asks the camera to materialize a clip ending now
    Capture {
        /// Remote's local send time (unix milliseconds)
        timestamp: i64,
        /// Requested clip length in seconds (camera default when absent)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u32>,
    },

    /// Liveness probe
    Ping { timestamp: i64 },

    /// Liveness reply, echoes the probe timestamp
    Pong { timestamp: i64 },

    /// Advisory, human-readable
    Status { message: String },
}

impl Message {
    pub fn register(role: Role) -> Self {
        Message::Register { role }
    }

    pub fn capture(timestamp: i64, duration: Option<u32>) -> Self {
        Message::Capture { timestamp, duration }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Message::Status {
            message: message.into(),
        }
    }

    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Capture { .. } => "capture",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Status { .. } => "status",
        }
    }

    /// Ping and pong only drive liveness and are never surfaced to the app
    pub fn is_liveness(&self) -> bool {
        matches!(self, Message::Ping { .. } | Message::Pong { .. })
    }

    /// Serialize to a single record (no terminator)
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a single record. Surrounding whitespace (including a trailing
    /// newline) is ignored.
    pub fn decode(record: &str) -> Result<Self, ProtocolError> {
        let record = record.trim();
        if record.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if record.len() > MAX_RECORD_LEN {
            return Err(ProtocolError::TooLarge(record.len()));
        }
        Ok(serde_json::from_str(record)?)
    }
}

/// Current unix time in milliseconds, used for wire timestamps
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Empty record")]
    Empty,

    #[error("Record too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unexpected {kind} message while {state}")]
    Unexpected { kind: &'static str, state: String },
}
