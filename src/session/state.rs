//! Session state
//!
//! Defines the pairing state machine's states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current state of a pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; initial state and the state after an explicit disconnect
    Idle,
    /// Camera is listening for remotes
    Advertising,
    /// Remote is looking for its camera
    Discovering,
    /// Low-level connect in progress
    Connecting,
    /// Connected, waiting for the peer's `register`
    Registering,
    /// Paired; heartbeats running
    Connected,
    /// Link lost; the remote retries on a fixed backoff
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Advertising => "advertising",
            SessionState::Discovering => "discovering",
            SessionState::Connecting => "connecting",
            SessionState::Registering => "registering",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
        }
    }

    /// States in which a session is active (anything but Idle)
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Advertising.is_active());
    }
}
