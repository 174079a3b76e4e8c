//! Error types and handling
//!
//! `AppError` gathers the per-concern errors; `ErrorResponse` is what a
//! failure looks like to the operator on the other device.

use crate::buffer::BufferError;
use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::highlights::StorageError;
use crate::protocol::ProtocolError;
use crate::session::SessionError;
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppError {
    /// Stable upper-snake code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Protocol(_) => "PROTOCOL_ERROR",
            AppError::Transport(e) => match e {
                TransportError::Connect(_) | TransportError::PeerNotFound(_) => "CONNECT_FAILED",
                TransportError::Send(_) | TransportError::UnknownConnection(_) => "SEND_FAILED",
                TransportError::Relay(_) => "RELAY_ERROR",
                TransportError::Unsupported(_) => "UNSUPPORTED",
                TransportError::Io(_) | TransportError::Protocol(_) => "TRANSPORT_ERROR",
            },
            AppError::Session(e) => match e {
                SessionError::WrongRole { .. } => "WRONG_ROLE",
                SessionError::AlreadyActive(_) | SessionError::ConnectInFlight => "SESSION_BUSY",
                SessionError::ConnectTimeout(_) => "CONNECT_TIMEOUT",
                SessionError::RegistrationTimeout(_) => "REGISTRATION_TIMEOUT",
                SessionError::ConnectionLost => "CONNECTION_LOST",
                SessionError::Cancelled => "CANCELLED",
                SessionError::NotConnected => "NOT_CONNECTED",
                SessionError::Transport(_) => "TRANSPORT_ERROR",
            },
            AppError::Buffer(e) => match e {
                BufferError::InvalidConfig(_) => "INVALID_CONFIG",
                BufferError::ConfigMismatch(_) | BufferError::OrderingViolation { .. } => {
                    "BUFFER_INVARIANT"
                }
            },
            AppError::Extract(e) => e.code(),
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Capture(_) => "CAPTURE_ERROR",
            AppError::Config(_) => "INVALID_CONFIG",
        }
    }
}

/// User-visible failure envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<ExtractError> for ErrorResponse {
    fn from(error: ExtractError) -> Self {
        AppError::from(error).into()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}", self.code, self.message)
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codes() {
        let cases: Vec<(AppError, &str)> = vec![
            (ExtractError::NoData.into(), "NO_DATA"),
            (
                ExtractError::WindowNotBuffered("before oldest".to_string()).into(),
                "WINDOW_NOT_BUFFERED",
            ),
            (SessionError::NotConnected.into(), "NOT_CONNECTED"),
            (
                SessionError::ConnectTimeout(Duration::from_secs(10)).into(),
                "CONNECT_TIMEOUT",
            ),
            (
                BufferError::OrderingViolation {
                    previous_end_ms: 60_000,
                    start_ms: 59_000,
                }
                .into(),
                "BUFFER_INVARIANT",
            ),
            (ConfigError::Invalid("x".to_string()).into(), "INVALID_CONFIG"),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code, "{}", error);
        }
    }

    #[test]
    fn test_response_display() {
        let response = ErrorResponse::from(ExtractError::Primitive("exit status 1".to_string()));
        assert_eq!(response.code, "EXTRACTION_FAILED");
        assert_eq!(
            response.to_string(),
            "[EXTRACTION_FAILED]: Extraction failed: exit status 1"
        );
    }
}
