//! Signaling protocol
//!
//! The message vocabulary layered on every transport, plus the
//! duplicate-capture filter the camera applies to inbound signals.

pub mod coalesce;
pub mod message;

pub use coalesce::{CaptureCoalescer, DEFAULT_COALESCE_WINDOW};
pub use message::{unix_millis, Message, ProtocolError, Role, MAX_RECORD_LEN};
