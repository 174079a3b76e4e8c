//! Pairing session
//!
//! Session codes, per-peer tracking and the state machine that sits on top
//! of one transport.

pub mod code;
pub mod machine;
pub mod peers;
pub mod state;

pub use code::{CodeError, SessionCode, CODE_ALPHABET, CODE_LEN};
pub use machine::{CaptureSignal, Session, SessionError, SessionEvent, TimerCounts};
pub use peers::{PeerSummary, PeerTracker};
pub use state::SessionState;
