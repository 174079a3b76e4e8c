//! Rolling segment buffer
//!
//! Keeps a bounded window of encoded segments for the active recording and
//! hands extraction consistent, leased views of it.

pub mod lease;
pub mod rolling;
pub mod segment;
pub mod store;

use thiserror::Error;

pub use lease::SegmentLease;
pub use rolling::{BufferSnapshot, BufferStats, RollingBuffer};
pub use segment::{CapturedSegment, Segment, SegmentConfig, StorageRef};
pub use store::{FsSegmentStore, MemorySegmentStore, SegmentStore};

/// Buffer errors. Both ingest errors mean the capture pipeline broke its
/// contract; they are not network conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid buffer configuration: {0}")]
    InvalidConfig(String),

    #[error("Segment does not match capture configuration: {0}")]
    ConfigMismatch(String),

    #[error("Segment starting at {start_ms}ms overlaps previous segment ending at {previous_end_ms}ms")]
    OrderingViolation { previous_end_ms: i64, start_ms: i64 },
}
