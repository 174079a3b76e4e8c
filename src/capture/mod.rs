//! Capture pipeline boundary
//!
//! The encoder runs outside this crate and writes fixed-length segments plus
//! a segment list. This module turns that list into buffer ingests.

pub mod segment_list;

pub use segment_list::{SegmentListEntry, SegmentListWatcher};

use crate::buffer::BufferError;
use thiserror::Error;

/// Capture boundary errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed segment list entry: {0}")]
    Parse(String),

    #[error("Buffer rejected segment: {0}")]
    Buffer(#[from] BufferError),
}
