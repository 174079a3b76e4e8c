//! Extraction types
//!
//! Requests, coverage reporting and errors for clip extraction.

use crate::buffer::StorageRef;
use crate::highlights::{Highlight, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Ask for the clip ending at `trigger_ms` and lasting `duration_ms`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipRequest {
    /// Session-epoch milliseconds
    pub trigger_ms: i64,
    pub duration_ms: i64,
}

impl ClipRequest {
    pub fn new(trigger_ms: i64, duration_secs: u32) -> Self {
        Self {
            trigger_ms,
            duration_ms: duration_secs as i64 * 1000,
        }
    }

    pub fn window_start_ms(&self) -> i64 {
        self.trigger_ms - self.duration_ms
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

/// Why a clip came out shorter than requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartialReason {
    /// Window start precedes the oldest retained segment
    BufferTooShort,
    /// The trigger lies past the newest buffered data
    TriggerNotBuffered,
    /// A recording gap cut the contiguous run short
    Gap,
}

impl fmt::Display for PartialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartialReason::BufferTooShort => "buffer shorter than requested window",
            PartialReason::TriggerNotBuffered => "trigger not yet buffered",
            PartialReason::Gap => "recording gap in window",
        })
    }
}

/// How much of the requested window a clip covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Coverage {
    Full,
    #[serde(rename_all = "camelCase")]
    Partial {
        requested_ms: i64,
        available_ms: i64,
        reason: PartialReason,
    },
}

impl Coverage {
    pub fn is_partial(&self) -> bool {
        matches!(self, Coverage::Partial { .. })
    }
}

/// One invocation of the extraction primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionJob {
    /// Ordered segment storage handles
    pub sources: Vec<StorageRef>,
    /// Cut point within the first source (keyframe-aligned)
    pub start_offset_ms: i64,
    /// Read bound within the last source (keyframe-aligned)
    pub read_end_offset_ms: i64,
    /// Output length from the start offset
    pub duration_ms: i64,
    pub output: StorageRef,
}

/// Result of a successful extraction
#[derive(Debug, Clone)]
pub struct ClipOutcome {
    pub highlight: Highlight,
    pub coverage: Coverage,
}

/// Extraction errors
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("No data: the buffer is empty")]
    NoData,

    #[error("Requested window is not buffered: {0}")]
    WindowNotBuffered(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Extraction failed: {0}")]
    Primitive(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Stable code reported to the remote
    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::NoData => "NO_DATA",
            ExtractError::WindowNotBuffered(_) => "WINDOW_NOT_BUFFERED",
            ExtractError::InvalidRequest(_) => "INVALID_REQUEST",
            ExtractError::Primitive(_) => "EXTRACTION_FAILED",
            ExtractError::Storage(_) => "STORAGE_ERROR",
            ExtractError::Io(_) => "IO_ERROR",
        }
    }
}
