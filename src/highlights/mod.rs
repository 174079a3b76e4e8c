//! Highlight ledger
//!
//! Metadata for every clip the camera produced, newest first, backed by a
//! storage collaborator that owns the clip files.

pub mod ledger;
pub mod storage;

pub use ledger::HighlightLedger;
pub use storage::{FsHighlightStorage, HighlightStorage, MemoryHighlightStorage, INDEX_FILE};

use crate::buffer::StorageRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A saved clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Session-epoch trigger instant
    pub trigger_ms: i64,
    pub requested_ms: i64,
    /// Actual clip length
    pub duration_ms: i64,
    #[serde(default)]
    pub partial: bool,
    pub storage: StorageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_peer: Option<String>,
}

impl Highlight {
    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

/// Highlight storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid storage location: {0}")]
    InvalidLocation(String),
}
