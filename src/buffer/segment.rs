//! Segment types
//!
//! A segment is one fixed-nominal-duration unit of encoded video. Every
//! segment in a recording shares the capture configuration, and the
//! keyframe interval divides the segment duration, so segments start and
//! end on keyframe boundaries.

use super::BufferError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Capture configuration shared by every segment of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentConfig {
    pub segment_duration_secs: u32,
    pub keyframe_interval_secs: u32,
    pub frame_rate: u32,
}

impl SegmentConfig {
    pub fn new(
        segment_duration_secs: u32,
        keyframe_interval_secs: u32,
        frame_rate: u32,
    ) -> Result<Self, BufferError> {
        let config = Self {
            segment_duration_secs,
            keyframe_interval_secs,
            frame_rate,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if self.segment_duration_secs == 0 || self.keyframe_interval_secs == 0 {
            return Err(BufferError::InvalidConfig(
                "segment duration and keyframe interval must be positive".to_string(),
            ));
        }
        if self.frame_rate == 0 {
            return Err(BufferError::InvalidConfig(
                "frame rate must be positive".to_string(),
            ));
        }
        if self.segment_duration_secs % self.keyframe_interval_secs != 0 {
            return Err(BufferError::InvalidConfig(format!(
                "keyframe interval {}s does not divide segment duration {}s",
                self.keyframe_interval_secs, self.segment_duration_secs
            )));
        }
        Ok(())
    }

    pub fn segment_duration_ms(&self) -> i64 {
        self.segment_duration_secs as i64 * 1000
    }

    pub fn keyframe_interval_ms(&self) -> i64 {
        self.keyframe_interval_secs as i64 * 1000
    }

    /// GOP length in frames, as handed to the encoder
    pub fn keyframe_interval_frames(&self) -> u32 {
        self.keyframe_interval_secs * self.frame_rate
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            segment_duration_secs: 30,
            keyframe_interval_secs: 2,
            frame_rate: 30,
        }
    }
}

/// Opaque storage handle (a file path for filesystem stores)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

impl From<PathBuf> for StorageRef {
    fn from(path: PathBuf) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finished segment as reported by the capture pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedSegment {
    /// Session-epoch milliseconds
    pub start_ms: i64,
    pub duration_ms: i64,
    pub keyframe_interval_secs: u32,
    pub frame_rate: u32,
    pub storage: StorageRef,
}

impl CapturedSegment {
    /// A full-length segment under `config`
    pub fn nominal(config: &SegmentConfig, start_ms: i64, storage: StorageRef) -> Self {
        Self {
            start_ms,
            duration_ms: config.segment_duration_ms(),
            keyframe_interval_secs: config.keyframe_interval_secs,
            frame_rate: config.frame_rate,
            storage,
        }
    }
}

/// A retained segment. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Monotonic, assigned at ingestion
    pub sequence: u64,
    pub start_ms: i64,
    pub duration_ms: i64,
    pub keyframe_interval_ms: i64,
    pub frame_rate: u32,
    pub storage: StorageRef,
}

impl Segment {
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms
    }

    /// Whether `[start, end)` intersects this segment
    pub fn intersects(&self, start_ms: i64, end_ms: i64) -> bool {
        self.start_ms < end_ms && self.end_ms() > start_ms
    }

    /// Largest keyframe offset at or before `offset_ms`
    pub fn keyframe_floor(&self, offset_ms: i64) -> i64 {
        let offset = offset_ms.clamp(0, self.duration_ms);
        offset - offset % self.keyframe_interval_ms
    }

    /// Smallest keyframe offset at or after `offset_ms`, bounded by the
    /// segment's own end
    pub fn keyframe_ceil(&self, offset_ms: i64) -> i64 {
        let offset = offset_ms.clamp(0, self.duration_ms);
        let rem = offset % self.keyframe_interval_ms;
        let ceil = if rem == 0 {
            offset
        } else {
            offset + self.keyframe_interval_ms - rem
        };
        ceil.min(self.duration_ms)
    }
}
