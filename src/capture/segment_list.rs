//! Segment list tailing
//!
//! FFmpeg's `segment` muxer with `-segment_list_type csv` appends one line
//! per finished segment: `file,start_secs,end_secs`, times relative to the
//! start of the recording. The watcher polls the list, ingests every new
//! complete line and snaps boundaries to the keyframe grid, since segments
//! are always cut on keyframes and the muxer reports frame timestamps.

use super::CaptureError;
use crate::buffer::{CapturedSegment, RollingBuffer, StorageRef};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentListEntry {
    pub file: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl SegmentListEntry {
    pub fn parse(line: &str) -> Result<Self, CaptureError> {
        // File names may contain commas, the two times never do
        let mut fields = line.trim().rsplitn(3, ',');
        let end = fields.next();
        let start = fields.next();
        let file = fields.next();
        let (Some(file), Some(start), Some(end)) = (file, start, end) else {
            return Err(CaptureError::Parse(line.to_string()));
        };

        let parse_time = |field: &str| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|_| CaptureError::Parse(line.to_string()))
        };
        let start_secs = parse_time(start)?;
        let end_secs = parse_time(end)?;
        if file.is_empty() || !start_secs.is_finite() || end_secs <= start_secs {
            return Err(CaptureError::Parse(line.to_string()));
        }

        Ok(Self {
            file: file.trim_matches('"').to_string(),
            start_secs,
            end_secs,
        })
    }
}

/// Feeds finished segments from a segment list into a buffer
pub struct SegmentListWatcher {
    list_path: PathBuf,
    segment_dir: PathBuf,
    buffer: RollingBuffer,
    /// Session-epoch time of recording start
    origin_ms: i64,
    poll_interval: Duration,
    consumed: usize,
}

impl SegmentListWatcher {
    pub fn new(list_path: impl Into<PathBuf>, buffer: RollingBuffer, origin_ms: i64) -> Self {
        let list_path = list_path.into();
        let segment_dir = list_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            list_path,
            segment_dir,
            buffer,
            origin_ms,
            poll_interval: Duration::from_millis(250),
            consumed: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn snap(&self, offset_ms: i64) -> i64 {
        let grid = self.buffer.config().keyframe_interval_ms();
        (offset_ms + grid / 2).div_euclid(grid) * grid
    }

    /// Segment as the buffer expects it
    pub fn to_captured(&self, entry: &SegmentListEntry) -> CapturedSegment {
        let config = self.buffer.config();
        let raw_start = (entry.start_secs * 1000.0).round() as i64;
        let raw_end = (entry.end_secs * 1000.0).round() as i64;

        let start = self.snap(raw_start);
        let snapped_end = self.snap(raw_end);
        let end = if snapped_end > start { snapped_end } else { raw_end };
        let duration_ms = (end - start).clamp(1, config.segment_duration_ms());

        let path = Path::new(&entry.file);
        let storage = if path.is_absolute() {
            StorageRef::new(entry.file.clone())
        } else {
            StorageRef::from(self.segment_dir.join(path))
        };

        CapturedSegment {
            start_ms: self.origin_ms + start,
            duration_ms,
            keyframe_interval_secs: config.keyframe_interval_secs,
            frame_rate: config.frame_rate,
            storage,
        }
    }

    /// Ingest every complete line appended since the last poll. Returns
    /// how many segments were ingested.
    pub async fn poll_once(&mut self) -> Result<usize, CaptureError> {
        let content = match tokio::fs::read(&self.list_path).await {
            Ok(content) => content,
            // Encoder has not produced a segment yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if content.len() < self.consumed {
            tracing::warn!("Segment list {:?} was truncated, rereading", self.list_path);
            self.consumed = 0;
        }

        let fresh = &content[self.consumed..];
        let Some(complete) = fresh.iter().rposition(|b| *b == b'\n').map(|i| i + 1) else {
            return Ok(0);
        };
        let text = String::from_utf8_lossy(&fresh[..complete]).into_owned();
        self.consumed += complete;

        let mut ingested = 0;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let entry = match SegmentListEntry::parse(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping segment list line: {}", e);
                    continue;
                }
            };
            match self.buffer.ingest(self.to_captured(&entry)) {
                Ok(_) => ingested += 1,
                Err(e) => tracing::error!("Segment {} not ingested: {}", entry.file, e),
            }
        }
        Ok(ingested)
    }

    /// Poll until `cancel` fires
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Watching segment list {:?}", self.list_path);
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            tracing::warn!("Failed to read segment list: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Segment list watcher stopped");
        })
    }
}
