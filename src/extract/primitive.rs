//! Extraction primitive seam

use super::types::{ExtractError, ExtractionJob};
use async_trait::async_trait;

/// Copies a keyframe-aligned time range out of an ordered run of segments
/// into one output file, without re-encoding.
///
/// Implementations write `job.output` only on success. On failure the output
/// may be left partially written; the caller deletes it.
#[async_trait]
pub trait SegmentExtractor: Send + Sync {
    async fn extract(&self, job: &ExtractionJob) -> Result<(), ExtractError>;
}
