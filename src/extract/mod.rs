//! Precise clip extraction
//!
//! Turns "the last D seconds before T" into one output file built from the
//! rolling buffer's segments.

pub mod extractor;
pub mod ffmpeg;
pub mod plan;
pub mod primitive;
pub mod types;

pub use extractor::ClipExtractor;
pub use ffmpeg::FfmpegExtractor;
pub use plan::{plan_clip, ClipPlan};
pub use primitive::SegmentExtractor;
pub use types::{ClipOutcome, ClipRequest, Coverage, ExtractError, ExtractionJob, PartialReason};
