//! Clip planning
//!
//! Pure computation from a buffer snapshot and a request to the segments and
//! offsets the extraction primitive needs. The clip starts on the keyframe at
//! or before the window start (cutting on a keyframe needs no re-encode) and
//! ends at the trigger instant, so a fully buffered request yields a clip of
//! `[D, D + keyframe_interval)`.

use super::types::{ClipRequest, Coverage, ExtractError, ExtractionJob, PartialReason};
use crate::buffer::{BufferSnapshot, Segment, StorageRef};
use std::sync::Arc;

/// Segments and offsets for one clip
#[derive(Debug, Clone)]
pub struct ClipPlan {
    /// Contiguous run in time order
    pub segments: Vec<Arc<Segment>>,
    /// Keyframe-aligned cut within the first segment
    pub start_offset_ms: i64,
    /// Keyframe-aligned read bound within the last segment
    pub read_end_offset_ms: i64,
    /// Session-epoch start of the produced clip
    pub clip_start_ms: i64,
    /// Session-epoch end of the produced clip
    pub clip_end_ms: i64,
    pub coverage: Coverage,
}

impl ClipPlan {
    pub fn duration_ms(&self) -> i64 {
        self.clip_end_ms - self.clip_start_ms
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.sequence).collect()
    }

    /// The primitive invocation writing to `output`
    pub fn job(&self, output: StorageRef) -> ExtractionJob {
        ExtractionJob {
            sources: self.segments.iter().map(|s| s.storage.clone()).collect(),
            start_offset_ms: self.start_offset_ms,
            read_end_offset_ms: self.read_end_offset_ms,
            duration_ms: self.duration_ms(),
            output,
        }
    }
}

/// Plan the clip for `request` against `snapshot`
pub fn plan_clip(
    snapshot: &BufferSnapshot,
    request: &ClipRequest,
) -> Result<ClipPlan, ExtractError> {
    if request.duration_ms <= 0 {
        return Err(ExtractError::InvalidRequest(format!(
            "duration must be positive, got {}ms",
            request.duration_ms
        )));
    }

    let segments = snapshot.segments();
    let (Some(oldest), Some(newest)) = (segments.first(), segments.last()) else {
        return Err(ExtractError::NoData);
    };

    let requested_start = request.window_start_ms();
    let window_end = request.trigger_ms.min(newest.end_ms());
    let window_start = requested_start.max(oldest.start_ms);

    if window_end <= oldest.start_ms {
        return Err(ExtractError::WindowNotBuffered(format!(
            "trigger at {}ms precedes oldest buffered data at {}ms",
            request.trigger_ms, oldest.start_ms
        )));
    }
    if window_start >= window_end {
        return Err(ExtractError::WindowNotBuffered(format!(
            "window [{}ms, {}ms] lies past buffered data ending at {}ms",
            requested_start,
            request.trigger_ms,
            newest.end_ms()
        )));
    }

    let selected: Vec<usize> = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.intersects(window_start, window_end))
        .map(|(i, _)| i)
        .collect();
    let Some(&last_index) = selected.last() else {
        return Err(ExtractError::WindowNotBuffered(format!(
            "window [{}ms, {}ms] falls in a recording gap",
            window_start, window_end
        )));
    };

    // Walk back from the newest selected segment while the run is contiguous
    let mut first_index = last_index;
    while first_index > 0
        && selected.contains(&(first_index - 1))
        && segments[first_index - 1].end_ms() == segments[first_index].start_ms
    {
        first_index -= 1;
    }

    let run: Vec<Arc<Segment>> = segments[first_index..=last_index].to_vec();
    let first = &run[0];
    let last = &run[run.len() - 1];

    let effective_start = window_start.max(first.start_ms);
    let start_offset_ms = first.keyframe_floor(effective_start - first.start_ms);
    let clip_start_ms = first.start_ms + start_offset_ms;
    // A trigger inside a recording gap ends the clip at the run's last frame
    let clip_end_ms = window_end.min(last.end_ms());
    let read_end_offset_ms = last.keyframe_ceil(clip_end_ms - last.start_ms);

    let reason = if clip_end_ms < request.trigger_ms {
        if last_index + 1 == segments.len() {
            Some(PartialReason::TriggerNotBuffered)
        } else {
            Some(PartialReason::Gap)
        }
    } else if clip_start_ms > requested_start {
        if first_index > 0 {
            Some(PartialReason::Gap)
        } else {
            Some(PartialReason::BufferTooShort)
        }
    } else {
        None
    };
    let coverage = match reason {
        None => Coverage::Full,
        Some(reason) => Coverage::Partial {
            requested_ms: request.duration_ms,
            available_ms: clip_end_ms - clip_start_ms,
            reason,
        },
    };

    Ok(ClipPlan {
        segments: run,
        start_offset_ms,
        read_end_offset_ms,
        clip_start_ms,
        clip_end_ms,
        coverage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CapturedSegment, MemorySegmentStore, RollingBuffer, SegmentConfig};
    use std::time::Duration;

    fn buffer_with(starts_secs: &[i64], retention_secs: u64) -> RollingBuffer {
        let buffer = RollingBuffer::new(
            SegmentConfig::default(),
            Duration::from_secs(retention_secs),
            Arc::new(MemorySegmentStore::new()),
        )
        .unwrap();
        for start in starts_secs {
            buffer
                .ingest(CapturedSegment::nominal(
                    &SegmentConfig::default(),
                    start * 1000,
                    StorageRef::new(format!("seg_{}.mp4", start)),
                ))
                .unwrap();
        }
        buffer
    }

    fn consecutive(count: i64) -> Vec<i64> {
        (0..count).map(|i| i * 30).collect()
    }

    #[test]
    fn test_reference_scenario() {
        let buffer = buffer_with(&consecutive(11), 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(320_000, 40)).unwrap();

        let starts: Vec<i64> = plan.segments.iter().map(|s| s.start_ms).collect();
        assert_eq!(starts, vec![270_000, 300_000]);
        assert_eq!(plan.start_offset_ms, 10_000);
        assert_eq!(plan.clip_start_ms, 280_000);
        assert_eq!(plan.read_end_offset_ms, 20_000);
        assert_eq!(plan.coverage, Coverage::Full);
        assert!((40_000..42_000).contains(&plan.duration_ms()));
    }

    #[test]
    fn test_unaligned_window_rounds_start_down() {
        let buffer = buffer_with(&consecutive(4), 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(100_500, 30)).unwrap();

        // Window starts at 70.5s; previous keyframe is at 70s
        assert_eq!(plan.clip_start_ms, 70_000);
        assert_eq!(plan.start_offset_ms, 10_000);
        assert_eq!(plan.duration_ms(), 30_500);
        assert_eq!(plan.read_end_offset_ms, 12_000);
    }

    #[test]
    fn test_duration_within_one_keyframe_interval() {
        let buffer = buffer_with(&consecutive(11), 300);
        let snapshot = buffer.snapshot();
        let kf = 2_000;

        for duration_secs in [1u32, 5, 17, 30, 40, 59, 120, 299] {
            let mut trigger = 30_000 + duration_secs as i64 * 1000;
            while trigger <= 330_000 {
                let request = ClipRequest::new(trigger, duration_secs);
                let plan = plan_clip(&snapshot, &request).unwrap();
                assert_eq!(plan.coverage, Coverage::Full, "T={} D={}", trigger, duration_secs);
                assert!(plan.duration_ms() >= request.duration_ms);
                assert!(plan.duration_ms() < request.duration_ms + kf);
                assert_eq!(plan.start_offset_ms % kf, 0);
                assert_eq!(plan.read_end_offset_ms % kf, 0);
                trigger += 3_700;
            }
        }
    }

    #[test]
    fn test_window_before_oldest_is_partial() {
        let buffer = buffer_with(&consecutive(2), 300);
        let request = ClipRequest::new(50_000, 60);
        let plan = plan_clip(&buffer.snapshot(), &request).unwrap();

        assert_eq!(plan.clip_start_ms, 0);
        assert_eq!(plan.duration_ms(), 50_000);
        assert_eq!(
            plan.coverage,
            Coverage::Partial {
                requested_ms: 60_000,
                available_ms: 50_000,
                reason: PartialReason::BufferTooShort,
            }
        );
    }

    #[test]
    fn test_trigger_past_newest_is_partial() {
        let buffer = buffer_with(&consecutive(3), 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(95_000, 30)).unwrap();

        assert_eq!(plan.clip_end_ms, 90_000);
        assert_eq!(plan.clip_start_ms, 64_000);
        assert!(matches!(
            plan.coverage,
            Coverage::Partial {
                reason: PartialReason::TriggerNotBuffered,
                ..
            }
        ));
    }

    #[test]
    fn test_gap_shortens_to_contiguous_run() {
        // 0-30, 30-60, gap, 90-120
        let buffer = buffer_with(&[0, 30, 90], 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(110_000, 40)).unwrap();

        assert_eq!(plan.sequences(), vec![2]);
        assert_eq!(plan.clip_start_ms, 90_000);
        assert!(matches!(
            plan.coverage,
            Coverage::Partial {
                reason: PartialReason::Gap,
                ..
            }
        ));
    }

    #[test]
    fn test_trigger_in_gap_ends_at_last_frame() {
        // 0-30, 30-60, gap, 90-120; trigger at 75s
        let buffer = buffer_with(&[0, 30, 90], 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(75_000, 20)).unwrap();

        assert_eq!(plan.sequences(), vec![1]);
        assert_eq!(plan.clip_start_ms, 54_000);
        assert_eq!(plan.clip_end_ms, 60_000);
        assert_eq!(plan.duration_ms(), 6_000);
        assert_eq!(plan.read_end_offset_ms, 30_000);
        assert_eq!(
            plan.coverage,
            Coverage::Partial {
                requested_ms: 20_000,
                available_ms: 6_000,
                reason: PartialReason::Gap,
            }
        );
        assert_eq!(plan.job(StorageRef::new("out.mp4")).duration_ms, 6_000);
    }

    #[test]
    fn test_empty_buffer_is_no_data() {
        let buffer = buffer_with(&[], 300);
        assert!(matches!(
            plan_clip(&buffer.snapshot(), &ClipRequest::new(1_000, 30)),
            Err(ExtractError::NoData)
        ));
    }

    #[test]
    fn test_trigger_before_oldest_is_not_buffered() {
        let buffer = buffer_with(&consecutive(11), 300);
        assert!(matches!(
            plan_clip(&buffer.snapshot(), &ClipRequest::new(20_000, 10)),
            Err(ExtractError::WindowNotBuffered(_))
        ));
    }

    #[test]
    fn test_job_carries_sources_in_order() {
        let buffer = buffer_with(&consecutive(11), 300);
        let plan = plan_clip(&buffer.snapshot(), &ClipRequest::new(320_000, 40)).unwrap();
        let job = plan.job(StorageRef::new("out.mp4"));

        assert_eq!(
            job.sources,
            vec![StorageRef::new("seg_270.mp4"), StorageRef::new("seg_300.mp4")]
        );
        assert_eq!(job.start_offset_ms, 10_000);
        assert_eq!(job.duration_ms, 40_000);
    }
}
