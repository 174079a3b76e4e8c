//! Rolling segment buffer
//!
//! Time-bounded, ingestion-ordered store of segments for one recording.
//! Ingest and eviction are serialized under one write lock; extraction works
//! from snapshots and leases, so it never blocks ingestion for longer than
//! it takes to clone a list of `Arc`s.
//!
//! Eviction removes every segment that starts before
//! `newest_end - retention`. A segment that is leased when evicted leaves
//! the index immediately, but its storage is only released once the last
//! lease on it is dropped.

use super::lease::SegmentLease;
use super::segment::{CapturedSegment, Segment, SegmentConfig};
use super::store::SegmentStore;
use super::BufferError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub(super) struct BufferState {
    pub(super) segments: VecDeque<Arc<Segment>>,
    /// Outstanding lease count per sequence
    pub(super) leases: HashMap<u64, usize>,
    /// Evicted while leased; released when the count reaches zero
    pub(super) deferred: HashMap<u64, Arc<Segment>>,
    pub(super) active_leases: usize,
    next_sequence: u64,
    last_end_ms: Option<i64>,
    ingested: u64,
    evicted: u64,
}

pub(super) struct BufferShared {
    pub(super) config: SegmentConfig,
    pub(super) retention_ms: i64,
    pub(super) store: Arc<dyn SegmentStore>,
    pub(super) state: RwLock<BufferState>,
    /// End of the newest ingested segment
    coverage: watch::Sender<Option<i64>>,
}

impl BufferShared {
    pub(super) fn release_all(&self, segments: Vec<Arc<Segment>>) {
        for segment in segments {
            if let Err(e) = self.store.release(&segment.storage) {
                tracing::warn!(
                    sequence = segment.sequence,
                    "Failed to release segment {}: {}",
                    segment.storage,
                    e
                );
            }
        }
    }
}

/// Immutable ordered view of the retained segments
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    segments: Vec<Arc<Segment>>,
}

impl BufferSnapshot {
    pub(super) fn new(segments: Vec<Arc<Segment>>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn oldest_start_ms(&self) -> Option<i64> {
        self.segments.first().map(|s| s.start_ms)
    }

    pub fn newest_end_ms(&self) -> Option<i64> {
        self.segments.last().map(|s| s.end_ms())
    }

    /// Newest end minus oldest start
    pub fn span_ms(&self) -> i64 {
        match (self.oldest_start_ms(), self.newest_end_ms()) {
            (Some(start), Some(end)) => end - start,
            _ => 0,
        }
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub segments: usize,
    pub oldest_start_ms: Option<i64>,
    pub newest_end_ms: Option<i64>,
    pub span_ms: i64,
    pub ingested: u64,
    pub evicted: u64,
    pub active_leases: usize,
    pub deferred_releases: usize,
}

/// Rolling buffer handle. Clones share the same buffer.
#[derive(Clone)]
pub struct RollingBuffer {
    shared: Arc<BufferShared>,
}

impl RollingBuffer {
    pub fn new(
        config: SegmentConfig,
        retention: Duration,
        store: Arc<dyn SegmentStore>,
    ) -> Result<Self, BufferError> {
        config.validate()?;
        let retention_ms = retention.as_millis() as i64;
        if retention_ms < config.segment_duration_ms() {
            return Err(BufferError::InvalidConfig(format!(
                "retention {}ms is shorter than one segment ({}ms)",
                retention_ms,
                config.segment_duration_ms()
            )));
        }

        let (coverage, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(BufferShared {
                config,
                retention_ms,
                store,
                state: RwLock::new(BufferState {
                    segments: VecDeque::new(),
                    leases: HashMap::new(),
                    deferred: HashMap::new(),
                    active_leases: 0,
                    next_sequence: 0,
                    last_end_ms: None,
                    ingested: 0,
                    evicted: 0,
                }),
                coverage,
            }),
        })
    }

    pub fn config(&self) -> SegmentConfig {
        self.shared.config
    }

    pub fn retention_ms(&self) -> i64 {
        self.shared.retention_ms
    }

    /// Append a finished segment and evict what fell out of the window.
    ///
    /// A segment may be shorter than nominal: the one written when capture
    /// stops ends wherever the recorder stopped, so its duration need not be
    /// a keyframe multiple. Its keyframes still sit on the grid from its
    /// start, and read bounds inside it clamp to its end.
    pub fn ingest(&self, captured: CapturedSegment) -> Result<Arc<Segment>, BufferError> {
        let config = &self.shared.config;
        if captured.keyframe_interval_secs != config.keyframe_interval_secs
            || captured.frame_rate != config.frame_rate
        {
            tracing::error!(
                "Segment {} has keyframe interval {}s @ {}fps, buffer expects {}s @ {}fps",
                captured.storage,
                captured.keyframe_interval_secs,
                captured.frame_rate,
                config.keyframe_interval_secs,
                config.frame_rate
            );
            return Err(BufferError::ConfigMismatch(format!(
                "keyframe interval {}s @ {}fps",
                captured.keyframe_interval_secs, captured.frame_rate
            )));
        }
        if captured.duration_ms <= 0 || captured.duration_ms > config.segment_duration_ms() {
            tracing::error!(
                "Segment {} has duration {}ms, nominal is {}ms",
                captured.storage,
                captured.duration_ms,
                config.segment_duration_ms()
            );
            return Err(BufferError::ConfigMismatch(format!(
                "duration {}ms",
                captured.duration_ms
            )));
        }

        let (segment, released) = {
            let mut state = self.shared.state.write();
            if let Some(previous_end_ms) = state.last_end_ms {
                if captured.start_ms < previous_end_ms {
                    tracing::error!(
                        "Ordering violation: segment {} starts at {}ms before previous end {}ms",
                        captured.storage,
                        captured.start_ms,
                        previous_end_ms
                    );
                    return Err(BufferError::OrderingViolation {
                        previous_end_ms,
                        start_ms: captured.start_ms,
                    });
                }
            }

            let segment = Arc::new(Segment {
                sequence: state.next_sequence,
                start_ms: captured.start_ms,
                duration_ms: captured.duration_ms,
                keyframe_interval_ms: config.keyframe_interval_ms(),
                frame_rate: captured.frame_rate,
                storage: captured.storage,
            });
            state.next_sequence += 1;
            state.ingested += 1;
            state.last_end_ms = Some(segment.end_ms());
            state.segments.push_back(segment.clone());

            let cutoff = segment.end_ms() - self.shared.retention_ms;
            let released = evict_locked(&mut state, cutoff);
            (segment, released)
        };

        tracing::debug!(
            sequence = segment.sequence,
            "Ingested segment [{}ms, {}ms)",
            segment.start_ms,
            segment.end_ms()
        );
        self.shared.release_all(released);
        self.shared.coverage.send_replace(Some(segment.end_ms()));
        Ok(segment)
    }

    /// Evict every segment starting before `cutoff_ms`. Returns how many
    /// left the index.
    pub fn evict_older_than(&self, cutoff_ms: i64) -> usize {
        let (evicted, released) = {
            let mut state = self.shared.state.write();
            let before = state.segments.len();
            let released = evict_locked(&mut state, cutoff_ms);
            (before - state.segments.len(), released)
        };
        self.shared.release_all(released);
        evicted
    }

    /// Current retained segments
    pub fn snapshot(&self) -> BufferSnapshot {
        let state = self.shared.state.read();
        BufferSnapshot::new(state.segments.iter().cloned().collect())
    }

    /// Snapshot plus a lease on every segment in it
    pub fn lease_snapshot(&self) -> SegmentLease {
        let segments: Vec<Arc<Segment>> = {
            let mut state = self.shared.state.write();
            let segments: Vec<Arc<Segment>> = state.segments.iter().cloned().collect();
            for segment in &segments {
                *state.leases.entry(segment.sequence).or_insert(0) += 1;
            }
            state.active_leases += 1;
            segments
        };
        SegmentLease::new(self.shared.clone(), segments)
    }

    /// End of the newest ingested segment
    pub fn coverage_end_ms(&self) -> Option<i64> {
        *self.shared.coverage.borrow()
    }

    /// Wait until the buffer covers `t_ms` or `timeout` passes. Returns
    /// whether it is covered.
    pub async fn wait_until_covered(&self, t_ms: i64, timeout: Duration) -> bool {
        let mut rx = self.shared.coverage.subscribe();
        let covered = async {
            rx.wait_for(|end| matches!(*end, Some(end) if end >= t_ms))
                .await
                .is_ok()
        };
        tokio::time::timeout(timeout, covered)
            .await
            .unwrap_or(false)
    }

    pub fn active_leases(&self) -> usize {
        self.shared.state.read().active_leases
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.shared.state.read();
        let oldest_start_ms = state.segments.front().map(|s| s.start_ms);
        let newest_end_ms = state.segments.back().map(|s| s.end_ms());
        BufferStats {
            segments: state.segments.len(),
            oldest_start_ms,
            newest_end_ms,
            span_ms: match (oldest_start_ms, newest_end_ms) {
                (Some(start), Some(end)) => end - start,
                _ => 0,
            },
            ingested: state.ingested,
            evicted: state.evicted,
            active_leases: state.active_leases,
            deferred_releases: state.deferred.len(),
        }
    }
}

/// Pop segments starting before `cutoff_ms`. Returns those whose storage
/// can be released now.
fn evict_locked(state: &mut BufferState, cutoff_ms: i64) -> Vec<Arc<Segment>> {
    let mut released = Vec::new();
    while state
        .segments
        .front()
        .is_some_and(|oldest| oldest.start_ms < cutoff_ms)
    {
        let Some(segment) = state.segments.pop_front() else {
            break;
        };
        state.evicted += 1;
        let leased = state.leases.get(&segment.sequence).copied().unwrap_or(0) > 0;
        tracing::debug!(
            sequence = segment.sequence,
            leased,
            "Evicting segment starting at {}ms",
            segment.start_ms
        );
        if leased {
            state.deferred.insert(segment.sequence, segment);
        } else {
            released.push(segment);
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::segment::StorageRef;
    use crate::buffer::store::MemorySegmentStore;

    fn buffer(retention_secs: u64) -> (RollingBuffer, Arc<MemorySegmentStore>) {
        let store = Arc::new(MemorySegmentStore::new());
        let buffer = RollingBuffer::new(
            SegmentConfig::default(),
            Duration::from_secs(retention_secs),
            store.clone(),
        )
        .unwrap();
        (buffer, store)
    }

    fn captured(start_secs: i64) -> CapturedSegment {
        CapturedSegment::nominal(
            &SegmentConfig::default(),
            start_secs * 1000,
            StorageRef::new(format!("segment_{:05}.mp4", start_secs)),
        )
    }

    #[test]
    fn test_eleven_segments_keep_most_recent_ten() {
        let (buffer, store) = buffer(300);
        for i in 0..11 {
            buffer.ingest(captured(i * 30)).unwrap();
        }

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 10);
        assert_eq!(snapshot.oldest_start_ms(), Some(30_000));
        assert_eq!(snapshot.newest_end_ms(), Some(330_000));
        assert_eq!(snapshot.span_ms(), 300_000);
        assert_eq!(store.released(), vec![StorageRef::new("segment_00000.mp4")]);
    }

    #[test]
    fn test_retained_span_never_exceeds_retention() {
        for retention in [30u64, 60, 90, 120, 300] {
            let (buffer, _) = buffer(retention);
            let mut start = 0;
            for i in 0..40 {
                // Occasional gaps in the capture
                if i % 7 == 3 {
                    start += 12;
                }
                buffer.ingest(captured(start)).unwrap();
                start += 30;

                let snapshot = buffer.snapshot();
                assert!(snapshot.span_ms() <= retention as i64 * 1000);
                for pair in snapshot.segments().windows(2) {
                    assert!(pair[0].sequence < pair[1].sequence);
                    assert!(pair[0].end_ms() <= pair[1].start_ms);
                }
            }
        }
    }

    #[test]
    fn test_ordering_violation_is_rejected() {
        let (buffer, _) = buffer(300);
        buffer.ingest(captured(0)).unwrap();
        buffer.ingest(captured(30)).unwrap();

        let err = buffer.ingest(captured(45)).unwrap_err();
        assert!(matches!(
            err,
            BufferError::OrderingViolation {
                previous_end_ms: 60_000,
                start_ms: 45_000
            }
        ));
        assert_eq!(buffer.snapshot().len(), 2);
    }

    #[test]
    fn test_short_final_segment_is_accepted() {
        let (buffer, _) = buffer(300);
        buffer.ingest(captured(0)).unwrap();
        let mut tail = captured(30);
        tail.duration_ms = 400;
        let tail = buffer.ingest(tail).unwrap();

        assert_eq!(tail.end_ms(), 30_400);
        assert_eq!(tail.keyframe_floor(399), 0);
        assert_eq!(tail.keyframe_ceil(1), 400);

        // Capture resumes after the stop
        buffer.ingest(captured(60)).unwrap();
        assert_eq!(buffer.snapshot().len(), 3);
    }

    #[test]
    fn test_oversized_segment_is_rejected() {
        let (buffer, _) = buffer(300);
        let mut segment = captured(0);
        segment.duration_ms = 32_000;
        assert!(matches!(
            buffer.ingest(segment),
            Err(BufferError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn test_config_mismatch_is_rejected() {
        let (buffer, _) = buffer(300);
        let mut segment = captured(0);
        segment.keyframe_interval_secs = 3;
        assert!(matches!(
            buffer.ingest(segment),
            Err(BufferError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn test_retention_shorter_than_segment_is_invalid() {
        let store = Arc::new(MemorySegmentStore::new());
        assert!(RollingBuffer::new(SegmentConfig::default(), Duration::from_secs(10), store).is_err());
    }

    #[test]
    fn test_leased_segment_release_is_deferred() {
        let (buffer, store) = buffer(60);
        buffer.ingest(captured(0)).unwrap();
        buffer.ingest(captured(30)).unwrap();

        let lease = buffer.lease_snapshot();
        assert_eq!(buffer.active_leases(), 1);

        buffer.ingest(captured(60)).unwrap();
        // Out of the index, storage still valid
        assert_eq!(buffer.snapshot().oldest_start_ms(), Some(30_000));
        assert!(store.released().is_empty());
        assert_eq!(buffer.stats().deferred_releases, 1);

        drop(lease);
        assert_eq!(buffer.active_leases(), 0);
        assert_eq!(store.released(), vec![StorageRef::new("segment_00000.mp4")]);
        assert_eq!(buffer.stats().deferred_releases, 0);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_ingest() {
        let (buffer, _) = buffer(60);
        buffer.ingest(captured(0)).unwrap();
        let snapshot = buffer.snapshot();
        buffer.ingest(captured(30)).unwrap();
        buffer.ingest(captured(60)).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.segments()[0].start_ms, 0);
    }

    #[test]
    fn test_explicit_eviction() {
        let (buffer, store) = buffer(300);
        for i in 0..4 {
            buffer.ingest(captured(i * 30)).unwrap();
        }
        assert_eq!(buffer.evict_older_than(60_000), 2);
        assert_eq!(buffer.snapshot().oldest_start_ms(), Some(60_000));
        assert_eq!(store.released().len(), 2);
        assert_eq!(buffer.stats().evicted, 2);
    }

    #[tokio::test]
    async fn test_wait_until_covered() {
        let (buffer, _) = buffer(300);
        buffer.ingest(captured(0)).unwrap();
        assert!(buffer.wait_until_covered(20_000, Duration::from_millis(10)).await);
        assert!(!buffer.wait_until_covered(45_000, Duration::from_millis(20)).await);

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait_until_covered(45_000, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.ingest(captured(30)).unwrap();
        assert!(waiter.await.unwrap());
    }
}
