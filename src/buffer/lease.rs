//! Segment leases
//!
//! A lease pins the storage of the segments it holds for as long as it
//! lives. Dropping it releases any segment that was evicted meanwhile.

use super::rolling::{BufferShared, BufferSnapshot};
use super::segment::Segment;
use std::collections::HashSet;
use std::sync::Arc;

/// Scoped claim on a set of segments
pub struct SegmentLease {
    shared: Arc<BufferShared>,
    segments: Vec<Arc<Segment>>,
}

impl SegmentLease {
    pub(super) fn new(shared: Arc<BufferShared>, segments: Vec<Arc<Segment>>) -> Self {
        Self { shared, segments }
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    /// The leased segments as a snapshot
    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot::new(self.segments.clone())
    }

    /// Keep only `sequences`, releasing the claim on everything else
    pub fn narrow(&mut self, sequences: &[u64]) {
        let keep: HashSet<u64> = sequences.iter().copied().collect();
        let (kept, dropped): (Vec<_>, Vec<_>) = self
            .segments
            .drain(..)
            .partition(|segment| keep.contains(&segment.sequence));
        self.segments = kept;
        self.unpin(&dropped);
    }

    fn unpin(&self, segments: &[Arc<Segment>]) {
        if segments.is_empty() {
            return;
        }
        let released = {
            let mut state = self.shared.state.write();
            let mut released = Vec::new();
            for segment in segments {
                let remaining = match state.leases.get_mut(&segment.sequence) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count
                    }
                    None => 0,
                };
                if remaining == 0 {
                    state.leases.remove(&segment.sequence);
                    if let Some(evicted) = state.deferred.remove(&segment.sequence) {
                        released.push(evicted);
                    }
                }
            }
            released
        };
        self.shared.release_all(released);
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        let segments = std::mem::take(&mut self.segments);
        self.unpin(&segments);
        let mut state = self.shared.state.write();
        state.active_leases = state.active_leases.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::segment::{CapturedSegment, SegmentConfig, StorageRef};
    use crate::buffer::store::MemorySegmentStore;
    use crate::buffer::RollingBuffer;
    use std::sync::Arc;
    use std::time::Duration;

    fn captured(start_secs: i64) -> CapturedSegment {
        CapturedSegment::nominal(
            &SegmentConfig::default(),
            start_secs * 1000,
            StorageRef::new(format!("s{}", start_secs)),
        )
    }

    #[test]
    fn test_narrowed_out_segments_release_early() {
        let store = Arc::new(MemorySegmentStore::new());
        let buffer =
            RollingBuffer::new(SegmentConfig::default(), Duration::from_secs(60), store.clone())
                .unwrap();
        buffer.ingest(captured(0)).unwrap();
        buffer.ingest(captured(30)).unwrap();

        let mut lease = buffer.lease_snapshot();
        let keep = lease.segments()[1].sequence;
        lease.narrow(&[keep]);
        assert_eq!(lease.segments().len(), 1);

        // Segment 0 is no longer pinned, so eviction releases it at once
        buffer.ingest(captured(60)).unwrap();
        assert!(store.was_released(&StorageRef::new("s0")));

        // Segment 30 stays pinned past its eviction
        buffer.ingest(captured(90)).unwrap();
        assert!(!store.was_released(&StorageRef::new("s30")));
        drop(lease);
        assert!(store.was_released(&StorageRef::new("s30")));
    }

    #[test]
    fn test_overlapping_leases_release_after_last() {
        let store = Arc::new(MemorySegmentStore::new());
        let buffer =
            RollingBuffer::new(SegmentConfig::default(), Duration::from_secs(30), store.clone())
                .unwrap();
        buffer.ingest(captured(0)).unwrap();

        let first = buffer.lease_snapshot();
        let second = buffer.lease_snapshot();
        assert_eq!(buffer.active_leases(), 2);

        buffer.ingest(captured(30)).unwrap();
        drop(first);
        assert!(store.released().is_empty());
        drop(second);
        assert_eq!(store.released(), vec![StorageRef::new("s0")]);
    }
}
