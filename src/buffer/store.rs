//! Segment storage release
//!
//! The buffer never deletes files itself; it asks a `SegmentStore` to
//! release a segment once it is evicted and no extraction holds it.

use super::segment::StorageRef;
use parking_lot::Mutex;
use std::io;

pub trait SegmentStore: Send + Sync {
    /// Release a segment's storage. Releasing something already gone is
    /// not an error.
    fn release(&self, storage: &StorageRef) -> io::Result<()>;
}

/// Segments stored as plain files
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSegmentStore;

impl SegmentStore for FsSegmentStore {
    fn release(&self, storage: &StorageRef) -> io::Result<()> {
        match std::fs::remove_file(storage.to_path()) {
            Ok(()) => {
                tracing::debug!("Released segment {}", storage);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Records releases instead of performing them
#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    released: Mutex<Vec<StorageRef>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn released(&self) -> Vec<StorageRef> {
        self.released.lock().clone()
    }

    pub fn was_released(&self, storage: &StorageRef) -> bool {
        self.released.lock().contains(storage)
    }
}

impl SegmentStore for MemorySegmentStore {
    fn release(&self, storage: &StorageRef) -> io::Result<()> {
        self.released.lock().push(storage.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fs_release_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment_000.mp4");
        std::fs::write(&path, b"data").unwrap();
        let storage = StorageRef::from(path.clone());

        FsSegmentStore.release(&storage).unwrap();
        assert!(!path.exists());
        FsSegmentStore.release(&storage).unwrap();
    }
}
