//! In-memory highlight ledger, newest first

use super::storage::HighlightStorage;
use super::{Highlight, StorageError};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct HighlightLedger {
    entries: RwLock<Vec<Highlight>>,
    storage: Arc<dyn HighlightStorage>,
    /// Held across snapshot and write so the index never goes backwards
    mirror_lock: Mutex<()>,
}

impl HighlightLedger {
    /// Empty ledger
    pub fn new(storage: Arc<dyn HighlightStorage>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            storage,
            mirror_lock: Mutex::new(()),
        }
    }

    /// Ledger seeded from whatever the storage persisted. An unreadable
    /// index starts an empty ledger; it is replaced on the next record.
    pub async fn open(storage: Arc<dyn HighlightStorage>) -> Result<Self, StorageError> {
        let mut entries = match storage.load_index().await {
            Ok(entries) => entries,
            Err(StorageError::Json(e)) => {
                tracing::warn!("Highlight index is corrupt, starting empty: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tracing::info!("Highlight ledger opened with {} entries", entries.len());
        Ok(Self {
            entries: RwLock::new(entries),
            storage,
            mirror_lock: Mutex::new(()),
        })
    }

    pub fn storage(&self) -> &Arc<dyn HighlightStorage> {
        &self.storage
    }

    /// Add a new entry at the front
    pub async fn record(&self, highlight: Highlight) {
        tracing::info!(
            id = %highlight.id,
            "Recorded highlight: {:.1}s at {}",
            highlight.duration_secs(),
            highlight.storage
        );
        self.entries.write().insert(0, highlight);
        self.mirror().await;
    }

    /// Snapshot, newest first
    pub fn list(&self) -> Vec<Highlight> {
        self.entries.read().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Highlight> {
        self.entries.read().iter().find(|h| h.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove an entry and its clip. Returns whether an entry was removed;
    /// deleting an unknown id is a no-op. The entry stays when the clip
    /// cannot be deleted, so the call can be retried.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StorageError> {
        let Some(highlight) = self.get(id) else {
            return Ok(false);
        };

        if let Err(e) = self.storage.delete(&highlight.storage).await {
            tracing::warn!(id = %id, "Failed to delete highlight clip: {}", e);
            return Err(e);
        }

        let removed = {
            let mut entries = self.entries.write();
            match entries.iter().position(|h| h.id == id) {
                Some(index) => {
                    entries.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            tracing::info!(id = %id, "Deleted highlight");
            self.mirror().await;
        }
        Ok(removed)
    }

    async fn mirror(&self) {
        let _guard = self.mirror_lock.lock().await;
        let entries = self.list();
        if let Err(e) = self.storage.save_index(&entries).await {
            tracing::warn!("Failed to persist highlight index: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StorageRef;
    use crate::highlights::{FsHighlightStorage, MemoryHighlightStorage};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::tempdir;

    /// Memory storage whose deletes are refused
    struct ReadOnlyStorage(MemoryHighlightStorage);

    #[async_trait]
    impl HighlightStorage for ReadOnlyStorage {
        async fn allocate(&self, id: Uuid) -> Result<StorageRef, StorageError> {
            self.0.allocate(id).await
        }

        async fn delete(&self, storage: &StorageRef) -> Result<(), StorageError> {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", storage),
            )
            .into())
        }
    }

    async fn entry(storage: &dyn HighlightStorage, age_secs: i64) -> Highlight {
        let id = Uuid::new_v4();
        Highlight {
            id,
            created_at: Utc::now() - ChronoDuration::seconds(age_secs),
            trigger_ms: 60_000,
            requested_ms: 30_000,
            duration_ms: 30_000,
            partial: false,
            storage: storage.allocate(id).await.unwrap(),
            source_peer: Some("remote-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_newest_first() {
        let storage = Arc::new(MemoryHighlightStorage::new());
        let ledger = HighlightLedger::new(storage.clone());

        let older = entry(storage.as_ref(), 10).await;
        let newer = entry(storage.as_ref(), 0).await;
        ledger.record(older.clone()).await;
        ledger.record(newer.clone()).await;

        let ids: Vec<Uuid> = ledger.list().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![newer.id, older.id]);
        assert_eq!(ledger.get(older.id), Some(older));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let storage = Arc::new(MemoryHighlightStorage::new());
        let ledger = HighlightLedger::new(storage.clone());
        let keep = entry(storage.as_ref(), 5).await;
        let gone = entry(storage.as_ref(), 0).await;
        ledger.record(keep.clone()).await;
        ledger.record(gone.clone()).await;

        assert!(ledger.delete(gone.id).await.unwrap());
        assert!(!storage.exists(&gone.storage));
        assert!(!ledger.delete(gone.id).await.unwrap());

        assert_eq!(ledger.list(), vec![keep.clone()]);
        assert!(storage.exists(&keep.storage));
        assert_eq!(storage.deletes(), vec![gone.storage]);
    }

    #[tokio::test]
    async fn test_delete_with_missing_file() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FsHighlightStorage::new(dir.path()).unwrap());
        let ledger = HighlightLedger::new(storage.clone());
        let highlight = entry(storage.as_ref(), 0).await;
        // The clip file was never written
        ledger.record(highlight.clone()).await;

        assert!(ledger.delete(highlight.id).await.unwrap());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_restores_entries() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FsHighlightStorage::new(dir.path()).unwrap());
        let ledger = HighlightLedger::new(storage.clone());
        let first = entry(storage.as_ref(), 20).await;
        let second = entry(storage.as_ref(), 0).await;
        ledger.record(first.clone()).await;
        ledger.record(second.clone()).await;
        drop(ledger);

        let reopened = HighlightLedger::open(storage).await.unwrap();
        assert_eq!(reopened.list(), vec![second, first]);
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry() {
        let storage = Arc::new(ReadOnlyStorage(MemoryHighlightStorage::new()));
        let ledger = HighlightLedger::new(storage.clone());
        let highlight = entry(storage.as_ref(), 0).await;
        ledger.record(highlight.clone()).await;

        assert!(ledger.delete(highlight.id).await.is_err());
        assert_eq!(ledger.get(highlight.id), Some(highlight.clone()));
        assert!(storage.0.exists(&highlight.storage));
        // Still addressable for a retry
        assert!(ledger.delete(highlight.id).await.is_err());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_keep_index_whole() {
        for _ in 0..5 {
            let dir = tempdir().unwrap();
            let storage = Arc::new(FsHighlightStorage::new(dir.path()).unwrap());
            let ledger = Arc::new(HighlightLedger::new(storage.clone()));

            let mut tasks = Vec::new();
            for i in 0..16 {
                let ledger = ledger.clone();
                let storage = storage.clone();
                tasks.push(tokio::spawn(async move {
                    let highlight = entry(storage.as_ref(), i).await;
                    ledger.record(highlight).await;
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let reopened = HighlightLedger::open(storage).await.unwrap();
            assert_eq!(reopened.len(), 16);
        }
    }

    #[tokio::test]
    async fn test_corrupt_index_opens_empty() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FsHighlightStorage::new(dir.path()).unwrap());
        std::fs::write(storage.index_path(), "[{\"id\": trailing").unwrap();

        let ledger = HighlightLedger::open(storage.clone()).await.unwrap();
        assert!(ledger.is_empty());

        ledger.record(entry(storage.as_ref(), 0).await).await;
        let reopened = HighlightLedger::open(storage).await.unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let ledger = HighlightLedger::new(Arc::new(MemoryHighlightStorage::new()));
        assert!(!ledger.delete(Uuid::new_v4()).await.unwrap());
        assert!(ledger.get(Uuid::new_v4()).is_none());
    }
}
