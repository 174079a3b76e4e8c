//! Highlight storage
//!
//! Owns the clip blobs the ledger points at. The filesystem variant keeps
//! one file per clip in a directory and can mirror the ledger to
//! `highlights.json` so entries survive a restart.

use super::{Highlight, StorageError};
use crate::buffer::StorageRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const INDEX_FILE: &str = "highlights.json";

#[async_trait]
pub trait HighlightStorage: Send + Sync {
    /// Reserve the location a new clip will be written to
    async fn allocate(&self, id: Uuid) -> Result<StorageRef, StorageError>;

    /// Delete a clip. Deleting something already gone succeeds.
    async fn delete(&self, storage: &StorageRef) -> Result<(), StorageError>;

    /// Persist the ledger, newest first
    async fn save_index(&self, _entries: &[Highlight]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Entries persisted by a previous run
    async fn load_index(&self) -> Result<Vec<Highlight>, StorageError> {
        Ok(Vec::new())
    }
}

/// Clips as files under one directory
#[derive(Debug, Clone)]
pub struct FsHighlightStorage {
    dir: PathBuf,
    extension: String,
    mirror_index: bool,
}

impl FsHighlightStorage {
    /// Create the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            extension: "mp4".to_string(),
            mirror_index: true,
        })
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Whether the ledger is mirrored to `highlights.json`
    pub fn with_index(mut self, mirror_index: bool) -> Self {
        self.mirror_index = mirror_index;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn owns(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
    }
}

#[async_trait]
impl HighlightStorage for FsHighlightStorage {
    async fn allocate(&self, id: Uuid) -> Result<StorageRef, StorageError> {
        let path = self.dir.join(format!("{}.{}", id, self.extension));
        Ok(StorageRef::from(path))
    }

    async fn delete(&self, storage: &StorageRef) -> Result<(), StorageError> {
        let path = storage.to_path();
        if !self.owns(&path) {
            return Err(StorageError::InvalidLocation(storage.to_string()));
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted highlight file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_index(&self, entries: &[Highlight]) -> Result<(), StorageError> {
        if !self.mirror_index {
            return Ok(());
        }
        let content = serde_json::to_string_pretty(entries)?;
        let staging = self.dir.join(format!("{}.{}.tmp", INDEX_FILE, Uuid::new_v4().simple()));
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, self.index_path()).await?;
        Ok(())
    }

    async fn load_index(&self) -> Result<Vec<Highlight>, StorageError> {
        if !self.mirror_index {
            return Ok(Vec::new());
        }
        let path = self.index_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            // No index yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<Highlight> = serde_json::from_str(&content)?;
        tracing::debug!("Loaded {} highlight(s) from {:?}", entries.len(), path);
        Ok(entries)
    }
}

/// Tracks allocated locations in memory
#[derive(Debug, Default)]
pub struct MemoryHighlightStorage {
    live: Mutex<HashSet<StorageRef>>,
    deletes: Mutex<Vec<StorageRef>>,
}

impl MemoryHighlightStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, storage: &StorageRef) -> bool {
        self.live.lock().contains(storage)
    }

    /// Every delete request, including repeats
    pub fn deletes(&self) -> Vec<StorageRef> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl HighlightStorage for MemoryHighlightStorage {
    async fn allocate(&self, id: Uuid) -> Result<StorageRef, StorageError> {
        let storage = StorageRef::new(format!("memory://{}.mp4", id));
        self.live.lock().insert(storage.clone());
        Ok(storage)
    }

    async fn delete(&self, storage: &StorageRef) -> Result<(), StorageError> {
        self.live.lock().remove(storage);
        self.deletes.lock().push(storage.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn highlight(storage: StorageRef) -> Highlight {
        Highlight {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            trigger_ms: 320_000,
            requested_ms: 40_000,
            duration_ms: 40_000,
            partial: false,
            storage,
            source_peer: None,
        }
    }

    #[tokio::test]
    async fn test_fs_allocate_and_delete() {
        let dir = tempdir().unwrap();
        let storage = FsHighlightStorage::new(dir.path().join("clips")).unwrap();
        let id = Uuid::new_v4();

        let location = storage.allocate(id).await.unwrap();
        assert_eq!(
            location.to_path(),
            dir.path().join("clips").join(format!("{}.mp4", id))
        );

        std::fs::write(location.to_path(), b"clip").unwrap();
        storage.delete(&location).await.unwrap();
        assert!(!location.to_path().exists());
        // Already gone
        storage.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_refuses_foreign_paths() {
        let dir = tempdir().unwrap();
        let storage = FsHighlightStorage::new(dir.path()).unwrap();
        let foreign = StorageRef::new("/etc/hosts");
        assert!(matches!(
            storage.delete(&foreign).await,
            Err(StorageError::InvalidLocation(_))
        ));
    }

    #[tokio::test]
    async fn test_index_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FsHighlightStorage::new(dir.path()).unwrap();
        assert!(storage.load_index().await.unwrap().is_empty());

        let entry = highlight(storage.allocate(Uuid::new_v4()).await.unwrap());
        storage.save_index(std::slice::from_ref(&entry)).await.unwrap();

        assert!(storage.index_path().exists());
        assert_eq!(storage.load_index().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_index_disabled() {
        let dir = tempdir().unwrap();
        let storage = FsHighlightStorage::new(dir.path()).unwrap().with_index(false);
        let entry = highlight(StorageRef::new("x"));
        storage.save_index(&[entry]).await.unwrap();
        assert!(!storage.index_path().exists());
    }
}
