use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::checkpoint::{check_regression, Checkpoint, CheckpointStore};
use crate::taxonomy::{CategoryId, SourceId};
use crate::{HarvestError, HarvestResult};

fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Writes through a temp file in the target directory, then renames.
fn write_atomic(target: &Path, content: &[u8]) -> HarvestResult<()> {
    let dir = target
        .parent()
        .ok_or_else(|| HarvestError::StorageError(format!("{} has no parent", target.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| HarvestError::IoError(e.error))?;
    Ok(())
}

/// One JSON file per (source, category) under `{base}/{source}/{category}.json`.
pub struct DiskCheckpointStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskCheckpointStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> HarvestResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn source_dir(&self, source: &SourceId) -> PathBuf {
        self.base_path.join(path_component(source.as_str()))
    }

    fn path_for(&self, source: &SourceId, category: CategoryId) -> PathBuf {
        self.source_dir(source).join(format!("{}.json", category))
    }

    fn read(path: &Path) -> HarvestResult<Checkpoint> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            HarvestError::Checkpoint(format!("corrupt checkpoint {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl CheckpointStore for DiskCheckpointStore {
    async fn load(
        &self,
        source: &SourceId,
        category: CategoryId,
    ) -> HarvestResult<Option<Checkpoint>> {
        let path = self.path_for(source, category);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> HarvestResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&checkpoint.source_id, checkpoint.category_id);
        let stored = if path.exists() {
            Some(Self::read(&path)?)
        } else {
            None
        };
        check_regression(stored.as_ref(), checkpoint)?;

        let json = serde_json::to_string_pretty(checkpoint)?;
        write_atomic(&path, json.as_bytes())?;
        debug!(
            "Checkpoint {}/{}: pass {}, {} pages, {:?}",
            checkpoint.source_id,
            checkpoint.category_id,
            checkpoint.pass,
            checkpoint.pages_collected,
            checkpoint.status
        );
        Ok(())
    }

    async fn list(&self, source: &SourceId) -> HarvestResult<Vec<Checkpoint>> {
        let dir = self.source_dir(source);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(checkpoint) => found.push(checkpoint),
                Err(e) => warn!("Skipping checkpoint: {}", e),
            }
        }
        found.sort_by_key(|c| c.category_id);
        Ok(found)
    }
}

/// Keeps every successful API body under
/// `{base}/{source}/{category}/{timestamp}_p{page}_{uuid}.json`.
#[derive(Clone)]
pub struct RawArchive {
    base_path: PathBuf,
}

impl RawArchive {
    pub fn new<P: AsRef<Path>>(base_path: P) -> HarvestResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn store(
        &self,
        source: &SourceId,
        category: CategoryId,
        page: u32,
        body: &str,
    ) -> HarvestResult<PathBuf> {
        let dir = self
            .base_path
            .join(path_component(source.as_str()))
            .join(category.to_string());
        fs::create_dir_all(&dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_p{}_{}.json", timestamp, page, Uuid::now_v7());
        let path = dir.join(filename);
        fs::write(&path, body)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ItemId;
    use crate::storage::CheckpointStatus;

    #[tokio::test]
    async fn test_disk_round_trip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCheckpointStore::new(dir.path()).unwrap();
        let source = SourceId::new("115");

        let mut cp = Checkpoint::new(source.clone(), 221, 1);
        cp.record_page(2);
        cp.pending_head_id = Some(ItemId::new("999"));
        store.save(&cp).await.unwrap();

        assert!(dir.path().join("115").join("221.json").exists());
        let loaded = store.load(&source, 221).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn test_disk_rejects_regression_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCheckpointStore::new(dir.path()).unwrap();
        let source = SourceId::new("115");

        let mut cp = Checkpoint::new(source.clone(), 5, 1);
        cp.record_page(4);
        store.save(&cp).await.unwrap();
        cp.pages_collected = 1;
        assert!(store.save(&cp).await.is_err());

        let mut other = Checkpoint::new(source.clone(), 6, 1);
        other.complete();
        store.save(&other).await.unwrap();
        fs::write(dir.path().join("115").join("garbage.json"), "{").unwrap();

        let listed = store.list(&source).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].pages_collected, 4);
        assert_eq!(listed[1].status, CheckpointStatus::Completed);
        assert!(store.list(&SourceId::new("none")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let source = SourceId::new("115");
        {
            let store = DiskCheckpointStore::new(dir.path()).unwrap();
            let mut cp = Checkpoint::new(source.clone(), 1, 3);
            cp.record_page(7);
            store.save(&cp).await.unwrap();
        }
        let reopened = DiskCheckpointStore::new(dir.path()).unwrap();
        let last = reopened.last_position(&source).await.unwrap().unwrap();
        assert_eq!((last.pass, last.pages_collected), (3, 7));
    }

    #[test]
    fn test_raw_archive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = RawArchive::new(dir.path()).unwrap();
        let path = archive
            .store(&SourceId::new("115"), 221, 2, r#"{"items":[]}"#)
            .unwrap();

        assert!(path.starts_with(dir.path().join("115").join("221")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.contains("_p2_"));
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"items":[]}"#);
    }

    #[test]
    fn test_path_component_sanitizes() {
        assert_eq!(path_component("../etc"), "___etc");
        assert_eq!(path_component("115"), "115");
    }
}
