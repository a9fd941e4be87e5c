use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::http::ItemId;
use crate::taxonomy::{CategoryId, SourceId};
use crate::{HarvestError, HarvestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointStatus::InProgress)
    }
}

/// Progress of one (source, category) within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: SourceId,
    pub category_id: CategoryId,
    pub pass: u32,
    pub pages_collected: u32,
    /// Newest item seen by the last completed pass; the delta stop marker.
    pub last_seen_item_id: Option<ItemId>,
    /// Top item of this pass's page 1, promoted on completion.
    pub pending_head_id: Option<ItemId>,
    pub status: CheckpointStatus,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_id: SourceId, category_id: CategoryId, pass: u32) -> Self {
        Self {
            source_id,
            category_id,
            pass,
            pages_collected: 0,
            last_seen_item_id: None,
            pending_head_id: None,
            status: CheckpointStatus::InProgress,
            updated_at: Utc::now(),
        }
    }

    /// Start of `pass` carrying the delta marker of a previous record.
    pub fn next_pass(previous: &Checkpoint, pass: u32) -> Self {
        Self {
            last_seen_item_id: previous.last_seen_item_id.clone(),
            ..Self::new(previous.source_id.clone(), previous.category_id, pass)
        }
    }

    pub fn record_page(&mut self, page: u32) {
        self.pages_collected = page;
        self.status = CheckpointStatus::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        if let Some(head) = self.pending_head_id.take() {
            self.last_seen_item_id = Some(head);
        }
        self.status = CheckpointStatus::Completed;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self) {
        self.status = CheckpointStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Rejects a write that would move `pages_collected` backwards within a pass.
pub(crate) fn check_regression(stored: Option<&Checkpoint>, next: &Checkpoint) -> HarvestResult<()> {
    match stored {
        Some(stored) if stored.pass == next.pass && next.pages_collected < stored.pages_collected => {
            Err(HarvestError::CheckpointRegression {
                category_id: next.category_id,
                stored: stored.pages_collected,
                attempted: next.pages_collected,
            })
        }
        Some(stored) if next.pass < stored.pass => Err(HarvestError::Checkpoint(format!(
            "category {} is at pass {}, refusing pass {}",
            next.category_id, stored.pass, next.pass
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        source: &SourceId,
        category: CategoryId,
    ) -> HarvestResult<Option<Checkpoint>>;

    /// Atomic overwrite of the record for (source, category).
    async fn save(&self, checkpoint: &Checkpoint) -> HarvestResult<()>;

    async fn list(&self, source: &SourceId) -> HarvestResult<Vec<Checkpoint>>;

    /// The most recently updated record of `source`.
    async fn last_position(&self, source: &SourceId) -> HarvestResult<Option<Checkpoint>> {
        Ok(self
            .list(source)
            .await?
            .into_iter()
            .max_by_key(|c| c.updated_at))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<HashMap<(SourceId, CategoryId), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        source: &SourceId,
        category: CategoryId,
    ) -> HarvestResult<Option<Checkpoint>> {
        Ok(self.records.lock().get(&(source.clone(), category)).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> HarvestResult<()> {
        let mut records = self.records.lock();
        let key = (checkpoint.source_id.clone(), checkpoint.category_id);
        check_regression(records.get(&key), checkpoint)?;
        records.insert(key, checkpoint.clone());
        Ok(())
    }

    async fn list(&self, source: &SourceId) -> HarvestResult<Vec<Checkpoint>> {
        let mut found: Vec<Checkpoint> = self
            .records
            .lock()
            .values()
            .filter(|c| &c.source_id == source)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.category_id);
        Ok(found)
    }
}
