use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::http::{Item, ItemId};
use crate::taxonomy::{CategoryId, SourceId};
use crate::HarvestResult;

/// Items of one page, in listing order.
#[derive(Debug, Clone, Copy)]
pub struct ItemBatch<'a> {
    pub source_id: &'a SourceId,
    pub category_id: CategoryId,
    pub category_name: &'a str,
    pub page: u32,
    pub items: &'a [Item],
}

#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn accept(&self, batch: ItemBatch<'_>) -> HarvestResult<()>;

    async fn flush(&self) -> HarvestResult<()> {
        Ok(())
    }
}

/// One emitted listing with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestedItem {
    pub source_id: SourceId,
    pub category_id: CategoryId,
    pub category_name: String,
    pub page: u32,
    pub id: ItemId,
    pub data: Value,
    pub harvested_at: DateTime<Utc>,
}

impl HarvestedItem {
    fn from_batch(batch: &ItemBatch<'_>, item: &Item) -> Self {
        Self {
            source_id: batch.source_id.clone(),
            category_id: batch.category_id,
            category_name: batch.category_name.to_string(),
            page: batch.page,
            id: item.id.clone(),
            data: item.data.clone(),
            harvested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    items: Mutex<Vec<HarvestedItem>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<HarvestedItem> {
        self.items.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.lock().iter().map(|i| i.id.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl ItemSink for MemorySink {
    async fn accept(&self, batch: ItemBatch<'_>) -> HarvestResult<()> {
        let mut items = self.items.lock();
        items.extend(batch.items.iter().map(|item| HarvestedItem::from_batch(&batch, item)));
        Ok(())
    }
}

/// Appends one JSON object per item to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open<P: AsRef<Path>>(path: P) -> HarvestResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ItemSink for JsonLinesSink {
    async fn accept(&self, batch: ItemBatch<'_>) -> HarvestResult<()> {
        let mut buffer = Vec::new();
        for item in batch.items {
            serde_json::to_writer(&mut buffer, &HarvestedItem::from_batch(&batch, item))?;
            buffer.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&buffer).await?;
        Ok(())
    }

    async fn flush(&self) -> HarvestResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}
