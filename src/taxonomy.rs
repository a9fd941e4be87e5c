use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::{HarvestError, HarvestResult};

pub type CategoryId = u64;

/// The brand/collection whose listings are harvested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub category_id: CategoryId,
    pub category_name: String,
    #[serde(default)]
    pub parent_id: Option<CategoryId>,
}

impl TaxonomyEntry {
    pub fn new(category_id: CategoryId, category_name: impl Into<String>) -> Self {
        Self {
            category_id,
            category_name: category_name.into(),
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: CategoryId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Immutable, ordered category table; iteration order is harvesting order.
#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    entries: Vec<TaxonomyEntry>,
    index: HashMap<CategoryId, usize>,
}

impl Taxonomy {
    pub fn new(entries: Vec<TaxonomyEntry>) -> HarvestResult<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if index.insert(entry.category_id, position).is_some() {
                return Err(HarvestError::Taxonomy(format!(
                    "duplicate category id {}",
                    entry.category_id
                )));
            }
        }
        Ok(Self { entries, index })
    }

    pub fn from_json_str(json: &str) -> HarvestResult<Self> {
        let entries: Vec<TaxonomyEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> HarvestResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarvestError::Taxonomy(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: CategoryId) -> Option<&TaxonomyEntry> {
        self.index.get(&id).map(|&i| &self.entries[i])
    }

    pub fn position(&self, id: CategoryId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn name_of(&self, id: CategoryId) -> String {
        self.get(id)
            .map(|e| e.category_name.clone())
            .unwrap_or_else(|| format!("unknown-category-{}", id))
    }

    pub fn children(&self, parent: CategoryId) -> impl Iterator<Item = &TaxonomyEntry> {
        self.entries
            .iter()
            .filter(move |e| e.parent_id == Some(parent))
    }

    /// Restricts the table to `ids`, keeping taxonomy order.
    pub fn select(&self, ids: &[CategoryId]) -> HarvestResult<Self> {
        if let Some(missing) = ids.iter().find(|id| !self.index.contains_key(id)) {
            return Err(HarvestError::Taxonomy(format!(
                "category {} is not in the taxonomy",
                missing
            )));
        }
        let entries = self
            .entries
            .iter()
            .filter(|e| ids.contains(&e.category_id))
            .cloned()
            .collect();
        Self::new(entries)
    }
}
