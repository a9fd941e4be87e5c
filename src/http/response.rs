use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::{HarvestError, HarvestResult};

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: Url,
    pub status: u16,
    /// Lower-cased header names; repeated headers keep the last value.
    pub headers: HashMap<String, String>,
    pub set_cookies: Vec<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self(n.to_string())),
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One listing; the payload is kept as delivered by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub data: Value,
}

/// Extracts `field` (an array of objects carrying an `id`) from a JSON body.
pub fn parse_items(body: &str, field: &str) -> HarvestResult<Vec<Item>> {
    let root: Value = serde_json::from_str(body)
        .map_err(|e| HarvestError::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let entries = match root.get(field) {
        Some(Value::Array(entries)) => entries,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => {
            return Err(HarvestError::MalformedResponse(format!(
                "`{}` is not an array",
                field
            )))
        }
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.get("id").and_then(ItemId::from_json) {
            Some(id) => items.push(Item {
                id,
                data: entry.clone(),
            }),
            None => log::warn!("Skipping listing without an id"),
        }
    }
    Ok(items)
}
