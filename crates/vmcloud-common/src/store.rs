//! Persistence collaborator: JSON documents keyed by kind and identity, with soft delete.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Volume,
    Image,
    Snapshot,
    KeyPair,
    Template,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
            ResourceKind::Image => "image",
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::KeyPair => "key_pair",
            ResourceKind::Template => "template",
        };
        f.write_str(name)
    }
}

/// Equality predicate on a top-level document field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, document: &serde_json::Value) -> bool {
        document.get(&self.field) == Some(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub body: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn put(&self, kind: ResourceKind, id: &str, body: serde_json::Value) -> Result<()>;
    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<StoredDocument>>;
    async fn list(
        &self,
        kind: ResourceKind,
        filters: &[Filter],
        include_deleted: bool,
    ) -> Result<Vec<StoredDocument>>;
    /// Mark a document deleted. Returns false when no live document exists.
    async fn soft_delete(&self, kind: ResourceKind, id: &str) -> Result<bool>;
}
