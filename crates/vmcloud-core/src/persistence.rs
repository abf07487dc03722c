use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use vmcloud_common::{
    CloudError, Filter, Image, Instance, KeyPair, ResourceKind, Result, Snapshot, Store,
    StoredDocument, Template, Volume,
};

/// A record type that can be persisted through a [`Store`].
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;
    fn record_id(&self) -> &str;
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr, $field:ident) => {
        impl Record for $ty {
            const KIND: ResourceKind = $kind;
            fn record_id(&self) -> &str {
                &self.$field
            }
        }
    };
}

impl_record!(Instance, ResourceKind::Instance, id);
impl_record!(Volume, ResourceKind::Volume, id);
impl_record!(Image, ResourceKind::Image, id);
impl_record!(Snapshot, ResourceKind::Snapshot, id);
impl_record!(Template, ResourceKind::Template, id);
impl_record!(KeyPair, ResourceKind::KeyPair, name);

/// Typed access to one record kind.
pub struct Repository<T> {
    store: Arc<dyn Store>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Repository<T> {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    pub async fn save(&self, record: &T) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.store.put(T::KIND, record.record_id(), body).await
    }

    pub async fn find(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(T::KIND, id).await? {
            Some(doc) if doc.deleted_at.is_none() => Ok(Some(serde_json::from_value(doc.body)?)),
            _ => Ok(None),
        }
    }

    /// Like `find`, but a missing record is `NotFound`.
    pub async fn get(&self, id: &str) -> Result<T> {
        self.find(id)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("{} {id}", T::KIND)))
    }

    pub async fn list(&self, filters: &[Filter]) -> Result<Vec<T>> {
        self.store
            .list(T::KIND, filters, false)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc.body).map_err(CloudError::from))
            .collect()
    }

    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        self.store.soft_delete(T::KIND, id).await
    }
}

/// Process-local store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<(ResourceKind, String), StoredDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, kind: ResourceKind, id: &str, body: serde_json::Value) -> Result<()> {
        self.documents.write().await.insert(
            (kind, id.to_string()),
            StoredDocument {
                id: id.to_string(),
                body,
                deleted_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, id: &str) -> Result<Option<StoredDocument>> {
        Ok(self
            .documents
            .read()
            .await
            .get(&(kind, id.to_string()))
            .cloned())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        filters: &[Filter],
        include_deleted: bool,
    ) -> Result<Vec<StoredDocument>> {
        let documents = self.documents.read().await;
        let mut result: Vec<StoredDocument> = documents
            .iter()
            .filter(|((k, _), doc)| {
                *k == kind
                    && (include_deleted || doc.deleted_at.is_none())
                    && filters.iter().all(|f| f.matches(&doc.body))
            })
            .map(|(_, doc)| doc.clone())
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn soft_delete(&self, kind: ResourceKind, id: &str) -> Result<bool> {
        let mut documents = self.documents.write().await;
        match documents.get_mut(&(kind, id.to_string())) {
            Some(doc) if doc.deleted_at.is_none() => {
                doc.deleted_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcloud_common::{VolumeFormat, VolumeState};

    fn volume(id: &str, state: VolumeState) -> Volume {
        Volume {
            id: id.to_string(),
            node: "local".to_string(),
            pool: "default".to_string(),
            path: format!("/pool/{id}.qcow2").into(),
            size_gb: 10,
            capacity_bytes: 0,
            format: VolumeFormat::Qcow2,
            state,
            attached_to: None,
            device: None,
            source_image_id: None,
            source_snapshot_id: None,
            backing_file: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_find_and_filter() {
        let repo: Repository<Volume> = Repository::new(Arc::new(MemoryStore::new()));
        repo.save(&volume("vol-a", VolumeState::Available)).await.unwrap();
        repo.save(&volume("vol-b", VolumeState::InUse)).await.unwrap();

        assert_eq!(repo.get("vol-a").await.unwrap().id, "vol-a");
        let in_use = repo.list(&[Filter::new("state", "in-use")]).await.unwrap();
        assert_eq!(in_use.len(), 1);
        assert_eq!(in_use[0].id, "vol-b");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_record() {
        let store = Arc::new(MemoryStore::new());
        let repo: Repository<Volume> = Repository::new(store.clone());
        repo.save(&volume("vol-a", VolumeState::Available)).await.unwrap();

        assert!(repo.soft_delete("vol-a").await.unwrap());
        assert!(!repo.soft_delete("vol-a").await.unwrap());
        assert!(repo.find("vol-a").await.unwrap().is_none());
        assert!(matches!(repo.get("vol-a").await, Err(CloudError::NotFound(_))));
        assert!(repo.list(&[]).await.unwrap().is_empty());

        let all = store.list(ResourceKind::Volume, &[], true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted_at.is_some());
    }
}
