//! Typed, versioned access to records over a [`DocumentStore`]

use super::{DocumentFilter, DocumentStore, StoreError, StoreResult, VersionedDocument};
use crate::constants::kinds;
use crate::models::{FleetBox, StreamRecord, Worker};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A persisted record type
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Hook run on the final copy immediately before it is written
    fn touch(&mut self) {}
}

impl Entity for FleetBox {
    const KIND: &'static str = kinds::BOX;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Entity for Worker {
    const KIND: &'static str = kinds::WORKER;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self) {
        self.update_count += 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for StreamRecord {
    const KIND: &'static str = kinds::STREAM;

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Typed adapter over a document backend
#[derive(Clone)]
pub struct EntityStore {
    backend: Arc<dyn DocumentStore>,
    write_timeout: Duration,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}

impl EntityStore {
    pub fn new(backend: Arc<dyn DocumentStore>, write_timeout: Duration) -> Self {
        Self {
            backend,
            write_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentStore> {
        &self.backend
    }

    pub async fn get<E: Entity>(&self, id: &str) -> StoreResult<Option<E>> {
        let doc = self
            .with_timeout("get", self.backend.get(E::KIND, id))
            .await?;
        doc.map(decode::<E>).transpose()
    }

    /// Create a record that must not exist yet
    pub async fn insert<E: Entity>(&self, entity: &E) -> StoreResult<E> {
        self.write(entity, None).await
    }

    /// Replace a record if it is still at `entity.version()`
    pub async fn put<E: Entity>(&self, entity: &E) -> StoreResult<E> {
        self.write(entity, Some(entity.version())).await
    }

    pub async fn delete<E: Entity>(&self, id: &str) -> StoreResult<bool> {
        self.with_timeout("delete", self.backend.delete(E::KIND, id))
            .await
    }

    pub async fn query<E: Entity>(&self, filter: &DocumentFilter) -> StoreResult<Vec<E>> {
        let docs = self
            .with_timeout("query", self.backend.query(E::KIND, filter))
            .await?;
        docs.into_iter().map(decode::<E>).collect()
    }

    pub async fn all<E: Entity>(&self) -> StoreResult<Vec<E>> {
        self.query(&DocumentFilter::new()).await
    }

    async fn write<E: Entity>(&self, entity: &E, expected: Option<u64>) -> StoreResult<E> {
        let body =
            serde_json::to_value(entity).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let version = self
            .with_timeout("put", self.backend.put(E::KIND, entity.id(), body, expected))
            .await?;

        let mut written = entity.clone();
        written.set_version(version);
        Ok(written)
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation: operation.to_string(),
                timeout_ms: self.write_timeout.as_millis() as u64,
            }),
        }
    }
}

fn decode<E: Entity>(doc: VersionedDocument) -> StoreResult<E> {
    let mut entity: E =
        serde_json::from_value(doc.body).map_err(|e| StoreError::Serialization(e.to_string()))?;
    entity.set_version(doc.version);
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    fn store() -> EntityStore {
        EntityStore::new(Arc::new(MemoryDocumentStore::new()), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_insert_then_get_carries_store_version() {
        let store = store();
        let fleet_box = FleetBox::new("box-a", "profile-a", 3);
        let inserted = store.insert(&fleet_box).await.unwrap();
        assert_eq!(inserted.version, 1);

        let loaded: FleetBox = store.get(&fleet_box.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.name, "box-a");
    }

    #[tokio::test]
    async fn test_stale_put_is_a_conflict() {
        let store = store();
        let worker = store.insert(&Worker::new("box-1", false)).await.unwrap();

        let mut first = worker.clone();
        first.target = Some("stream-a".into());
        store.put(&first).await.unwrap();

        let mut stale = worker.clone();
        stale.target = Some("stream-b".into());
        let err = store.put(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_query_filters_by_owner() {
        let store = store();
        store.insert(&Worker::new("box-1", true)).await.unwrap();
        store.insert(&Worker::new("box-1", false)).await.unwrap();
        store.insert(&Worker::new("box-2", false)).await.unwrap();

        let workers: Vec<Worker> = store
            .query(&DocumentFilter::new().eq("box_id", "box-1"))
            .await
            .unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.box_id == "box-1"));
    }
}
