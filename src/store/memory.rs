//! In-process document store backed by a concurrent map

use super::{DocumentFilter, DocumentStore, StoreError, StoreResult, VersionedDocument};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<(String, String), VersionedDocument>,
    /// Number of upcoming writes that fail with a backend error
    injected_failures: AtomicU32,
    /// Number of upcoming writes that report a version conflict
    injected_conflicts: AtomicU32,
    writes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a backend error
    pub fn fail_next_writes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` writes report a version conflict, as if another process
    /// had written first
    pub fn conflict_next_writes(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Total successful writes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.injected_failures)
    }

    fn take_injected_conflict(&self) -> bool {
        take_one(&self.injected_conflicts)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, kind: &str, id: &str) -> StoreResult<Option<VersionedDocument>> {
        Ok(self
            .documents
            .get(&(kind.to_string(), id.to_string()))
            .map(|doc| doc.value().clone()))
    }

    async fn put(
        &self,
        kind: &str,
        id: &str,
        body: Value,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        if self.take_injected_failure() {
            return Err(StoreError::Backend(format!(
                "injected write failure for {kind} '{id}'"
            )));
        }

        let conflict = |actual: Option<u64>| StoreError::VersionConflict {
            kind: kind.to_string(),
            id: id.to_string(),
            expected: expected_version,
            actual,
        };

        let new_version = match self.documents.entry((kind.to_string(), id.to_string())) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if expected_version != Some(current) || self.take_injected_conflict() {
                    return Err(conflict(Some(current)));
                }
                let doc = occupied.get_mut();
                doc.version = current + 1;
                doc.body = body;
                doc.version
            }
            Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Err(StoreError::NotFound {
                        kind: kind.to_string(),
                        id: id.to_string(),
                    });
                }
                vacant.insert(VersionedDocument {
                    id: id.to_string(),
                    version: 1,
                    body,
                });
                1
            }
        };

        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(new_version)
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<bool> {
        Ok(self
            .documents
            .remove(&(kind.to_string(), id.to_string()))
            .is_some())
    }

    async fn query(&self, kind: &str, filter: &DocumentFilter) -> StoreResult<Vec<VersionedDocument>> {
        let mut matches: Vec<VersionedDocument> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == kind && filter.matches(&entry.value().body))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_conditional_put_detects_conflicts() {
        let store = MemoryDocumentStore::new();
        let v1 = store.put("worker", "w-1", json!({"n": 1}), None).await.unwrap();
        assert_eq!(v1, 1);

        let v2 = store.put("worker", "w-1", json!({"n": 2}), Some(1)).await.unwrap();
        assert_eq!(v2, 2);

        let stale = store.put("worker", "w-1", json!({"n": 3}), Some(1)).await;
        assert!(matches!(
            stale,
            Err(StoreError::VersionConflict { actual: Some(2), .. })
        ));

        let duplicate = store.put("worker", "w-1", json!({}), None).await;
        assert!(duplicate.unwrap_err().is_conflict());

        let doc = store.get("worker", "w-1").await.unwrap().unwrap();
        assert_eq!(doc.body, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_query_is_scoped_by_kind() {
        let store = MemoryDocumentStore::new();
        store.put("worker", "a", json!({"box_id": "b"}), None).await.unwrap();
        store.put("worker", "c", json!({"box_id": "x"}), None).await.unwrap();
        store.put("box", "b", json!({"box_id": "b"}), None).await.unwrap();

        let found = store
            .query("worker", &DocumentFilter::new().eq("box_id", "b"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "a");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryDocumentStore::new();
        store.fail_next_writes(1);
        assert!(matches!(
            store.put("box", "b", json!({}), None).await,
            Err(StoreError::Backend(_))
        ));
        assert!(store.put("box", "b", json!({}), None).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }
}
