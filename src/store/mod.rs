//! # Entity Store Adapter
//!
//! Versioned document storage for box, worker and stream records. A backend only has
//! to provide conditional writes keyed on a monotonically increasing version; the
//! typed [`EntityStore`] layers serialization and timeouts on top.
//!
//! - [`memory::MemoryDocumentStore`] - in-process backend used by tests and simulation
//! - [`postgres::PgDocumentStore`] - PostgreSQL `jsonb` backend

pub mod entity;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use entity::{Entity, EntityStore};
pub use memory::MemoryDocumentStore;
#[cfg(feature = "postgres")]
pub use postgres::PgDocumentStore;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The record changed (or appeared) since the caller's copy was read
    #[error("Version conflict on {kind} '{id}': expected {expected:?}, found {actual:?}")]
    VersionConflict {
        kind: String,
        id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("{kind} '{id}' not found in store")]
    NotFound { kind: String, id: String },

    #[error("Store operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored document and the version it was stored at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedDocument {
    pub id: String,
    pub version: u64,
    pub body: Value,
}

/// Top-level field equality filter for [`DocumentStore::query`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    conditions: Vec<(String, Value)>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }

    /// The filter as a JSON object, suitable for containment queries
    pub fn to_json(&self) -> Value {
        Value::Object(self.conditions.iter().cloned().collect())
    }
}

/// Versioned key-value document store with conditional writes
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, kind: &str, id: &str) -> StoreResult<Option<VersionedDocument>>;

    /// Write a document
    ///
    /// `expected_version = None` creates the document and conflicts if it exists;
    /// `Some(v)` replaces it only if the stored version is still `v`. Returns the new
    /// version.
    async fn put(
        &self,
        kind: &str,
        id: &str,
        body: Value,
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;

    /// Remove a document, returning whether it existed
    async fn delete(&self, kind: &str, id: &str) -> StoreResult<bool>;

    async fn query(&self, kind: &str, filter: &DocumentFilter) -> StoreResult<Vec<VersionedDocument>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches_top_level_fields() {
        let filter = DocumentFilter::new().eq("box_id", "b-1").eq("status", "running");
        assert!(filter.matches(&json!({"box_id": "b-1", "status": "running", "x": 1})));
        assert!(!filter.matches(&json!({"box_id": "b-1", "status": "idle"})));
        assert!(!filter.matches(&json!({"status": "running"})));
        assert!(DocumentFilter::new().matches(&json!({})));
        assert_eq!(filter.to_json(), json!({"box_id": "b-1", "status": "running"}));
    }
}
