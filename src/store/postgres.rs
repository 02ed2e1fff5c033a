//! PostgreSQL document store
//!
//! All kinds share one `fleet_documents` table; bodies are `jsonb` and conditional
//! writes compare the `version` column inside the `UPDATE`.

use super::{DocumentFilter, DocumentStore, StoreError, StoreResult, VersionedDocument};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fleet_documents (
    kind        TEXT        NOT NULL,
    id          TEXT        NOT NULL,
    version     BIGINT      NOT NULL,
    body        JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (kind, id)
)
"#;

const INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS fleet_documents_body_idx ON fleet_documents USING GIN (body)";

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the documents table exists
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(backend)?;

        let store = Self::new(pool);
        store.ensure_schema().await?;

        info!(max_connections, "💾 STORE: Connected PostgreSQL document store");
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        sqlx::query(INDEX_SQL)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_version(&self, kind: &str, id: &str) -> StoreResult<Option<u64>> {
        let row = sqlx::query("SELECT version FROM fleet_documents WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        row.map(|r| r.try_get::<i64, _>("version").map(to_version))
            .transpose()
            .map_err(backend)
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn to_version(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or_default()
}

fn to_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> StoreResult<VersionedDocument> {
    Ok(VersionedDocument {
        id: row.try_get("id").map_err(backend)?,
        version: to_version(row.try_get("version").map_err(backend)?),
        body: row.try_get("body").map_err(backend)?,
    })
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, kind: &str, id: &str) -> StoreResult<Option<VersionedDocument>> {
        let row = sqlx::query(
            "SELECT id, version, body FROM fleet_documents WHERE kind = $1 AND id = $2",
        )
        .bind(kind)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn put(
        &self,
        kind: &str,
        id: &str,
        body: Value,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let written: Option<i64> = match expected_version {
            None => sqlx::query_scalar(
                r#"
                INSERT INTO fleet_documents (kind, id, version, body)
                VALUES ($1, $2, 1, $3)
                ON CONFLICT (kind, id) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(kind)
            .bind(id)
            .bind(&body)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
            Some(expected) => sqlx::query_scalar(
                r#"
                UPDATE fleet_documents
                SET body = $3, version = version + 1, updated_at = NOW()
                WHERE kind = $1 AND id = $2 AND version = $4
                RETURNING version
                "#,
            )
            .bind(kind)
            .bind(id)
            .bind(&body)
            .bind(to_db_version(expected))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
        };

        if let Some(version) = written {
            return Ok(to_version(version));
        }

        match self.current_version(kind, id).await? {
            None if expected_version.is_some() => Err(StoreError::NotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }),
            actual => Err(StoreError::VersionConflict {
                kind: kind.to_string(),
                id: id.to_string(),
                expected: expected_version,
                actual,
            }),
        }
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM fleet_documents WHERE kind = $1 AND id = $2")
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, kind: &str, filter: &DocumentFilter) -> StoreResult<Vec<VersionedDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT id, version, body FROM fleet_documents
            WHERE kind = $1 AND body @> $2
            ORDER BY id
            "#,
        )
        .bind(kind)
        .bind(filter.to_json())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(row_to_document).collect()
    }
}
