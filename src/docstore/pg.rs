// Postgres implementation (feature = "postgres-store")
//
// Every document is one row of `documents`; fields live in a JSONB column.
// Commits run in one transaction and lock the rows they update, so version
// preconditions are checked against the committed state.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use super::*;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS documents (
        path          TEXT PRIMARY KEY,
        collection    TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        data          JSONB NOT NULL,
        version       BIGINT NOT NULL,
        create_time   TIMESTAMPTZ NOT NULL,
        update_time   TIMESTAMPTZ NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection)",
    "CREATE INDEX IF NOT EXISTS documents_collection_id_idx ON documents (collection_id)",
    "CREATE INDEX IF NOT EXISTS documents_data_idx ON documents USING GIN (data jsonb_path_ops)",
];

const COLUMNS: &str = "path, data, version, create_time, update_time";

#[derive(Clone)]
pub struct PgDocStore {
    pool: PgPool,
}

impl PgDocStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        path: &DocPath,
    ) -> StoreResult<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE path = $1 FOR UPDATE"))
            .bind(path.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_doc).transpose()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn row_to_doc(row: &PgRow) -> StoreResult<Document> {
    let path: String = row.try_get("path").map_err(backend)?;
    let data: Value = row.try_get("data").map_err(backend)?;
    let version: i64 = row.try_get("version").map_err(backend)?;
    let fields = match data {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::InvalidArgument(format!(
                "document {path} holds a non-object body: {other}"
            )))
        }
    };
    Ok(Document {
        path: DocPath(path),
        fields,
        version: u64::try_from(version).unwrap_or_default(),
        create_time: row.try_get("create_time").map_err(backend)?,
        update_time: row.try_get("update_time").map_err(backend)?,
    })
}

#[async_trait]
impl DocumentStore for PgDocStore {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM documents WHERE path = $1"))
            .bind(path.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(row_to_doc).transpose()
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let filter = Value::Object(query.filters.iter().cloned().collect::<Fields>());
        let (scope_column, scope_value) = match &query.scope {
            QueryScope::Collection(c) => ("collection", c.as_str().to_string()),
            QueryScope::CollectionGroup(id) => ("collection_id", id.clone()),
        };
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM documents WHERE {scope_column} = $1 AND data @> $2"
        ))
        .bind(scope_value)
        .bind(filter)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(row_to_doc).collect()
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<Vec<Document>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let now = Utc::now();
        let mut staged: HashMap<DocPath, Document> = HashMap::new();
        let mut existing: HashSet<DocPath> = HashSet::new();
        let mut written = Vec::with_capacity(batch.writes().len());

        for write in batch.writes() {
            let path = write.path();
            let current = match staged.get(path) {
                Some(doc) => Some(doc.clone()),
                None => {
                    let found = Self::fetch_for_update(&mut tx, path).await?;
                    if found.is_some() {
                        existing.insert(path.clone());
                    }
                    found
                }
            };
            let next = apply_write(current.as_ref(), write, now)?;
            written.push(next.clone());
            staged.insert(path.clone(), next);
        }

        for (path, doc) in &staged {
            let data = Value::Object(doc.fields.clone());
            let version = i64::try_from(doc.version)
                .map_err(|_| StoreError::InvalidArgument(format!("version overflow on {path}")))?;
            if existing.contains(path) {
                sqlx::query(
                    "UPDATE documents SET data = $2, version = $3, update_time = $4 WHERE path = $1",
                )
                .bind(path.as_str())
                .bind(data)
                .bind(version)
                .bind(doc.update_time)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            } else {
                let parent = path.parent();
                sqlx::query(
                    "INSERT INTO documents (path, collection, collection_id, data, version, create_time, update_time) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(path.as_str())
                .bind(parent.as_str())
                .bind(parent.collection_id())
                .bind(data)
                .bind(version)
                .bind(doc.create_time)
                .bind(doc.update_time)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::AlreadyExists(path.clone())
                    } else {
                        backend(e)
                    }
                })?;
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(written)
    }
}
