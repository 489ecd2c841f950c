//! Document store contract, shaped after a hosted document database:
//! collections of JSON documents, nested sub-collections, field transforms
//! and atomic write batches guarded by optimistic preconditions.
//!
//! Backends only have to provide storage and atomicity; the transform and
//! matching rules live here so every backend agrees on them.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

pub type Fields = Map<String, Value>;

const DOC_ID_LEN: usize = 20;
const MAX_DOC_ID_LEN: usize = 128;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(DocPath),
    #[error("document {0} already exists")]
    AlreadyExists(DocPath),
    #[error("precondition failed for {0}")]
    Aborted(DocPath),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: DocPath,
        #[source]
        source: serde_json::Error,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Path of a collection: `comments` or `comments/{id}/replies`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn root(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment; collection-group queries match on it.
    pub fn collection_id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(self.0.as_str())
    }

    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{}", self.0, id))
    }

    /// Path for a new document with a store-assigned id.
    pub fn new_doc(&self) -> DocPath {
        self.doc(&new_doc_id())
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of a single document: `comments/{id}` or `comments/{id}/replies/{rid}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocPath(String);

impl DocPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(self.0.as_str())
    }

    pub fn parent(&self) -> CollectionPath {
        let parent = self.0.rsplit_once('/').map(|(c, _)| c).unwrap_or("");
        CollectionPath(parent.to_string())
    }

    /// Nested collection under this document.
    pub fn collection(&self, id: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, id))
    }
}

impl From<DocPath> for String {
    fn from(p: DocPath) -> Self {
        p.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `id` can name a document. Ids come from URLs, so anything that
/// could escape its collection is refused.
pub fn is_valid_doc_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_DOC_ID_LEN && !id.contains('/') && id != "." && id != ".."
}

pub fn new_doc_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DOC_ID_LEN)
        .map(char::from)
        .collect()
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocPath,
    pub fields: Fields,
    /// 1 on create, bumped by every update.
    pub version: u64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|source| {
            StoreError::Decode {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// Integer field, 0 when missing.
    pub fn int_field(&self, field: &str) -> i64 {
        self.fields.get(field).and_then(Value::as_i64).unwrap_or(0)
    }

    /// String members of an array field, empty when missing.
    pub fn string_set(&self, field: &str) -> Vec<&str> {
        self.fields
            .get(field)
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldTransform {
    Set(Value),
    /// Missing fields count as 0.
    Increment(i64),
    /// Appends each value not already present.
    ArrayUnion(Vec<Value>),
    /// Removes every element equal to one of the values.
    ArrayRemove(Vec<Value>),
    /// Store clock at commit time.
    ServerTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldOp {
    pub field: String,
    pub transform: FieldTransform,
}

impl FieldOp {
    pub fn set(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), transform: FieldTransform::Set(value.into()) }
    }

    pub fn increment(field: &str, by: i64) -> Self {
        Self { field: field.to_string(), transform: FieldTransform::Increment(by) }
    }

    pub fn array_union(field: &str, values: Vec<Value>) -> Self {
        Self { field: field.to_string(), transform: FieldTransform::ArrayUnion(values) }
    }

    pub fn array_remove(field: &str, values: Vec<Value>) -> Self {
        Self { field: field.to_string(), transform: FieldTransform::ArrayRemove(values) }
    }

    pub fn server_timestamp(field: &str) -> Self {
        Self { field: field.to_string(), transform: FieldTransform::ServerTimestamp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Exists,
    /// Document must still be at this version.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Create { path: DocPath, ops: Vec<FieldOp> },
    Update { path: DocPath, precondition: Precondition, ops: Vec<FieldOp> },
}

impl Write {
    pub fn path(&self) -> &DocPath {
        match self {
            Write::Create { path, .. } | Write::Update { path, .. } => path,
        }
    }
}

/// Writes committed all together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, path: DocPath, ops: Vec<FieldOp>) -> Self {
        self.writes.push(Write::Create { path, ops });
        self
    }

    pub fn update(mut self, path: DocPath, precondition: Precondition, ops: Vec<FieldOp>) -> Self {
        self.writes.push(Write::Update { path, precondition, ops });
        self
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryScope {
    Collection(CollectionPath),
    /// Every collection whose last segment is this id, at any depth.
    CollectionGroup(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub scope: QueryScope,
    pub filters: Vec<(String, Value)>,
}

impl Query {
    pub fn collection(path: CollectionPath) -> Self {
        Self { scope: QueryScope::Collection(path), filters: Vec::new() }
    }

    pub fn collection_group(id: &str) -> Self {
        Self { scope: QueryScope::CollectionGroup(id.to_string()), filters: Vec::new() }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        let parent = doc.path.parent();
        let in_scope = match &self.scope {
            QueryScope::Collection(c) => parent == *c,
            QueryScope::CollectionGroup(id) => parent.collection_id() == id,
        };
        in_scope && self.filters.iter().all(|(f, v)| doc.fields.get(f) == Some(v))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>>;
    /// Unordered.
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;
    /// Applies every write or none. Returns the post-write state of each
    /// written document, in batch order.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<Vec<Document>>;
}

/// Applies one write to the current state of its document.
pub fn apply_write(current: Option<&Document>, write: &Write, now: DateTime<Utc>) -> StoreResult<Document> {
    match write {
        Write::Create { path, ops } => {
            if current.is_some() {
                return Err(StoreError::AlreadyExists(path.clone()));
            }
            let mut fields = Fields::new();
            apply_ops(&mut fields, ops, now)?;
            Ok(Document { path: path.clone(), fields, version: 1, create_time: now, update_time: now })
        }
        Write::Update { path, precondition, ops } => {
            let doc = current.ok_or_else(|| StoreError::NotFound(path.clone()))?;
            if let Precondition::Version(expected) = precondition {
                if doc.version != *expected {
                    return Err(StoreError::Aborted(path.clone()));
                }
            }
            let mut next = doc.clone();
            apply_ops(&mut next.fields, ops, now)?;
            next.version += 1;
            next.update_time = now;
            Ok(next)
        }
    }
}

pub fn apply_ops(fields: &mut Fields, ops: &[FieldOp], now: DateTime<Utc>) -> StoreResult<()> {
    for op in ops {
        match &op.transform {
            FieldTransform::Set(v) => {
                fields.insert(op.field.clone(), v.clone());
            }
            FieldTransform::Increment(by) => {
                let current = match fields.get(&op.field) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        StoreError::InvalidArgument(format!("field `{}` is not an integer", op.field))
                    })?,
                };
                let next = current.checked_add(*by).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("field `{}` overflows", op.field))
                })?;
                fields.insert(op.field.clone(), Value::from(next));
            }
            FieldTransform::ArrayUnion(values) => {
                let arr = array_field(fields, &op.field)?;
                for v in values {
                    if !arr.contains(v) {
                        arr.push(v.clone());
                    }
                }
            }
            FieldTransform::ArrayRemove(values) => {
                let arr = array_field(fields, &op.field)?;
                arr.retain(|v| !values.contains(v));
            }
            FieldTransform::ServerTimestamp => {
                fields.insert(op.field.clone(), Value::String(format_timestamp(now)));
            }
        }
    }
    Ok(())
}

fn array_field<'a>(fields: &'a mut Fields, field: &str) -> StoreResult<&'a mut Vec<Value>> {
    let slot = fields.entry(field.to_string()).or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(arr) => Ok(arr),
        _ => Err(StoreError::InvalidArgument(format!("field `{field}` is not an array"))),
    }
}
