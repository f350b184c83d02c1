//! Database capability contract consumed by the executor.
//!
//! The [`Database`] trait is the uniform operation surface every backend
//! adapter implements: connection lifecycle, single-document CRUD, sub-document
//! path operations and bulk variants. The orchestration core never inspects
//! which backend it talks to; backend differences that matter to scheduling
//! (a fixed bulk call limit) are exposed as capabilities on the trait.
//!
//! Backends are selected by type string through
//! [`ConnectionManager`](registry::ConnectionManager).
//!
//! # Error model
//!
//! Per-document failures are carried inside [`OperationResult`] so a bulk
//! call can report mixed outcomes. A bulk call that fails as a whole (backend
//! unreachable) returns `Err(DbError)` instead.

pub mod memory;
pub mod registry;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DbError;
use crate::generator::Document;

pub use memory::InMemoryDatabase;
pub use registry::ConnectionManager;

/// Bulk call limit for key-value stores with a small batch-write API
/// (25 items per batch-write call on DynamoDB-style services).
pub const KEY_VALUE_BULK_LIMIT: usize = 25;

/// Where and how to connect to a backend.
///
/// The password is never serialized, so persisted task descriptors do not
/// carry credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    /// Backend-specific connection string.
    pub conn_str: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl ConnectionInfo {
    /// Creates connection info without credentials.
    pub fn new(conn_str: impl Into<String>) -> Self {
        Self {
            conn_str: conn_str.into(),
            ..Self::default()
        }
    }

    /// Adds credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("conn_str", &self.conn_str)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Free-form per-call configuration.
///
/// The named fields cover the keys most adapters recognize (namespace path,
/// durability, timeouts, expiry). Anything else lands in `other`; adapters
/// ignore keys they do not understand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Extras {
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub database: String,
    pub keyspace: String,
    pub table: String,
    pub durability: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Document expiry applied by touch operations.
    pub expiry_secs: Option<u64>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Extras {
    /// Slash-joined namespace path built from the non-empty namespace fields.
    pub fn namespace_path(&self) -> String {
        [
            &self.bucket,
            &self.scope,
            &self.collection,
            &self.database,
            &self.keyspace,
            &self.table,
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .map(|part| part.as_str())
        .collect::<Vec<_>>()
        .join("/")
    }
}

/// A document key paired with its offset and payload.
///
/// Read, delete and touch calls ignore `document`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub offset: u64,
    pub document: Document,
}

impl KeyValue {
    /// A key with no payload, for read/delete/touch.
    pub fn key_only(key: impl Into<String>, offset: u64) -> Self {
        Self {
            key: key.into(),
            offset,
            document: Value::Null,
        }
    }
}

/// A sub-document path and the value to write there.
#[derive(Debug, Clone, PartialEq)]
pub struct SubDocValue {
    /// Dotted path inside the document (`address.city`).
    pub path: String,
    pub value: Value,
}

/// Outcome of one document operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub key: String,
    pub offset: u64,
    /// Document (or sub-document map) returned by reads.
    pub value: Option<Document>,
    pub error: Option<DbError>,
    /// Backend-specific metadata (CAS, revision, consumed capacity).
    pub extra: Map<String, Value>,
}

impl OperationResult {
    /// A successful result with an optional returned value.
    pub fn success(key: impl Into<String>, offset: u64, value: Option<Document>) -> Self {
        Self {
            key: key.into(),
            offset,
            value,
            error: None,
            extra: Map::new(),
        }
    }

    /// A failed result.
    pub fn failure(key: impl Into<String>, offset: u64, error: DbError) -> Self {
        Self {
            key: key.into(),
            offset,
            value: None,
            error: Some(error),
            extra: Map::new(),
        }
    }

    /// Returns `true` if the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a bulk call, keyed by document key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkOperationResult {
    results: HashMap<String, OperationResult>,
}

impl BulkOperationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome for one key, replacing any earlier entry.
    pub fn insert(&mut self, result: OperationResult) {
        self.results.insert(result.key.clone(), result);
    }

    /// Outcome for a key, if the backend reported one.
    pub fn get(&self, key: &str) -> Option<&OperationResult> {
        self.results.get(key)
    }

    /// Number of keys with a reported outcome.
    pub fn get_size(&self) -> usize {
        self.results.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.values()
    }
}

/// Uniform operation contract implemented once per backend variant.
///
/// Single-document methods are required. Sub-document methods default to
/// [`DbError::Unsupported`], and bulk methods default to issuing the
/// single-document call per item, so a minimal adapter only implements CRUD.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance serves every worker
/// of every task in a request.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens (or validates) a connection. Called once at task configuration.
    async fn connect(&self, conn: &ConnectionInfo, extras: &Extras) -> Result<(), DbError>;

    /// Primes the namespace (create collection/table, open pools).
    async fn warmup(&self, _conn: &ConnectionInfo, _extras: &Extras) -> Result<(), DbError> {
        Ok(())
    }

    /// Releases the connection.
    async fn close(&self, conn: &ConnectionInfo) -> Result<(), DbError>;

    /// Fixed bulk call size imposed by the backend API, if any.
    ///
    /// When set, it replaces the configured bulk batch size.
    fn fixed_bulk_batch_size(&self) -> Option<usize> {
        None
    }

    async fn create(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult;

    /// Writes the document whether or not it exists.
    async fn update(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult;

    async fn read(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult;

    async fn delete(&self, conn: &str, key: &str, offset: u64, extras: &Extras)
        -> OperationResult;

    /// Refreshes the document expiry from `extras.expiry_secs`.
    async fn touch(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult;

    async fn insert_sub_doc(
        &self,
        _conn: &str,
        key: &str,
        _values: &[SubDocValue],
        offset: u64,
        _extras: &Extras,
    ) -> OperationResult {
        unsupported(key, offset, "sub-doc-insert")
    }

    async fn upsert_sub_doc(
        &self,
        _conn: &str,
        key: &str,
        _values: &[SubDocValue],
        offset: u64,
        _extras: &Extras,
    ) -> OperationResult {
        unsupported(key, offset, "sub-doc-upsert")
    }

    async fn replace_sub_doc(
        &self,
        _conn: &str,
        key: &str,
        _values: &[SubDocValue],
        offset: u64,
        _extras: &Extras,
    ) -> OperationResult {
        unsupported(key, offset, "sub-doc-replace")
    }

    /// Reads the given paths; the value is an object of path to value.
    async fn read_sub_doc(
        &self,
        _conn: &str,
        key: &str,
        _paths: &[String],
        offset: u64,
        _extras: &Extras,
    ) -> OperationResult {
        unsupported(key, offset, "sub-doc-read")
    }

    async fn delete_sub_doc(
        &self,
        _conn: &str,
        key: &str,
        _paths: &[String],
        offset: u64,
        _extras: &Extras,
    ) -> OperationResult {
        unsupported(key, offset, "sub-doc-delete")
    }

    async fn create_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(self.create(conn, item, extras).await);
        }
        Ok(out)
    }

    async fn update_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(self.update(conn, item, extras).await);
        }
        Ok(out)
    }

    async fn read_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(self.read(conn, &item.key, item.offset, extras).await);
        }
        Ok(out)
    }

    async fn delete_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(self.delete(conn, &item.key, item.offset, extras).await);
        }
        Ok(out)
    }

    async fn touch_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(self.touch(conn, &item.key, item.offset, extras).await);
        }
        Ok(out)
    }
}

fn unsupported(key: &str, offset: u64, operation: &str) -> OperationResult {
    OperationResult::failure(
        key,
        offset,
        DbError::Unsupported {
            operation: operation.to_string(),
        },
    )
}
