//! In-memory reference backend.
//!
//! [`InMemoryDatabase`] implements the full [`Database`] contract over a
//! `DashMap`. Documents are scoped by connection string and the extras'
//! namespace path, so two tasks targeting different collections never see
//! each other's keys.
//!
//! The backend has no durability and is meant for tests and dry runs. A fault
//! injector ([`inject_fault`](InMemoryDatabase::inject_fault),
//! [`inject_bulk_fault`](InMemoryDatabase::inject_bulk_fault)) produces
//! classified failures on demand.
//!
//! # Examples
//!
//! ```
//! use docloader::db::InMemoryDatabase;
//! use docloader::error::DbError;
//!
//! let db = InMemoryDatabase::new();
//! db.inject_fault("user-00000000000000000005", DbError::Timeout, 1);
//! assert!(db.is_empty());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{
    BulkOperationResult, ConnectionInfo, Database, Extras, KeyValue, OperationResult, SubDocValue,
};
use crate::error::DbError;
use crate::generator::{lookup_path, remove_path, set_path, Document};

#[derive(Debug, Clone)]
struct StoredDocument {
    document: Document,
    /// Monotonic per-key version, reported as `cas` in result extras.
    version: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    error: DbError,
    remaining: u32,
}

/// Thread-safe in-memory [`Database`] backed by [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    data: DashMap<String, StoredDocument>,
    connections: DashSet<String>,
    faults: DashMap<String, Fault>,
    bulk_fault: Mutex<Option<Fault>>,
    fixed_bulk_batch_size: Option<usize>,
}

impl InMemoryDatabase {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulates a backend whose bulk API accepts at most `size` items per call.
    pub fn with_fixed_bulk_batch_size(mut self, size: Option<usize>) -> Self {
        self.fixed_bulk_batch_size = size;
        self
    }

    /// Number of stored documents across all namespaces, expired ones included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Makes the next `times` operations on `key` fail with `error`.
    ///
    /// The fault applies to the document key in every namespace and to bulk
    /// items as well as single-document calls.
    pub fn inject_fault(&self, key: impl Into<String>, error: DbError, times: u32) {
        if times == 0 {
            return;
        }
        self.faults.insert(
            key.into(),
            Fault {
                error,
                remaining: times,
            },
        );
    }

    /// Makes the next `times` bulk calls fail as a whole with `error`.
    pub fn inject_bulk_fault(&self, error: DbError, times: u32) {
        *self.bulk_fault.lock() = (times > 0).then_some(Fault {
            error,
            remaining: times,
        });
    }

    /// Returns the live document stored under `key`, if any.
    pub fn get_document(&self, conn: &str, extras: &Extras, key: &str) -> Option<Document> {
        let slot = slot_key(conn, extras, key);
        let now = Utc::now();
        self.data
            .get(&slot)
            .filter(|stored| !stored.is_expired(now))
            .map(|stored| stored.document.clone())
    }

    fn take_fault(&self, key: &str) -> Option<DbError> {
        let mut entry = self.faults.get_mut(key)?;
        let error = entry.error.clone();
        entry.remaining -= 1;
        let exhausted = entry.remaining == 0;
        drop(entry);
        if exhausted {
            self.faults.remove(key);
        }
        Some(error)
    }

    fn take_bulk_fault(&self) -> Result<(), DbError> {
        let mut slot = self.bulk_fault.lock();
        let Some(fault) = slot.as_mut() else {
            return Ok(());
        };
        let error = fault.error.clone();
        fault.remaining -= 1;
        if fault.remaining == 0 {
            *slot = None;
        }
        Err(error)
    }

    fn ensure_connected(&self, conn: &str) -> Result<(), DbError> {
        if self.connections.contains(conn) {
            Ok(())
        } else {
            Err(DbError::ConnectionFailed {
                message: format!("no open connection to '{conn}'"),
            })
        }
    }

    /// Runs the common preamble (connection check, injected fault) and then
    /// `op` against the namespaced slot.
    fn with_slot<F>(&self, conn: &str, extras: &Extras, key: &str, offset: u64, op: F) -> OperationResult
    where
        F: FnOnce(&Self, String) -> Result<(Option<Document>, u64), DbError>,
    {
        if let Err(error) = self.ensure_connected(conn) {
            return OperationResult::failure(key, offset, error);
        }
        if let Some(error) = self.take_fault(key) {
            return OperationResult::failure(key, offset, error);
        }
        match op(self, slot_key(conn, extras, key)) {
            Ok((value, version)) => {
                let mut result = OperationResult::success(key, offset, value);
                result.extra.insert("cas".to_string(), Value::from(version));
                result
            }
            Err(error) => OperationResult::failure(key, offset, error),
        }
    }

    /// Live document at `slot`, purging it if expired.
    fn live(&self, slot: &str) -> Option<StoredDocument> {
        let now = Utc::now();
        let stored = self.data.get(slot)?.clone();
        if stored.is_expired(now) {
            self.data.remove(slot);
            return None;
        }
        Some(stored)
    }

    fn write(&self, slot: String, document: Document, expires_at: Option<DateTime<Utc>>) -> u64 {
        let version = self
            .data
            .get(&slot)
            .map_or(1, |stored| stored.version + 1);
        self.data.insert(
            slot,
            StoredDocument {
                document,
                version,
                expires_at,
            },
        );
        version
    }

    fn create_now(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult {
        self.with_slot(conn, extras, &item.key, item.offset, |db, slot| {
            if db.live(&slot).is_some() {
                return Err(DbError::DocumentExists {
                    key: item.key.clone(),
                });
            }
            Ok((None, db.write(slot, item.document.clone(), None)))
        })
    }

    fn update_now(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult {
        self.with_slot(conn, extras, &item.key, item.offset, |db, slot| {
            let expires_at = db.live(&slot).and_then(|stored| stored.expires_at);
            Ok((None, db.write(slot, item.document.clone(), expires_at)))
        })
    }

    fn read_now(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult {
        self.with_slot(conn, extras, key, offset, |db, slot| {
            let stored = db.live(&slot).ok_or_else(|| not_found(key))?;
            Ok((Some(stored.document), stored.version))
        })
    }

    fn delete_now(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult {
        self.with_slot(conn, extras, key, offset, |db, slot| {
            let stored = db.live(&slot).ok_or_else(|| not_found(key))?;
            db.data.remove(&slot);
            Ok((None, stored.version))
        })
    }

    fn touch_now(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult {
        self.with_slot(conn, extras, key, offset, |db, slot| {
            let stored = db.live(&slot).ok_or_else(|| not_found(key))?;
            let expires_at = extras
                .expiry_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
            Ok((None, db.write(slot, stored.document, expires_at)))
        })
    }

    /// Applies `mutate` to the live document, writing it back on success.
    fn mutate_doc<F>(
        &self,
        conn: &str,
        key: &str,
        offset: u64,
        extras: &Extras,
        mutate: F,
    ) -> OperationResult
    where
        F: FnOnce(&mut Document) -> Result<Option<Document>, DbError>,
    {
        self.with_slot(conn, extras, key, offset, |db, slot| {
            let mut stored = db.live(&slot).ok_or_else(|| not_found(key))?;
            let value = mutate(&mut stored.document)?;
            Ok((value, db.write(slot, stored.document, stored.expires_at)))
        })
    }

    fn bulk<F>(&self, items: &[KeyValue], mut op: F) -> Result<BulkOperationResult, DbError>
    where
        F: FnMut(&KeyValue) -> OperationResult,
    {
        self.take_bulk_fault()?;
        let mut out = BulkOperationResult::new();
        for item in items {
            out.insert(op(item));
        }
        Ok(out)
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn connect(&self, conn: &ConnectionInfo, _extras: &Extras) -> Result<(), DbError> {
        if conn.conn_str.trim().is_empty() {
            return Err(DbError::ConnectionFailed {
                message: "connection string is empty".to_string(),
            });
        }
        self.connections.insert(conn.conn_str.clone());
        Ok(())
    }

    async fn close(&self, conn: &ConnectionInfo) -> Result<(), DbError> {
        self.connections.remove(&conn.conn_str);
        Ok(())
    }

    fn fixed_bulk_batch_size(&self) -> Option<usize> {
        self.fixed_bulk_batch_size
    }

    async fn create(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult {
        self.create_now(conn, item, extras)
    }

    async fn update(&self, conn: &str, item: &KeyValue, extras: &Extras) -> OperationResult {
        self.update_now(conn, item, extras)
    }

    async fn read(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult {
        self.read_now(conn, key, offset, extras)
    }

    async fn delete(
        &self,
        conn: &str,
        key: &str,
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.delete_now(conn, key, offset, extras)
    }

    async fn touch(&self, conn: &str, key: &str, offset: u64, extras: &Extras) -> OperationResult {
        self.touch_now(conn, key, offset, extras)
    }

    async fn insert_sub_doc(
        &self,
        conn: &str,
        key: &str,
        values: &[SubDocValue],
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.mutate_doc(conn, key, offset, extras, |doc| {
            if let Some(existing) = values.iter().find(|v| lookup_path(doc, &v.path).is_some()) {
                return Err(DbError::PathExists {
                    key: key.to_string(),
                    path: existing.path.clone(),
                });
            }
            for v in values {
                set_path(doc, &v.path, v.value.clone());
            }
            Ok(None)
        })
    }

    async fn upsert_sub_doc(
        &self,
        conn: &str,
        key: &str,
        values: &[SubDocValue],
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.mutate_doc(conn, key, offset, extras, |doc| {
            for v in values {
                set_path(doc, &v.path, v.value.clone());
            }
            Ok(None)
        })
    }

    async fn replace_sub_doc(
        &self,
        conn: &str,
        key: &str,
        values: &[SubDocValue],
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.mutate_doc(conn, key, offset, extras, |doc| {
            if let Some(missing) = values.iter().find(|v| lookup_path(doc, &v.path).is_none()) {
                return Err(path_not_found(key, &missing.path));
            }
            for v in values {
                set_path(doc, &v.path, v.value.clone());
            }
            Ok(None)
        })
    }

    async fn read_sub_doc(
        &self,
        conn: &str,
        key: &str,
        paths: &[String],
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.with_slot(conn, extras, key, offset, |db, slot| {
            let stored = db.live(&slot).ok_or_else(|| not_found(key))?;
            let mut found = Map::new();
            for path in paths {
                let value =
                    lookup_path(&stored.document, path).ok_or_else(|| path_not_found(key, path))?;
                found.insert(path.clone(), value.clone());
            }
            Ok((Some(Value::Object(found)), stored.version))
        })
    }

    async fn delete_sub_doc(
        &self,
        conn: &str,
        key: &str,
        paths: &[String],
        offset: u64,
        extras: &Extras,
    ) -> OperationResult {
        self.mutate_doc(conn, key, offset, extras, |doc| {
            if let Some(missing) = paths.iter().find(|p| lookup_path(doc, p).is_none()) {
                return Err(path_not_found(key, missing));
            }
            for path in paths {
                remove_path(doc, path);
            }
            Ok(None)
        })
    }

    async fn create_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        self.bulk(items, |item| self.create_now(conn, item, extras))
    }

    async fn update_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        self.bulk(items, |item| self.update_now(conn, item, extras))
    }

    async fn read_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        self.bulk(items, |item| self.read_now(conn, &item.key, item.offset, extras))
    }

    async fn delete_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        self.bulk(items, |item| self.delete_now(conn, &item.key, item.offset, extras))
    }

    async fn touch_bulk(
        &self,
        conn: &str,
        items: &[KeyValue],
        extras: &Extras,
    ) -> Result<BulkOperationResult, DbError> {
        self.bulk(items, |item| self.touch_now(conn, &item.key, item.offset, extras))
    }
}

fn slot_key(conn: &str, extras: &Extras, key: &str) -> String {
    format!("{conn}|{}|{key}", extras.namespace_path())
}

fn not_found(key: &str) -> DbError {
    DbError::DocumentNotFound {
        key: key.to_string(),
    }
}

fn path_not_found(key: &str, path: &str) -> DbError {
    DbError::PathNotFound {
        key: key.to_string(),
        path: path.to_string(),
    }
}
