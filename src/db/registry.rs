//! Backend selection by type string.
//!
//! A [`ConnectionManager`] is constructed explicitly and handed to each
//! request. It maps backend type strings (`"memory"`, `"couchbase"`, ...) to
//! factories and caches one [`Database`] instance per type, so every task of
//! every request sharing the manager talks to the same adapter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ConnectionInfo, Database, InMemoryDatabase};
use crate::error::LoaderError;

/// Builds a backend adapter.
pub type DatabaseFactory = Arc<dyn Fn() -> Arc<dyn Database> + Send + Sync>;

/// Backend type string of the built-in in-memory adapter.
pub const MEMORY_BACKEND: &str = "memory";

/// Registry of backend factories and live adapter instances.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    factories: Arc<Mutex<HashMap<String, DatabaseFactory>>>,
    instances: Arc<Mutex<HashMap<String, Arc<dyn Database>>>>,
    open: Arc<Mutex<Vec<(String, ConnectionInfo)>>>,
}

impl ConnectionManager {
    /// Creates a manager with no registered backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager with the built-in backends registered.
    pub fn with_defaults() -> Self {
        let manager = Self::new();
        manager.register(MEMORY_BACKEND, || -> Arc<dyn Database> {
            Arc::new(InMemoryDatabase::new())
        });
        manager
    }

    /// Registers (or replaces) the factory for `db_type`.
    ///
    /// A cached instance of the previous factory is dropped.
    pub fn register<F>(&self, db_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Database> + Send + Sync + 'static,
    {
        let db_type = db_type.into();
        self.instances.lock().remove(&db_type);
        self.factories.lock().insert(db_type, Arc::new(factory));
    }

    /// Registers an already-built adapter instance for `db_type`.
    pub fn register_instance(&self, db_type: impl Into<String>, database: Arc<dyn Database>) {
        let db_type = db_type.into();
        let shared = database.clone();
        self.factories
            .lock()
            .insert(db_type.clone(), Arc::new(move || shared.clone()));
        self.instances.lock().insert(db_type, database);
    }

    /// Returns the adapter for `db_type`, creating it on first use.
    pub fn get(&self, db_type: &str) -> Result<Arc<dyn Database>, LoaderError> {
        if let Some(db) = self.instances.lock().get(db_type) {
            return Ok(db.clone());
        }
        let factory = self
            .factories
            .lock()
            .get(db_type)
            .cloned()
            .ok_or_else(|| LoaderError::UnknownBackend {
                db_type: db_type.to_string(),
            })?;
        let mut instances = self.instances.lock();
        let db = instances
            .entry(db_type.to_string())
            .or_insert_with(|| {
                debug!(db_type, "creating database adapter");
                factory()
            })
            .clone();
        Ok(db)
    }

    /// Remembers a connection opened through this manager so it can be closed
    /// by [`close_all`](Self::close_all).
    pub fn track_connection(&self, db_type: &str, conn: &ConnectionInfo) {
        let mut open = self.open.lock();
        if !open
            .iter()
            .any(|(t, c)| t == db_type && c.conn_str == conn.conn_str)
        {
            open.push((db_type.to_string(), conn.clone()));
        }
    }

    /// Registered backend type strings, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes every tracked connection. Close failures are logged, not returned.
    pub async fn close_all(&self) {
        let open: Vec<_> = std::mem::take(&mut *self.open.lock());
        for (db_type, conn) in open {
            let Ok(db) = self.get(&db_type) else {
                continue;
            };
            if let Err(e) = db.close(&conn).await {
                warn!(db_type = %db_type, conn = %conn.conn_str, error = %e, "failed to close connection");
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backends", &self.backends())
            .field("open", &self.open.lock().len())
            .finish()
    }
}
