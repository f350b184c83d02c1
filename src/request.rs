//! The multi-task request context.
//!
//! A [`Request`] owns what tasks of one request share: the collection
//! metadata map, the ordered list of tasks run so far (the mutation replay
//! log), the cancellation token, the worker pool and the state store. The
//! metadata map and task list sit behind one mutex that is never held across
//! an await point.
//!
//! A request can be saved and loaded again in a later process; live handles
//! are rebuilt, and each task's completed set is reloaded from its state file.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{EngineSettings, OperationConfig};
use crate::db::{ConnectionInfo, ConnectionManager, Extras};
use crate::error::LoaderError;
use crate::executor::ReplaySource;
use crate::generator::TemplateRegistry;
use crate::metadata::{CollectionIdentifier, CollectionMetadata, MetadataRegistry};
use crate::operation::OperationKind;
use crate::scheduler::WorkerPool;
use crate::state::StateStore;

/// Persistable description of a configured task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub result_seed: String,
    pub operation: OperationKind,
    pub db_type: String,
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub extras: Extras,
    pub config: OperationConfig,
    pub collection: CollectionIdentifier,
    /// Collection seed at configuration time.
    pub seed: u64,
    pub mutation_seed: u64,
    pub created_at: DateTime<Utc>,
}

/// Serialized form of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
    pub id: String,
    pub metadata: MetadataRegistry,
    pub tasks: Vec<TaskDescriptor>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TaskEntry {
    descriptor: TaskDescriptor,
    /// Completed offsets, set when the task tears down.
    completed: Option<Arc<BTreeSet<u64>>>,
    pending: bool,
}

#[derive(Debug, Default)]
struct RequestInner {
    metadata: MetadataRegistry,
    tasks: Vec<TaskEntry>,
}

/// Shared context of the tasks of one request.
#[derive(Debug)]
pub struct Request {
    id: String,
    inner: Mutex<RequestInner>,
    cancel: CancellationToken,
    connections: ConnectionManager,
    templates: TemplateRegistry,
    pool: WorkerPool,
    store: StateStore,
    settings: EngineSettings,
}

impl Request {
    /// Creates an empty request with the built-in backends and templates.
    pub fn new(store: StateStore, settings: EngineSettings) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            inner: Mutex::new(RequestInner::default()),
            cancel: CancellationToken::new(),
            connections: ConnectionManager::with_defaults(),
            templates: TemplateRegistry::with_defaults(),
            pool: WorkerPool::new(settings.pool_size),
            store,
            settings,
        }
    }

    /// Replaces the connection manager.
    pub fn with_connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = connections;
        self
    }

    /// Replaces the template registry.
    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signals every task of the request to stop submitting work.
    pub fn cancel(&self) {
        info!(request_id = %self.id, "cancelling request");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Seed of `collection`, assigned on first use and grown to cover `end`.
    pub fn assign_seed(
        &self,
        collection: &CollectionIdentifier,
        end: u64,
        preferred_seed: Option<u64>,
    ) -> CollectionMetadata {
        self.inner
            .lock()
            .metadata
            .assign(collection, end, preferred_seed)
    }

    pub fn collection_metadata(&self, collection: &CollectionIdentifier) -> Option<CollectionMetadata> {
        self.inner.lock().metadata.get(collection)
    }

    /// Appends a configured task to the request's task list.
    pub fn register_task(&self, descriptor: TaskDescriptor) {
        debug!(
            request_id = %self.id,
            result_seed = %descriptor.result_seed,
            operation = %descriptor.operation,
            "registering task"
        );
        self.inner.lock().tasks.push(TaskEntry {
            descriptor,
            completed: None,
            pending: true,
        });
    }

    pub fn descriptor(&self, result_seed: &str) -> Option<TaskDescriptor> {
        self.inner
            .lock()
            .tasks
            .iter()
            .find(|t| t.descriptor.result_seed == result_seed)
            .map(|t| t.descriptor.clone())
    }

    /// Descriptors of every registered task, in registration order.
    pub fn descriptors(&self) -> Vec<TaskDescriptor> {
        self.inner
            .lock()
            .tasks
            .iter()
            .map(|t| t.descriptor.clone())
            .collect()
    }

    /// Returns `true` if the task is registered and has not torn down.
    pub fn is_pending(&self, result_seed: &str) -> bool {
        self.inner
            .lock()
            .tasks
            .iter()
            .any(|t| t.descriptor.result_seed == result_seed && t.pending)
    }

    pub fn mark_pending(&self, result_seed: &str) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.descriptor.result_seed == result_seed)
        {
            task.pending = true;
        }
    }

    /// Records a task's final completed set.
    pub fn mark_finished(&self, result_seed: &str, completed: Arc<BTreeSet<u64>>) {
        let mut inner = self.inner.lock();
        if let Some(task) = inner
            .tasks
            .iter_mut()
            .find(|t| t.descriptor.result_seed == result_seed)
        {
            task.completed = Some(completed);
            task.pending = false;
        }
    }

    /// Finished mutating tasks registered before `result_seed` on the same
    /// collection, in registration order.
    pub fn replay_sources(&self, collection: &CollectionIdentifier, result_seed: &str) -> Vec<ReplaySource> {
        let inner = self.inner.lock();
        inner
            .tasks
            .iter()
            .take_while(|t| t.descriptor.result_seed != result_seed)
            .filter(|t| &t.descriptor.collection == collection && t.descriptor.operation.is_replay_source())
            .filter_map(|t| {
                let completed = t.completed.clone()?;
                Some(ReplaySource {
                    operation: t.descriptor.operation,
                    config: t.descriptor.config.clone(),
                    mutation_seed: t.descriptor.mutation_seed,
                    completed,
                })
            })
            .collect()
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        let inner = self.inner.lock();
        RequestSnapshot {
            id: self.id.clone(),
            metadata: inner.metadata.clone(),
            tasks: inner.tasks.iter().map(|t| t.descriptor.clone()).collect(),
            saved_at: Utc::now(),
        }
    }

    /// Persists the metadata map and task descriptors.
    pub fn save(&self) -> Result<(), LoaderError> {
        self.store.save_request(&self.snapshot())
    }

    /// Rebuilds a saved request. Task completed sets are reloaded from their
    /// state files; tasks that never persisted a state have none.
    pub fn load(
        request_id: &str,
        store: StateStore,
        settings: EngineSettings,
    ) -> Result<Self, LoaderError> {
        let snapshot = store
            .load_request(request_id)?
            .ok_or_else(|| LoaderError::config(format!("no saved request '{request_id}'")))?;
        let mut tasks = Vec::with_capacity(snapshot.tasks.len());
        for descriptor in snapshot.tasks {
            let completed = store
                .load_state(&descriptor.result_seed)?
                .map(|state| Arc::new(state.completed));
            tasks.push(TaskEntry {
                descriptor,
                completed,
                pending: false,
            });
        }
        info!(request_id, tasks = tasks.len(), "loaded saved request");
        let mut request = Self::new(store, settings);
        request.id = snapshot.id;
        request.inner = Mutex::new(RequestInner {
            metadata: snapshot.metadata,
            tasks,
        });
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn descriptor(seed: &str, operation: OperationKind, collection: &CollectionIdentifier) -> TaskDescriptor {
        TaskDescriptor {
            result_seed: seed.to_string(),
            operation,
            db_type: "memory".to_string(),
            connection: ConnectionInfo::new("memory://req"),
            extras: Extras::default(),
            config: OperationConfig::with_range(0, 10),
            collection: collection.clone(),
            seed: 1,
            mutation_seed: 9,
            created_at: Utc::now(),
        }
    }

    fn collection(name: &str) -> CollectionIdentifier {
        CollectionIdentifier {
            db_type: "memory".to_string(),
            conn_str: "memory://req".to_string(),
            namespace: name.to_string(),
        }
    }

    fn request(dir: &TempDir) -> Request {
        Request::new(StateStore::open(dir.path()).unwrap(), EngineSettings::default())
    }

    #[test]
    fn test_pending_lifecycle() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir);
        req.register_task(descriptor("a", OperationKind::Create, &collection("users")));
        assert!(req.is_pending("a"));
        assert!(!req.is_pending("unknown"));
        req.mark_finished("a", Arc::new(BTreeSet::new()));
        assert!(!req.is_pending("a"));
    }

    #[test]
    fn test_replay_sources_are_prior_finished_mutations() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir);
        let users = collection("users");
        req.register_task(descriptor("create", OperationKind::Create, &users));
        req.register_task(descriptor("update", OperationKind::Update, &users));
        req.register_task(descriptor("other", OperationKind::Update, &collection("hotels")));
        req.register_task(descriptor("upsert", OperationKind::SubDocUpsert, &users));
        req.register_task(descriptor("validate", OperationKind::Validate, &users));
        for seed in ["create", "update", "other"] {
            req.mark_finished(seed, Arc::new((0..10).collect()));
        }

        let sources = req.replay_sources(&users, "validate");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].operation, OperationKind::Update);

        req.mark_finished("upsert", Arc::new((0..5).collect()));
        let sources = req.replay_sources(&users, "validate");
        assert_eq!(sources.len(), 2);
        assert!(req.replay_sources(&users, "update").is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir);
        let users = collection("users");
        let meta = req.assign_seed(&users, 100, Some(4_242));
        req.register_task(descriptor("t1", OperationKind::Update, &users));
        req.save().unwrap();

        let loaded = Request::load(
            req.id(),
            StateStore::open(dir.path()).unwrap(),
            EngineSettings::default(),
        )
        .unwrap();
        assert_eq!(loaded.id(), req.id());
        assert_eq!(loaded.collection_metadata(&users), Some(meta));
        assert_eq!(loaded.descriptors(), req.descriptors());
        assert!(!loaded.is_pending("t1"));
    }

    #[test]
    fn test_cancel_trips_token() {
        let dir = TempDir::new().unwrap();
        let req = request(&dir);
        assert!(!req.is_cancelled());
        req.cancel();
        assert!(req.cancel_token().is_cancelled());
    }
}
