//! Task lifecycle: configure, run, rerun and retry-exceptions.
//!
//! A [`LoadTask`] is one operation over one offset range of one collection,
//! registered with a [`Request`]. Running it goes through three phases:
//!
//! 1. **Do.** The range is partitioned into sub-batches and scheduled on the
//!    request's worker pool. Every offset reports to the state tracker, which
//!    checkpoints periodically.
//! 2. **Retry.** The exception policy of the task configuration is applied
//!    to the recorded failures.
//! 3. **Teardown.** The tracker is drained, the counters are recomputed from
//!    the state, and state and result are persisted under the result seed.
//!
//! A task can later be rerun from its persisted state (terminal offsets are
//! skipped, idempotent outcomes count as success) or asked to retry its
//! recorded exceptions without a new main pass.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Exceptions, OperationConfig};
use crate::db::{ConnectionInfo, Database, Extras};
use crate::error::LoaderError;
use crate::executor::{ExecutionContext, OperationExecutor};
use crate::generator::Template;
use crate::key::KeyBuilder;
use crate::metadata::CollectionIdentifier;
use crate::operation::OperationKind;
use crate::request::{Request, TaskDescriptor};
use crate::result::{ResultRecorder, TaskResult};
use crate::retry::RetryPipeline;
use crate::scheduler::{bulk_batch_size, partition, BatchScheduler};
use crate::state::{Checkpoint, StateTracker, TaskState};

/// What to run, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub operation: OperationKind,
    pub db_type: String,
    pub connection: ConnectionInfo,
    #[serde(default)]
    pub extras: Extras,
    #[serde(default)]
    pub config: OperationConfig,
    /// Seed to use if the collection has none yet.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Outcome of a task run, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub result_seed: String,
    pub operation: OperationKind,
    pub success: u64,
    pub failure: u64,
    pub failures_by_category: BTreeMap<String, u64>,
    /// Offsets recovered by retries.
    pub retried: u64,
    /// `true` if the request was cancelled before every sub-batch ran.
    pub cancelled: bool,
}

impl TaskSummary {
    pub fn from_result(result: &TaskResult, cancelled: bool) -> Self {
        Self {
            result_seed: result.result_seed.clone(),
            operation: result.operation,
            success: result.success,
            failure: result.failure,
            failures_by_category: result.failures_by_category(),
            retried: result.retried_count(),
            cancelled,
        }
    }
}

/// A configured task bound to its request.
pub struct LoadTask {
    request: Arc<Request>,
    descriptor: TaskDescriptor,
    db: Arc<dyn Database>,
    template: Arc<dyn Template>,
    rerun: bool,
}

impl std::fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadTask")
            .field("request_id", &self.request.id())
            .field("result_seed", &self.descriptor.result_seed)
            .field("operation", &self.descriptor.operation)
            .field("rerun", &self.rerun)
            .finish()
    }
}

impl LoadTask {
    /// Validates `spec`, connects to the backend, assigns the collection seed
    /// and registers the task with `request`.
    pub async fn configure(request: Arc<Request>, spec: TaskSpec) -> Result<Self, LoaderError> {
        if request.is_cancelled() {
            return Err(LoaderError::Cancelled {
                request_id: request.id().to_string(),
            });
        }
        let TaskSpec {
            operation,
            db_type,
            connection,
            extras,
            mut config,
            seed,
        } = spec;
        config.validate()?;
        if connection.conn_str.trim().is_empty() {
            return Err(LoaderError::config("a connection string is required"));
        }
        let template = request.templates().get(&config.template)?;
        let db = request.connections().get(&db_type)?;
        open_connection(db.as_ref(), &connection, &extras).await?;
        request.connections().track_connection(&db_type, &connection);

        let collection = CollectionIdentifier::new(&db_type, &connection, &extras);
        let known_seed = request
            .collection_metadata(&collection)
            .map(|meta| meta.seed)
            .or(seed);
        if let Some(known_seed) = known_seed {
            check_key_space(known_seed, config.end)?;
        }
        let metadata = request.assign_seed(&collection, config.end, seed);
        check_key_space(metadata.seed, config.end)?;
        let descriptor = TaskDescriptor {
            result_seed: Uuid::new_v4().simple().to_string(),
            operation,
            db_type,
            connection,
            extras,
            config,
            collection,
            seed: metadata.seed,
            mutation_seed: rand::rng().random(),
            created_at: Utc::now(),
        };
        info!(
            request_id = %request.id(),
            result_seed = %descriptor.result_seed,
            operation = %descriptor.operation,
            collection = %descriptor.collection,
            seed = descriptor.seed,
            start = descriptor.config.start,
            end = descriptor.config.end,
            "task configured"
        );
        request.register_task(descriptor.clone());

        Ok(Self {
            request,
            descriptor,
            db,
            template,
            rerun: false,
        })
    }

    /// Rebinds a task already registered with `request` (possibly loaded
    /// from disk) so it can be rerun or retried.
    pub async fn resume(request: Arc<Request>, result_seed: &str) -> Result<Self, LoaderError> {
        let descriptor = request
            .descriptor(result_seed)
            .ok_or_else(|| LoaderError::UnknownResultSeed {
                result_seed: result_seed.to_string(),
            })?;
        let template = request.templates().get(&descriptor.config.template)?;
        let db = request.connections().get(&descriptor.db_type)?;
        open_connection(db.as_ref(), &descriptor.connection, &descriptor.extras).await?;
        request
            .connections()
            .track_connection(&descriptor.db_type, &descriptor.connection);
        Ok(Self {
            request,
            descriptor,
            db,
            template,
            rerun: true,
        })
    }

    /// Resumes the task identified by `result_seed` and runs it again.
    pub async fn rerun(request: Arc<Request>, result_seed: &str) -> Result<TaskSummary, LoaderError> {
        Self::resume(request, result_seed).await?.run().await
    }

    pub fn result_seed(&self) -> &str {
        &self.descriptor.result_seed
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Document key of `offset` in this task's collection.
    pub fn key(&self, offset: u64) -> String {
        KeyBuilder::new(&self.descriptor.config, self.descriptor.seed).key(offset)
    }

    /// Runs the task to completion (or cancellation) and persists its
    /// state and result.
    pub async fn run(&self) -> Result<TaskSummary, LoaderError> {
        let settings = self.request.settings();
        let config = &self.descriptor.config;
        let seed = self.result_seed();
        self.request.mark_pending(seed);

        let (state, result) = if self.rerun {
            self.load_persisted().await?
        } else {
            (
                TaskState::new(),
                TaskResult::new(seed, self.descriptor.operation, config.start, config.end),
            )
        };
        let tracker = StateTracker::spawn(state.clone(), settings.state_channel_capacity, self.checkpoint());
        let results = ResultRecorder::new(result);
        let executor = Arc::new(OperationExecutor::new(self.context(&tracker, &results, state)));

        let batches = partition(config.start, config.end, settings.max_threads);
        info!(
            result_seed = %seed,
            operation = %self.descriptor.operation,
            batches = batches.len(),
            rerun = self.rerun,
            "starting task"
        );
        let scheduler = BatchScheduler::new(
            self.request.pool().clone(),
            settings,
            self.request.cancel_token().clone(),
        );
        let report = scheduler.run(executor.clone(), batches).await;

        let pipeline = RetryPipeline {
            executor,
            tracker: &tracker,
            results: &results,
            concurrency: settings.retry_concurrency,
        };
        pipeline
            .reconcile(&config.exceptions, config.exceptions.retry_attempts)
            .await;

        self.tear_down(tracker, results, report.cancelled).await
    }

    /// Applies an exception policy to the persisted failures of this task
    /// without running a new main pass. `None` uses the task's own policy.
    ///
    /// At least one attempt is made per retried offset.
    pub async fn retry_exceptions(&self, exceptions: Option<Exceptions>) -> Result<TaskSummary, LoaderError> {
        let seed = self.result_seed();
        let exceptions = exceptions.unwrap_or_else(|| self.descriptor.config.exceptions.clone());
        let attempts = exceptions.retry_attempts.max(1);
        self.request.mark_pending(seed);

        let (state, result) = self.load_persisted().await?;
        let settings = self.request.settings();
        let tracker = StateTracker::spawn(state.clone(), settings.state_channel_capacity, self.checkpoint());
        let results = ResultRecorder::new(result);
        let executor = Arc::new(OperationExecutor::new(self.context(&tracker, &results, state)));

        info!(
            result_seed = %seed,
            ignore = ?exceptions.ignore_exceptions,
            retry = ?exceptions.retry_exceptions,
            attempts,
            "retrying task exceptions"
        );
        let pipeline = RetryPipeline {
            executor,
            tracker: &tracker,
            results: &results,
            concurrency: settings.retry_concurrency,
        };
        pipeline.reconcile(&exceptions, attempts).await;

        self.tear_down(tracker, results, false).await
    }

    async fn load_persisted(&self) -> Result<(TaskState, TaskResult), LoaderError> {
        let seed = self.result_seed();
        let file_seed = seed.to_string();
        let (state, result) = self
            .request
            .store()
            .spawn_blocking(move |store| Ok((store.load_state(&file_seed)?, store.load_result(&file_seed)?)))
            .await?;
        if state.is_none() && result.is_none() {
            warn!(result_seed = %seed, "no persisted state, running from scratch");
        }
        let config = &self.descriptor.config;
        Ok((
            state.unwrap_or_default(),
            result.unwrap_or_else(|| {
                TaskResult::new(seed, self.descriptor.operation, config.start, config.end)
            }),
        ))
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        let settings = self.request.settings();
        (settings.checkpoint_interval_ms > 0).then(|| Checkpoint {
            store: self.request.store().clone(),
            result_seed: self.result_seed().to_string(),
            interval: settings.checkpoint_interval(),
        })
    }

    fn context(&self, tracker: &StateTracker, results: &ResultRecorder, skip: TaskState) -> ExecutionContext {
        let d = &self.descriptor;
        let settings = self.request.settings();
        ExecutionContext {
            operation: d.operation,
            config: d.config.clone(),
            db: self.db.clone(),
            conn_str: d.connection.conn_str.clone(),
            extras: d.extras.clone(),
            template: self.template.clone(),
            keys: KeyBuilder::new(&d.config, d.seed),
            mutation_seed: d.mutation_seed,
            replay: self.request.replay_sources(&d.collection, &d.result_seed),
            skip: Arc::new(skip),
            rerun: self.rerun,
            bulk_size: bulk_batch_size(
                d.config.bulk_batch_size,
                settings,
                self.db.fixed_bulk_batch_size(),
                d.config.len(),
            ),
            state: tracker.sender(),
            results: results.clone(),
        }
    }

    async fn tear_down(
        &self,
        tracker: StateTracker,
        results: ResultRecorder,
        cancelled: bool,
    ) -> Result<TaskSummary, LoaderError> {
        let seed = self.result_seed();
        let state = tracker.finish().await;
        results.with(|r| r.recompute_counts(&state));
        let result = results.snapshot();

        let summary = TaskSummary::from_result(&result, cancelled);

        let store = self.request.store();
        let state_seed = seed.to_string();
        let state = store
            .spawn_blocking(move |store| {
                store.save_state(&state_seed, &state)?;
                store.save_result(&result)?;
                Ok(state)
            })
            .await?;
        self.request.mark_finished(seed, Arc::new(state.completed));
        let snapshot = self.request.snapshot();
        store
            .spawn_blocking(move |store| store.save_request(&snapshot))
            .await?;

        info!(
            result_seed = %seed,
            operation = %summary.operation,
            success = summary.success,
            failure = summary.failure,
            retried = summary.retried,
            cancelled,
            "task finished"
        );
        Ok(summary)
    }
}

/// Rejects a range whose absolute keys `seed + offset` would overflow.
fn check_key_space(seed: u64, end: u64) -> Result<(), LoaderError> {
    match seed.checked_add(end) {
        Some(_) => Ok(()),
        None => Err(LoaderError::config(format!(
            "seed {seed} plus range end {end} overflows the key space"
        ))),
    }
}

async fn open_connection(db: &dyn Database, conn: &ConnectionInfo, extras: &Extras) -> Result<(), LoaderError> {
    let wrap = |source| LoaderError::Connection {
        connection: conn.conn_str.clone(),
        source,
    };
    db.connect(conn, extras).await.map_err(wrap)?;
    db.warmup(conn, extras).await.map_err(wrap)
}
