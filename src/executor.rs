//! Operation executor.
//!
//! For each offset of a sub-batch the executor derives the key, regenerates
//! the expected document from the key's seed, replays mutations recorded by
//! earlier tasks of the same request, calls the [`Database`] contract and
//! reports the outcome: a status event to the state tracker and, on failure,
//! a classified entry in the result ledger.
//!
//! Bulk kinds group offsets into backend bulk calls of `bulk_size` items. A
//! bulk call that fails as a whole is recorded as a whole-batch failure over
//! the affected offset ranges.
//!
//! # Idempotent reruns
//!
//! On a rerun (or a retry) an insert that finds the document present, or a
//! delete that finds it gone, has already reached its end state. Those
//! outcomes count as success; a create additionally confirms presence with a
//! read first.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::OperationConfig;
use crate::db::{BulkOperationResult, Database, Extras, KeyValue, OperationResult, SubDocValue};
use crate::error::{DbError, GeneratorError, GENERATOR_FAILED, MISSING_BULK_RESULT, VALIDATION_MISMATCH};
use crate::generator::{mutation_seed, seeded_rng, set_path, Document, Template};
use crate::key::KeyBuilder;
use crate::operation::OperationKind;
use crate::result::{BulkFailure, FailedDocument, ResultRecorder, SdkTiming};
use crate::scheduler::BatchWorker;
use crate::state::{StateSender, TaskState};

/// A completed earlier task whose mutations must be replayed to know the
/// current state of a document.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    pub operation: OperationKind,
    pub config: OperationConfig,
    pub mutation_seed: u64,
    /// Offsets the source task completed.
    pub completed: Arc<BTreeSet<u64>>,
}

impl ReplaySource {
    /// Returns `true` if the source task mutated `offset`.
    pub fn covers(&self, offset: u64) -> bool {
        self.config.contains(offset) && self.completed.contains(&offset)
    }

    /// Applies the source task's mutation of the document at `absolute`.
    pub fn apply(
        &self,
        template: &dyn Template,
        absolute: u64,
        document: Document,
    ) -> Result<Document, GeneratorError> {
        let mut rng = seeded_rng(mutation_seed(absolute, self.mutation_seed));
        match self.operation.single_counterpart() {
            OperationKind::Update => template.update_document(
                &self.config.fields_to_change,
                &document,
                self.config.doc_size,
                &mut rng,
            ),
            OperationKind::SubDocUpsert => {
                let mut document = document;
                let values = sub_doc_values(
                    template,
                    absolute,
                    self.config.sub_doc_size,
                    Some(self.mutation_seed),
                );
                for value in values {
                    set_path(&mut document, &value.path, value.value);
                }
                Ok(document)
            }
            _ => Ok(document),
        }
    }
}

/// Sub-document paths for a key, with fresh values when `mutation` is set.
///
/// Paths always come from the key's own seed, so every sub-document task on
/// the same key targets the same paths.
pub fn sub_doc_values(
    template: &dyn Template,
    absolute: u64,
    size: usize,
    mutation: Option<u64>,
) -> Vec<SubDocValue> {
    let base = template.generate_sub_path_and_value(&mut seeded_rng(absolute), size);
    match mutation {
        None => base
            .into_iter()
            .map(|(path, value)| SubDocValue { path, value })
            .collect(),
        Some(task_seed) => {
            let fresh = template.generate_sub_path_and_value(
                &mut seeded_rng(mutation_seed(absolute, task_seed)),
                size,
            );
            base.into_keys()
                .zip(fresh.into_values())
                .map(|(path, value)| SubDocValue { path, value })
                .collect()
        }
    }
}

/// Outcome of one single-offset execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub offset: u64,
    pub key: String,
    pub error: Option<DbError>,
    pub extra: Map<String, Value>,
    pub timing: SdkTiming,
}

impl Attempt {
    fn from_result(result: OperationResult, timing: SdkTiming) -> Self {
        Self {
            offset: result.offset,
            key: result.key,
            error: result.error,
            extra: result.extra,
            timing,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Exception category of the failure, if any.
    pub fn category(&self) -> Option<&str> {
        self.error.as_ref().map(DbError::exception_category)
    }
}

/// Everything an executor needs for one task.
#[derive(Clone)]
pub struct ExecutionContext {
    pub operation: OperationKind,
    pub config: OperationConfig,
    pub db: Arc<dyn Database>,
    pub conn_str: String,
    pub extras: Extras,
    pub template: Arc<dyn Template>,
    pub keys: KeyBuilder,
    /// Seed of this task's own mutations.
    pub mutation_seed: u64,
    /// Earlier mutating tasks on the same collection, in request order.
    pub replay: Vec<ReplaySource>,
    /// Offsets already terminal from a previous pass.
    pub skip: Arc<TaskState>,
    /// `true` when re-running a task that already ran once.
    pub rerun: bool,
    /// Documents per bulk call.
    pub bulk_size: usize,
    pub state: StateSender,
    pub results: ResultRecorder,
}

/// Executes one task's operation over sub-batches or single offsets.
pub struct OperationExecutor {
    ctx: ExecutionContext,
}

impl OperationExecutor {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn operation(&self) -> OperationKind {
        self.ctx.operation
    }

    /// Document key of `offset`.
    pub fn key(&self, offset: u64) -> String {
        self.ctx.keys.key(offset)
    }

    /// Current expected document of `offset`: the generated document with
    /// every covering replay source applied in order.
    pub fn expected_document(&self, offset: u64) -> Result<Document, GeneratorError> {
        let ctx = &self.ctx;
        let absolute = ctx.keys.absolute(offset);
        let key = ctx.keys.key(offset);
        let mut document =
            ctx.template
                .generate_document(&mut seeded_rng(absolute), &key, ctx.config.doc_size);
        for source in ctx.replay.iter().filter(|s| s.covers(offset)) {
            document = source.apply(ctx.template.as_ref(), absolute, document)?;
        }
        Ok(document)
    }

    /// Document this task writes for an update of `offset`.
    pub fn updated_document(&self, offset: u64) -> Result<Document, GeneratorError> {
        let ctx = &self.ctx;
        let previous = self.expected_document(offset)?;
        let absolute = ctx.keys.absolute(offset);
        let mut rng = seeded_rng(mutation_seed(absolute, ctx.mutation_seed));
        ctx.template
            .update_document(&ctx.config.fields_to_change, &previous, ctx.config.doc_size, &mut rng)
    }

    /// Runs the single-document form of the task's operation on one offset.
    ///
    /// With `rerun` set, idempotent outcomes are resolved to success.
    pub async fn execute_single(&self, offset: u64, rerun: bool) -> Attempt {
        let key = self.key(offset);
        let timing = SdkTiming::start();
        let result = self.call_single(offset, &key).await;
        let mut attempt = Attempt::from_result(result, timing.ack());
        if rerun {
            self.resolve_idempotent(&mut attempt).await;
        }
        attempt
    }

    async fn call_single(&self, offset: u64, key: &str) -> OperationResult {
        let ctx = &self.ctx;
        let conn = ctx.conn_str.as_str();
        let extras = &ctx.extras;
        let absolute = ctx.keys.absolute(offset);
        let kind = ctx.operation.single_counterpart();

        match kind {
            OperationKind::Create => match self.expected_document(offset) {
                Ok(document) => ctx.db.create(conn, &item(key, offset, document), extras).await,
                Err(e) => generator_failure(key, offset, e),
            },
            OperationKind::Update => match self.updated_document(offset) {
                Ok(document) => ctx.db.update(conn, &item(key, offset, document), extras).await,
                Err(e) => generator_failure(key, offset, e),
            },
            OperationKind::Read => ctx.db.read(conn, key, offset, extras).await,
            OperationKind::Delete => ctx.db.delete(conn, key, offset, extras).await,
            OperationKind::Touch => ctx.db.touch(conn, key, offset, extras).await,
            OperationKind::Validate => {
                let expected = match self.expected_document(offset) {
                    Ok(document) => document,
                    Err(e) => return generator_failure(key, offset, e),
                };
                let read = ctx.db.read(conn, key, offset, extras).await;
                self.validate(read, &expected)
            }
            OperationKind::SubDocInsert => {
                let values = self.sub_doc_values(absolute, false);
                ctx.db.insert_sub_doc(conn, key, &values, offset, extras).await
            }
            OperationKind::SubDocUpsert => {
                let values = self.sub_doc_values(absolute, true);
                ctx.db.upsert_sub_doc(conn, key, &values, offset, extras).await
            }
            OperationKind::SubDocReplace => {
                let values = self.sub_doc_values(absolute, true);
                ctx.db.replace_sub_doc(conn, key, &values, offset, extras).await
            }
            OperationKind::SubDocRead => {
                let paths = self.sub_doc_paths(absolute);
                ctx.db.read_sub_doc(conn, key, &paths, offset, extras).await
            }
            OperationKind::SubDocDelete => {
                let paths = self.sub_doc_paths(absolute);
                ctx.db.delete_sub_doc(conn, key, &paths, offset, extras).await
            }
            OperationKind::BulkCreate
            | OperationKind::BulkUpdate
            | OperationKind::BulkRead
            | OperationKind::BulkDelete
            | OperationKind::BulkTouch
            | OperationKind::BulkValidate => OperationResult::failure(
                key,
                offset,
                DbError::Unsupported {
                    operation: kind.as_str().to_string(),
                },
            ),
        }
    }

    fn sub_doc_values(&self, absolute: u64, mutating: bool) -> Vec<SubDocValue> {
        let ctx = &self.ctx;
        sub_doc_values(
            ctx.template.as_ref(),
            absolute,
            ctx.config.sub_doc_size,
            mutating.then_some(ctx.mutation_seed),
        )
    }

    fn sub_doc_paths(&self, absolute: u64) -> Vec<String> {
        self.sub_doc_values(absolute, false)
            .into_iter()
            .map(|v| v.path)
            .collect()
    }

    /// Turns a successful read into a mismatch failure when the stored
    /// document differs from `expected`.
    fn validate(&self, read: OperationResult, expected: &Document) -> OperationResult {
        if !read.is_success() {
            return read;
        }
        let actual = read.value.clone().unwrap_or(Value::Null);
        let mismatch = match self.ctx.template.compare(expected, &actual) {
            Ok(true) => return read,
            Ok(false) => "stored document does not match the expected document".to_string(),
            Err(e) => e.to_string(),
        };
        OperationResult {
            error: Some(DbError::backend(VALIDATION_MISMATCH, mismatch)),
            ..read
        }
    }

    async fn resolve_idempotent(&self, attempt: &mut Attempt) {
        let kind = self.ctx.operation.single_counterpart();
        let Some(exempt) = kind.idempotent_category() else {
            return;
        };
        if attempt.category() != Some(exempt) {
            return;
        }
        if kind == OperationKind::Create {
            let ctx = &self.ctx;
            let read = ctx
                .db
                .read(&ctx.conn_str, &attempt.key, attempt.offset, &ctx.extras)
                .await;
            if !read.is_success() {
                return;
            }
        }
        debug!(
            offset = attempt.offset,
            category = exempt,
            "idempotent outcome on rerun, counting as success"
        );
        attempt.error = None;
        attempt
            .extra
            .insert("idempotent".to_string(), Value::Bool(true));
    }

    /// Reports an attempt made during the main pass.
    async fn settle(&self, attempt: Attempt) {
        let ctx = &self.ctx;
        match &attempt.error {
            None => {
                ctx.state.completed(attempt.offset).await;
            }
            Some(error) => {
                ctx.results.record_failure(
                    error.exception_category(),
                    FailedDocument {
                        offset: attempt.offset,
                        key: attempt.key.clone(),
                        error: error.to_string(),
                        extra: attempt.extra.clone(),
                        timing: attempt.timing,
                        retry: None,
                    },
                );
                ctx.state.err(attempt.offset).await;
            }
        }
    }

    /// Marks `offsets` failed as a whole under `category`.
    async fn fail_offsets(&self, offsets: &[u64], category: &str, message: &str, timing: SdkTiming) {
        for run in contiguous_runs(offsets) {
            self.ctx.results.record_bulk_failure(
                category,
                BulkFailure {
                    start: run.start,
                    end: run.end,
                    error: message.to_string(),
                    timing,
                },
            );
        }
        for &offset in offsets {
            self.ctx.state.err(offset).await;
        }
    }

    fn pending_offsets(&self, batch: Range<u64>) -> Vec<u64> {
        batch.filter(|o| !self.ctx.skip.is_terminal(*o)).collect()
    }

    async fn run_bulk_chunk(&self, offsets: &[u64]) {
        let ctx = &self.ctx;
        let kind = ctx.operation;
        let mut items = Vec::with_capacity(offsets.len());
        let mut expected: HashMap<String, Document> = HashMap::new();

        for &offset in offsets {
            let key = self.key(offset);
            let document = match kind {
                OperationKind::BulkCreate => self.expected_document(offset),
                OperationKind::BulkUpdate => self.updated_document(offset),
                OperationKind::BulkValidate => self.expected_document(offset).map(|doc| {
                    expected.insert(key.clone(), doc);
                    Value::Null
                }),
                _ => Ok(Value::Null),
            };
            match document {
                Ok(document) => items.push(item(&key, offset, document)),
                Err(e) => {
                    let failed = generator_failure(&key, offset, e);
                    self.settle(Attempt::from_result(failed, SdkTiming::start().ack()))
                        .await;
                }
            }
        }
        if items.is_empty() {
            return;
        }

        let timing = SdkTiming::start();
        let outcome = self.call_bulk(kind, &items).await;
        let timing = timing.ack();

        let bulk = match outcome {
            Ok(bulk) => bulk,
            Err(e) => {
                let offsets: Vec<u64> = items.iter().map(|i| i.offset).collect();
                self.fail_offsets(&offsets, e.exception_category(), &e.to_string(), timing)
                    .await;
                return;
            }
        };

        for item in items {
            let mut result = bulk.get(&item.key).cloned().unwrap_or_else(|| {
                OperationResult::failure(
                    &item.key,
                    item.offset,
                    DbError::backend(MISSING_BULK_RESULT, "bulk call returned no result for key"),
                )
            });
            if kind == OperationKind::BulkValidate {
                if let Some(doc) = expected.get(&item.key) {
                    result = self.validate(result, doc);
                }
            }
            let mut attempt = Attempt::from_result(result, timing);
            if ctx.rerun {
                self.resolve_idempotent(&mut attempt).await;
            }
            self.settle(attempt).await;
        }
    }

    async fn call_bulk(
        &self,
        kind: OperationKind,
        items: &[KeyValue],
    ) -> Result<BulkOperationResult, DbError> {
        let ctx = &self.ctx;
        let conn = ctx.conn_str.as_str();
        match kind {
            OperationKind::BulkCreate => ctx.db.create_bulk(conn, items, &ctx.extras).await,
            OperationKind::BulkUpdate => ctx.db.update_bulk(conn, items, &ctx.extras).await,
            OperationKind::BulkRead | OperationKind::BulkValidate => {
                ctx.db.read_bulk(conn, items, &ctx.extras).await
            }
            OperationKind::BulkDelete => ctx.db.delete_bulk(conn, items, &ctx.extras).await,
            OperationKind::BulkTouch => ctx.db.touch_bulk(conn, items, &ctx.extras).await,
            other => Err(DbError::Unsupported {
                operation: other.as_str().to_string(),
            }),
        }
    }
}

#[async_trait]
impl BatchWorker for OperationExecutor {
    async fn run_batch(&self, batch: Range<u64>) {
        let offsets = self.pending_offsets(batch.clone());
        debug!(
            operation = %self.ctx.operation,
            start = batch.start,
            end = batch.end,
            pending = offsets.len(),
            "running sub-batch"
        );
        if self.ctx.operation.is_bulk() {
            for chunk in offsets.chunks(self.ctx.bulk_size.max(1)) {
                self.run_bulk_chunk(chunk).await;
            }
        } else {
            for offset in offsets {
                let attempt = self.execute_single(offset, self.ctx.rerun).await;
                self.settle(attempt).await;
            }
        }
    }

    async fn fail_batch(&self, batch: Range<u64>, category: &str, message: String) {
        let offsets = self.pending_offsets(batch);
        let timing = SdkTiming::start().ack();
        self.fail_offsets(&offsets, category, &message, timing).await;
    }
}

fn item(key: &str, offset: u64, document: Document) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        offset,
        document,
    }
}

fn generator_failure(key: &str, offset: u64, error: GeneratorError) -> OperationResult {
    OperationResult::failure(key, offset, DbError::backend(GENERATOR_FAILED, error.to_string()))
}

/// Groups sorted offsets into maximal contiguous ranges.
pub fn contiguous_runs(offsets: &[u64]) -> Vec<Range<u64>> {
    let mut runs: Vec<Range<u64>> = Vec::new();
    for &offset in offsets {
        match runs.last_mut() {
            Some(run) if run.end == offset => run.end += 1,
            _ => runs.push(offset..offset + 1),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ConnectionInfo, InMemoryDatabase};
    use crate::generator::PersonTemplate;
    use crate::result::TaskResult;
    use crate::state::{OffsetStatus, StateTracker};
    use pretty_assertions::assert_eq;

    const CONN: &str = "memory://executor";

    struct Harness {
        db: Arc<InMemoryDatabase>,
        tracker: StateTracker,
        results: ResultRecorder,
    }

    impl Harness {
        async fn new() -> Self {
            let db = Arc::new(InMemoryDatabase::new());
            db.connect(&ConnectionInfo::new(CONN), &Extras::default())
                .await
                .unwrap();
            Self {
                db,
                tracker: StateTracker::spawn(TaskState::new(), 64, None),
                results: ResultRecorder::new(TaskResult::new("t", OperationKind::Create, 0, 10)),
            }
        }

        fn executor(&self, operation: OperationKind, rerun: bool) -> OperationExecutor {
            let mut config = OperationConfig::with_range(0, 10);
            config.validate().unwrap();
            OperationExecutor::new(ExecutionContext {
                operation,
                keys: KeyBuilder::new(&config, 1_000),
                config,
                db: self.db.clone(),
                conn_str: CONN.to_string(),
                extras: Extras::default(),
                template: Arc::new(PersonTemplate),
                mutation_seed: 77,
                replay: Vec::new(),
                skip: Arc::new(TaskState::new()),
                rerun,
                bulk_size: 4,
                state: self.tracker.sender(),
                results: self.results.clone(),
            })
        }
    }

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(contiguous_runs(&[1, 2, 3, 7, 8, 10]), vec![1..4, 7..9, 10..11]);
        assert!(contiguous_runs(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_create_then_validate() {
        let h = Harness::new().await;
        let create = h.executor(OperationKind::Create, false);
        create.run_batch(0..10).await;
        let validate = h.executor(OperationKind::BulkValidate, false);
        validate.run_batch(0..10).await;
        h.tracker.flush().await;
        let state = h.tracker.snapshot();
        assert_eq!(state.completed.len(), 10);
        assert!(h.results.snapshot().failures.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_create_fails_without_rerun() {
        let h = Harness::new().await;
        let exec = h.executor(OperationKind::Create, false);
        exec.run_batch(0..2).await;
        let again = exec.execute_single(1, false).await;
        assert_eq!(again.category(), Some("documentExists"));
        let rerun = exec.execute_single(1, true).await;
        assert!(rerun.succeeded());
        assert_eq!(rerun.extra["idempotent"], true);
    }

    #[tokio::test]
    async fn test_delete_rerun_is_idempotent() {
        let h = Harness::new().await;
        h.executor(OperationKind::Create, false).run_batch(0..1).await;
        let delete = h.executor(OperationKind::Delete, true);
        assert!(delete.execute_single(0, true).await.succeeded());
        assert!(delete.execute_single(0, true).await.succeeded());
        let strict = h.executor(OperationKind::Delete, false);
        assert_eq!(
            strict.execute_single(0, false).await.category(),
            Some("documentNotFound")
        );
    }

    #[tokio::test]
    async fn test_validate_detects_mismatch() {
        let h = Harness::new().await;
        h.executor(OperationKind::Create, false).run_batch(0..3).await;
        // An update not registered as a replay source makes offset 1 diverge.
        h.executor(OperationKind::Update, false).run_batch(1..2).await;
        let validate = h.executor(OperationKind::Validate, false);
        assert!(validate.execute_single(0, false).await.succeeded());
        assert_eq!(
            validate.execute_single(1, false).await.category(),
            Some("validationMismatch")
        );
    }

    #[tokio::test]
    async fn test_replay_reconstructs_updated_document() {
        let h = Harness::new().await;
        h.executor(OperationKind::Create, false).run_batch(0..4).await;
        let update = h.executor(OperationKind::Update, false);
        update.run_batch(0..4).await;

        let mut validate = h.executor(OperationKind::Validate, false);
        validate.ctx.replay.push(ReplaySource {
            operation: OperationKind::Update,
            config: update.ctx.config.clone(),
            mutation_seed: 77,
            completed: Arc::new((0..4).collect()),
        });
        for offset in 0..4 {
            assert!(validate.execute_single(offset, false).await.succeeded());
        }
    }

    #[tokio::test]
    async fn test_whole_bulk_failure_is_recorded_as_range() {
        let h = Harness::new().await;
        h.db.inject_bulk_fault(DbError::ConnectionFailed { message: "down".into() }, 1);
        let exec = h.executor(OperationKind::BulkCreate, false);
        exec.run_batch(0..6).await;
        h.tracker.flush().await;

        let result = h.results.snapshot();
        let bulk = &result.bulk_errors["connectionFailed"];
        assert_eq!(bulk.len(), 1);
        assert_eq!((bulk[0].start, bulk[0].end), (0, 4));
        let state = h.tracker.snapshot();
        assert_eq!(state.err, (0..4).collect::<BTreeSet<u64>>());
        assert_eq!(state.completed, (4..6).collect::<BTreeSet<u64>>());
    }

    #[tokio::test]
    async fn test_skip_set_is_not_revisited() {
        let h = Harness::new().await;
        let mut exec = h.executor(OperationKind::Create, true);
        let mut skip = TaskState::new();
        skip.apply(0, OffsetStatus::Completed);
        skip.apply(1, OffsetStatus::Err);
        exec.ctx.skip = Arc::new(skip);
        exec.run_batch(0..3).await;
        h.tracker.flush().await;
        assert_eq!(h.db.len(), 1);
        assert!(h.tracker.check_offset_in_complete(2));
        assert!(!h.tracker.check_offset_in_complete(0));
    }

    #[tokio::test]
    async fn test_sub_doc_paths_are_shared_across_kinds() {
        let h = Harness::new().await;
        h.executor(OperationKind::Create, false).run_batch(0..1).await;
        let insert = h.executor(OperationKind::SubDocInsert, false);
        assert!(insert.execute_single(0, false).await.succeeded());
        let upsert = h.executor(OperationKind::SubDocUpsert, false);
        assert!(upsert.execute_single(0, false).await.succeeded());
        let read = h.executor(OperationKind::SubDocRead, false);
        assert!(read.execute_single(0, false).await.succeeded());
        let delete = h.executor(OperationKind::SubDocDelete, false);
        assert!(delete.execute_single(0, false).await.succeeded());
        assert_eq!(
            delete.execute_single(0, false).await.category(),
            Some("pathNotFound")
        );
        assert!(delete.execute_single(0, true).await.succeeded());
    }
}
