//! Exception retry pipeline.
//!
//! Runs after a task's main pass (and on explicit retry-exceptions requests)
//! to reconcile recorded failures:
//!
//! 1. **Ignore.** Every offset recorded under an ignored category moves to
//!    `Completed`, and the category disappears from the result.
//! 2. **Retry.** Every offset under a retried category (all categories when
//!    the list is empty) is re-executed through the single-document path with
//!    idempotent rerun semantics, at most `retry_concurrency` at a time.
//!    Recovered offsets move to `Completed` and their failure record moves to
//!    `retried_errors`; the rest stay in `Err` with updated retry info.
//! 3. **Flush.** The tracker is flushed so the caller can persist a state
//!    that reflects every transition.
//!
//! Whole-batch failures of a retried category are expanded into per-offset
//! failures first.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::Exceptions;
use crate::executor::{Attempt, OperationExecutor};
use crate::result::{ResultRecorder, RetriedResult};
use crate::state::StateTracker;

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Offsets moved to `Completed` by the ignore step.
    pub ignored: u64,
    /// Offsets re-executed.
    pub retried: u64,
    /// Re-executed offsets that succeeded.
    pub recovered: u64,
    /// Re-executed offsets still failing.
    pub still_failing: u64,
}

/// Reconciles failures of one task.
pub struct RetryPipeline<'a> {
    pub executor: Arc<OperationExecutor>,
    pub tracker: &'a StateTracker,
    pub results: &'a ResultRecorder,
    /// Concurrent single-offset retries.
    pub concurrency: usize,
}

impl RetryPipeline<'_> {
    /// Applies `exceptions` with `attempts` tries per failed offset.
    ///
    /// `attempts == 0` skips the retry step.
    pub async fn reconcile(&self, exceptions: &Exceptions, attempts: u32) -> RetryReport {
        let mut report = RetryReport::default();
        self.tracker.flush().await;

        let state = self.tracker.sender();
        for category in &exceptions.ignore_exceptions {
            let offsets = self.results.with(|r| r.remove_category(category));
            if offsets.is_empty() {
                continue;
            }
            debug!(category = %category, offsets = offsets.len(), "ignoring exception category");
            for &offset in &offsets {
                state.completed(offset).await;
            }
            report.ignored += offsets.len() as u64;
        }

        if attempts > 0 {
            self.retry(exceptions, attempts, &mut report).await;
        }

        self.tracker.flush().await;
        if report != RetryReport::default() {
            info!(
                operation = %self.executor.operation(),
                ignored = report.ignored,
                retried = report.retried,
                recovered = report.recovered,
                still_failing = report.still_failing,
                "exception reconciliation finished"
            );
        }
        report
    }

    async fn retry(&self, exceptions: &Exceptions, attempts: u32, report: &mut RetryReport) {
        let ignored: BTreeSet<&str> = exceptions
            .ignore_exceptions
            .iter()
            .map(String::as_str)
            .collect();
        let requested = if exceptions.retry_exceptions.is_empty() {
            self.results.with(|r| r.categories())
        } else {
            exceptions.retry_exceptions.clone()
        };
        let categories: Vec<String> = requested
            .into_iter()
            .filter(|c| !ignored.contains(c.as_str()))
            .collect();

        let executor = &self.executor;
        let targets: Vec<(String, u64)> = self.results.with(|r| {
            for category in &categories {
                r.expand_bulk_failures(category, |offset| executor.key(offset));
            }
            categories
                .iter()
                .flat_map(|category| {
                    r.failures
                        .get(category)
                        .into_iter()
                        .flat_map(|entries| entries.keys().copied())
                        .map(move |offset| (category.clone(), offset))
                })
                .collect()
        });

        let state = self.tracker.sender();
        let limiter = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut pending = FuturesUnordered::new();

        for (category, offset) in targets {
            if self.tracker.check_offset_in_complete(offset) {
                // Completed by an earlier pass; only the ledger is stale.
                let now = chrono::Utc::now();
                self.results.apply_retry(
                    &category,
                    offset,
                    RetriedResult {
                        status: true,
                        attempts: 0,
                        error: None,
                        extra: Default::default(),
                        init_time: now,
                        ack_time: now,
                    },
                );
                continue;
            }
            let limiter = limiter.clone();
            let executor = self.executor.clone();
            pending.push(async move {
                let _permit = limiter.acquire_owned().await.ok();
                let (attempt, tries) = retry_offset(&executor, offset, attempts).await;
                (category, attempt, tries)
            });
        }

        while let Some((category, attempt, tries)) = pending.next().await {
            report.retried += 1;
            let recovered = attempt.succeeded();
            self.results.apply_retry(
                &category,
                attempt.offset,
                RetriedResult {
                    status: recovered,
                    attempts: tries,
                    error: attempt.error.as_ref().map(ToString::to_string),
                    extra: attempt.extra.clone(),
                    init_time: attempt.timing.init_time,
                    ack_time: attempt.timing.ack_time,
                },
            );
            if recovered {
                state.completed(attempt.offset).await;
                report.recovered += 1;
            } else {
                report.still_failing += 1;
            }
        }
    }
}

/// Re-executes one offset up to `attempts` times, stopping at the first success.
async fn retry_offset(executor: &OperationExecutor, offset: u64, attempts: u32) -> (Attempt, u32) {
    let mut tries = 1;
    let mut attempt = executor.execute_single(offset, true).await;
    while !attempt.succeeded() && tries < attempts {
        tries += 1;
        attempt = executor.execute_single(offset, true).await;
    }
    (attempt, tries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperationConfig;
    use crate::db::{ConnectionInfo, Database, Extras, InMemoryDatabase};
    use crate::error::DbError;
    use crate::executor::ExecutionContext;
    use crate::generator::PersonTemplate;
    use crate::key::KeyBuilder;
    use crate::operation::OperationKind;
    use crate::result::TaskResult;
    use crate::scheduler::BatchWorker;
    use crate::state::TaskState;
    use pretty_assertions::assert_eq;

    const CONN: &str = "memory://retry";

    async fn setup(
        operation: OperationKind,
    ) -> (Arc<InMemoryDatabase>, Arc<OperationExecutor>, StateTracker, ResultRecorder) {
        let db = Arc::new(InMemoryDatabase::new());
        db.connect(&ConnectionInfo::new(CONN), &Extras::default())
            .await
            .unwrap();
        let mut config = OperationConfig::with_range(0, 10);
        config.validate().unwrap();
        let tracker = StateTracker::spawn(TaskState::new(), 64, None);
        let results = ResultRecorder::new(TaskResult::new("r", operation, 0, 10));
        let executor = Arc::new(OperationExecutor::new(ExecutionContext {
            operation,
            keys: KeyBuilder::new(&config, 500),
            config,
            db: db.clone(),
            conn_str: CONN.to_string(),
            extras: Extras::default(),
            template: Arc::new(PersonTemplate),
            mutation_seed: 3,
            replay: Vec::new(),
            skip: Arc::new(TaskState::new()),
            rerun: false,
            bulk_size: 5,
            state: tracker.sender(),
            results: results.clone(),
        }));
        (db, executor, tracker, results)
    }

    #[tokio::test]
    async fn test_ignored_category_is_dropped_and_completed() {
        let (db, executor, tracker, results) = setup(OperationKind::Create).await;
        db.inject_fault(executor.key(2), DbError::Timeout, 1);
        db.inject_fault(executor.key(6), DbError::Timeout, 1);
        executor.run_batch(0..10).await;

        let pipeline = RetryPipeline {
            executor: executor.clone(),
            tracker: &tracker,
            results: &results,
            concurrency: 2,
        };
        let exceptions = Exceptions {
            ignore_exceptions: vec!["timeout".to_string()],
            ..Exceptions::default()
        };
        let report = pipeline.reconcile(&exceptions, 0).await;
        assert_eq!(report.ignored, 2);

        let state = tracker.snapshot();
        assert_eq!(state.completed.len(), 10);
        assert!(state.err.is_empty());
        assert!(!results.snapshot().failures.contains_key("timeout"));
    }

    #[tokio::test]
    async fn test_document_exists_retry_moves_to_retried_ledger() {
        let (db, executor, tracker, results) = setup(OperationKind::Create).await;
        db.inject_fault(
            executor.key(5),
            DbError::DocumentExists {
                key: executor.key(5),
            },
            1,
        );
        executor.run_batch(0..10).await;
        // The document is actually present (written by an earlier attempt).
        executor.execute_single(5, false).await;
        tracker.flush().await;
        assert!(tracker.check_offset_in_err(5));

        let pipeline = RetryPipeline {
            executor: executor.clone(),
            tracker: &tracker,
            results: &results,
            concurrency: 4,
        };
        let exceptions = Exceptions {
            retry_exceptions: vec!["documentExists".to_string()],
            retry_attempts: 1,
            ..Exceptions::default()
        };
        let report = pipeline.reconcile(&exceptions, 1).await;
        assert_eq!(report.recovered, 1);

        assert!(tracker.check_offset_in_complete(5));
        let result = results.snapshot();
        assert!(result.failures.is_empty());
        let retried = &result.retried_errors["documentExists"];
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[&5].offset, 5);
        assert!(retried[&5].retry.as_ref().unwrap().status);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_keeps_offset_failed() {
        let (db, executor, tracker, results) = setup(OperationKind::Create).await;
        db.inject_fault(executor.key(1), DbError::Timeout, 10);
        executor.run_batch(0..10).await;

        let pipeline = RetryPipeline {
            executor: executor.clone(),
            tracker: &tracker,
            results: &results,
            concurrency: 1,
        };
        let report = pipeline.reconcile(&Exceptions::default(), 3).await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.still_failing, 1);
        assert!(tracker.check_offset_in_err(1));

        let failed = &results.snapshot().failures["timeout"][&1];
        let retry = failed.retry.as_ref().unwrap();
        assert!(!retry.status);
        assert_eq!(retry.attempts, 3);
    }

    #[tokio::test]
    async fn test_whole_batch_failure_is_retried_per_offset() {
        let (db, executor, tracker, results) = setup(OperationKind::BulkCreate).await;
        db.inject_bulk_fault(DbError::ConnectionFailed { message: "down".into() }, 1);
        executor.run_batch(0..10).await;
        tracker.flush().await;
        assert_eq!(tracker.snapshot().err.len(), 5);

        let pipeline = RetryPipeline {
            executor: executor.clone(),
            tracker: &tracker,
            results: &results,
            concurrency: 3,
        };
        let report = pipeline.reconcile(&Exceptions::default(), 1).await;
        assert_eq!(report.recovered, 5);

        let result = results.snapshot();
        assert!(result.bulk_errors.is_empty());
        assert_eq!(result.retried_errors["connectionFailed"].len(), 5);
        assert_eq!(tracker.snapshot().completed.len(), 10);
    }
}
