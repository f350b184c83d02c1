//! Batch scheduler.
//!
//! Splits a task range into contiguous sub-batches and hands each one to a
//! bounded [`WorkerPool`]. When the pool is saturated, submission is retried
//! with a fixed backoff; a sub-batch the pool never accepts is failed as a
//! whole through [`BatchWorker::fail_batch`] instead of being dropped.
//!
//! The scheduler waits on a [`TaskTracker`] until every accepted sub-batch
//! has finished. The request's cancellation token is checked before each
//! submission. Sub-batches never submitted are left untouched so a rerun
//! picks them up.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::EngineSettings;
use crate::error::{PoolError, POOL_SATURATED};

/// Splits `[start, end)` into `threads` equal sub-ranges plus a trailing
/// remainder sub-range.
///
/// When the range holds fewer offsets than `threads`, every offset gets its
/// own sub-range. An empty range yields no sub-ranges.
pub fn partition(start: u64, end: u64, threads: usize) -> Vec<Range<u64>> {
    let total = end.saturating_sub(start);
    if total == 0 {
        return Vec::new();
    }
    let threads = threads.max(1) as u64;
    if total < threads {
        return (start..end).map(|offset| offset..offset + 1).collect();
    }
    let batch = total / threads;
    let mut batches: Vec<Range<u64>> = (0..threads)
        .map(|i| start + i * batch..start + (i + 1) * batch)
        .collect();
    let covered = start + threads * batch;
    if covered < end {
        batches.push(covered..end);
    }
    batches
}

/// Documents per backend bulk call for a task.
///
/// A backend-imposed size wins. Otherwise the operation override or the
/// engine default applies, clamped to the per-thread fair share of the range.
pub fn bulk_batch_size(
    override_size: Option<usize>,
    settings: &EngineSettings,
    fixed: Option<usize>,
    range_len: u64,
) -> usize {
    if let Some(fixed) = fixed {
        return fixed.max(1);
    }
    let threads = settings.max_threads.max(1) as u64;
    let fair_share = range_len.div_ceil(threads).max(1);
    let wanted = override_size.unwrap_or(settings.default_bulk_batch_size) as u64;
    wanted.min(fair_share).max(1) as usize
}

/// Work executed for one sub-batch.
#[async_trait]
pub trait BatchWorker: Send + Sync + 'static {
    /// Processes every offset of the sub-batch, sequentially.
    async fn run_batch(&self, batch: Range<u64>);

    /// Marks the whole sub-batch failed without touching the backend.
    async fn fail_batch(&self, batch: Range<u64>, category: &str, message: String);
}

/// Bounded pool shared by every task of a request.
///
/// Capacity is enforced with semaphore permits; a sub-batch holds its permit
/// until it finishes.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `work` on `tracker` if a slot is free.
    pub fn try_submit<F>(&self, tracker: &TaskTracker, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => PoolError::Saturated,
                TryAcquireError::Closed => PoolError::Closed,
            })?;
        tracker.spawn(async move {
            let _permit = permit;
            work.await;
        });
        Ok(())
    }

    /// Rejects every later submission.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// What happened to the sub-batches of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub submitted: usize,
    /// Sub-batches failed as a whole after submission retries ran out.
    pub rejected: usize,
    /// Sub-batches left unsubmitted because the request was cancelled.
    pub skipped: Vec<Range<u64>>,
    pub cancelled: bool,
}

enum Submission {
    Accepted,
    Cancelled,
}

/// Submits sub-batches to a [`WorkerPool`] and waits for them.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    pool: WorkerPool,
    cancel: CancellationToken,
    submit_retry_attempts: u32,
    submit_backoff: Duration,
}

impl BatchScheduler {
    pub fn new(pool: WorkerPool, settings: &EngineSettings, cancel: CancellationToken) -> Self {
        Self {
            pool,
            cancel,
            submit_retry_attempts: settings.submit_retry_attempts.max(1),
            submit_backoff: settings.submit_backoff(),
        }
    }

    /// Runs every sub-batch through `worker` and blocks until all accepted
    /// sub-batches have finished.
    pub async fn run<W: BatchWorker>(&self, worker: Arc<W>, batches: Vec<Range<u64>>) -> ScheduleReport {
        let tracker = TaskTracker::new();
        let mut report = ScheduleReport::default();
        let mut pending = batches.into_iter();

        while let Some(batch) = pending.next() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.push(batch);
                report.skipped.extend(pending.by_ref());
                break;
            }
            match self.submit(&tracker, &worker, batch.clone()).await {
                Ok(Submission::Accepted) => {
                    debug!(start = batch.start, end = batch.end, "sub-batch submitted");
                    report.submitted += 1;
                }
                Ok(Submission::Cancelled) => {
                    report.cancelled = true;
                    report.skipped.push(batch);
                    report.skipped.extend(pending.by_ref());
                    break;
                }
                Err(e) => {
                    warn!(
                        start = batch.start,
                        end = batch.end,
                        error = %e,
                        "sub-batch rejected by worker pool"
                    );
                    worker.fail_batch(batch, POOL_SATURATED, e.to_string()).await;
                    report.rejected += 1;
                }
            }
        }

        if report.cancelled {
            warn!(
                skipped = report.skipped.len(),
                "request cancelled, remaining sub-batches not submitted"
            );
        }

        tracker.close();
        tracker.wait().await;
        report
    }

    async fn submit<W: BatchWorker>(
        &self,
        tracker: &TaskTracker,
        worker: &Arc<W>,
        batch: Range<u64>,
    ) -> Result<Submission, PoolError> {
        let mut attempt = 1;
        loop {
            let w = worker.clone();
            let b = batch.clone();
            match self.pool.try_submit(tracker, async move { w.run_batch(b).await }) {
                Ok(()) => return Ok(Submission::Accepted),
                Err(PoolError::Saturated) if attempt < self.submit_retry_attempts => {
                    debug!(
                        attempt,
                        backoff_ms = self.submit_backoff.as_millis() as u64,
                        "worker pool saturated, backing off"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.submit_backoff) => {}
                        _ = self.cancel.cancelled() => return Ok(Submission::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_even_partition() {
        assert_eq!(partition(0, 100, 4), vec![0..25, 25..50, 50..75, 75..100]);
    }

    #[test]
    fn test_partition_with_remainder() {
        assert_eq!(partition(0, 10, 3), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(partition(5, 12, 2), vec![5..8, 8..11, 11..12]);
    }

    #[test]
    fn test_partition_smaller_than_threads() {
        assert_eq!(partition(10, 13, 8), vec![10..11, 11..12, 12..13]);
        assert!(partition(4, 4, 8).is_empty());
        assert_eq!(partition(0, 1, 0), vec![0..1]);
    }

    #[test]
    fn test_bulk_batch_size_rules() {
        let settings = EngineSettings {
            max_threads: 4,
            default_bulk_batch_size: 100,
            ..EngineSettings::default()
        };
        assert_eq!(bulk_batch_size(None, &settings, None, 1_000), 100);
        assert_eq!(bulk_batch_size(None, &settings, None, 40), 10);
        assert_eq!(bulk_batch_size(Some(7), &settings, None, 1_000), 7);
        assert_eq!(bulk_batch_size(Some(500), &settings, Some(25), 1_000), 25);
        assert_eq!(bulk_batch_size(None, &settings, None, 0), 1);
    }

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<Range<u64>>>,
        failed: Mutex<Vec<(Range<u64>, String)>>,
        delay: Duration,
    }

    #[async_trait]
    impl BatchWorker for Recorder {
        async fn run_batch(&self, batch: Range<u64>) {
            tokio::time::sleep(self.delay).await;
            self.ran.lock().push(batch);
        }

        async fn fail_batch(&self, batch: Range<u64>, category: &str, _message: String) {
            self.failed.lock().push((batch, category.to_string()));
        }
    }

    fn settings(attempts: u32, backoff_ms: u64) -> EngineSettings {
        EngineSettings {
            submit_retry_attempts: attempts,
            submit_backoff_ms: backoff_ms,
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_all_batches_run_before_return() {
        let scheduler =
            BatchScheduler::new(WorkerPool::new(8), &settings(3, 1), CancellationToken::new());
        let worker = Arc::new(Recorder::default());
        let report = scheduler.run(worker.clone(), partition(0, 100, 4)).await;
        assert_eq!(report.submitted, 4);
        let mut ran = worker.ran.lock().clone();
        ran.sort_by_key(|r| r.start);
        assert_eq!(ran, partition(0, 100, 4));
    }

    #[tokio::test]
    async fn test_saturated_pool_fails_whole_batch() {
        let scheduler =
            BatchScheduler::new(WorkerPool::new(1), &settings(2, 1), CancellationToken::new());
        let worker = Arc::new(Recorder {
            delay: Duration::from_millis(200),
            ..Recorder::default()
        });
        let report = scheduler.run(worker.clone(), vec![0..5, 5..10]).await;
        assert_eq!(report.submitted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(
            worker.failed.lock().clone(),
            vec![(5..10, POOL_SATURATED.to_string())]
        );
    }

    #[tokio::test]
    async fn test_saturation_backoff_eventually_submits() {
        let scheduler =
            BatchScheduler::new(WorkerPool::new(1), &settings(50, 10), CancellationToken::new());
        let worker = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Recorder::default()
        });
        let report = scheduler.run(worker.clone(), vec![0..1, 1..2, 2..3]).await;
        assert_eq!(report.submitted, 3);
        assert_eq!(report.rejected, 0);
        assert_eq!(worker.ran.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_request_skips_remaining_batches() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let scheduler = BatchScheduler::new(WorkerPool::new(4), &settings(3, 1), cancel);
        let worker = Arc::new(Recorder::default());
        let report = scheduler.run(worker.clone(), vec![0..5, 5..10]).await;
        assert!(report.cancelled);
        assert_eq!(report.skipped, vec![0..5, 5..10]);
        assert!(worker.ran.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::new(2);
        pool.close();
        let tracker = TaskTracker::new();
        assert_eq!(pool.try_submit(&tracker, async {}), Err(PoolError::Closed));
        assert_eq!(pool.size(), 2);
    }
}
