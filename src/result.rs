//! Task result ledger.
//!
//! A [`TaskResult`] groups per-offset failures by exception category, keeps
//! whole-batch failures apart (they carry a range, not a key), and mirrors
//! every successful retry into `retried_errors` so the original failure
//! evidence survives reconciliation.
//!
//! Per-offset ledgers are keyed by offset in memory, so recording and
//! retrying a failure cost `O(log n)`. On disk each category is still a
//! JSON array of failure records.
//!
//! Success and failure counts are never accumulated incrementally; they are
//! recomputed from the task state, which keeps
//! `success + failure == end - start` true by construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::operation::OperationKind;
use crate::state::TaskState;

/// Client-side timing of a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkTiming {
    pub init_time: DateTime<Utc>,
    pub ack_time: DateTime<Utc>,
}

impl SdkTiming {
    /// Starts timing now; finish with [`ack`](Self::ack).
    pub fn start() -> Self {
        let now = Utc::now();
        Self {
            init_time: now,
            ack_time: now,
        }
    }

    pub fn ack(mut self) -> Self {
        self.ack_time = Utc::now();
        self
    }

    /// Elapsed time in milliseconds.
    pub fn latency_ms(&self) -> i64 {
        (self.ack_time - self.init_time).num_milliseconds()
    }
}

/// Outcome of the latest retry of a failed offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetriedResult {
    /// `true` if the retry succeeded.
    pub status: bool,
    /// Attempts made so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    pub init_time: DateTime<Utc>,
    pub ack_time: DateTime<Utc>,
}

/// One failed offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDocument {
    pub offset: u64,
    pub key: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    pub timing: SdkTiming,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetriedResult>,
}

/// A sub-range that failed as a whole (backend unreachable, pool saturated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub start: u64,
    pub end: u64,
    pub error: String,
    pub timing: SdkTiming,
}

/// Failure records of one category, keyed by offset.
pub type OffsetLedger = BTreeMap<u64, FailedDocument>;

/// Serializes `category -> offset -> record` as `category -> [record]`.
mod offset_ledger {
    use std::collections::BTreeMap;

    use serde::ser::{Serialize, Serializer};
    use serde::{Deserialize, Deserializer};

    use super::{FailedDocument, OffsetLedger};

    struct Records<'a>(&'a OffsetLedger);

    impl Serialize for Records<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(self.0.values())
        }
    }

    pub fn serialize<S: Serializer>(
        ledger: &BTreeMap<String, OffsetLedger>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(ledger.iter().map(|(category, records)| (category, Records(records))))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, OffsetLedger>, D::Error> {
        let raw = BTreeMap::<String, Vec<FailedDocument>>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(category, records)| {
                let records = records.into_iter().map(|f| (f.offset, f)).collect();
                (category, records)
            })
            .collect())
    }
}

/// Persisted result of one task, keyed by its result seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub result_seed: String,
    pub operation: OperationKind,
    pub start: u64,
    pub end: u64,
    pub success: u64,
    pub failure: u64,
    #[serde(default, with = "offset_ledger")]
    pub failures: BTreeMap<String, OffsetLedger>,
    #[serde(default)]
    pub bulk_errors: BTreeMap<String, Vec<BulkFailure>>,
    #[serde(default, with = "offset_ledger")]
    pub retried_errors: BTreeMap<String, OffsetLedger>,
    pub updated_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn new(result_seed: impl Into<String>, operation: OperationKind, start: u64, end: u64) -> Self {
        Self {
            result_seed: result_seed.into(),
            operation,
            start,
            end,
            success: 0,
            failure: 0,
            failures: BTreeMap::new(),
            bulk_errors: BTreeMap::new(),
            retried_errors: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Records a per-offset failure, replacing any earlier entry for the same
    /// offset in that category.
    pub fn record_failure(&mut self, category: &str, failed: FailedDocument) {
        self.failures
            .entry(category.to_string())
            .or_default()
            .insert(failed.offset, failed);
    }

    pub fn record_bulk_failure(&mut self, category: &str, failure: BulkFailure) {
        self.bulk_errors
            .entry(category.to_string())
            .or_default()
            .push(failure);
    }

    /// Every category with per-offset or whole-batch failures, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self
            .failures
            .keys()
            .chain(self.bulk_errors.keys())
            .cloned()
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Offsets recorded under `category`, per-offset and whole-batch alike.
    pub fn offsets_for(&self, category: &str) -> Vec<u64> {
        let mut offsets: Vec<u64> = self
            .failures
            .get(category)
            .into_iter()
            .flat_map(|entries| entries.keys().copied())
            .chain(
                self.bulk_errors
                    .get(category)
                    .into_iter()
                    .flatten()
                    .flat_map(|b| b.start..b.end),
            )
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }

    /// Drops `category` from every ledger and returns the affected offsets.
    pub fn remove_category(&mut self, category: &str) -> Vec<u64> {
        let offsets = self.offsets_for(category);
        self.failures.remove(category);
        self.bulk_errors.remove(category);
        self.retried_errors.remove(category);
        offsets
    }

    /// Converts whole-batch failures of `category` into per-offset entries so
    /// each offset can be retried on its own.
    pub fn expand_bulk_failures<F>(&mut self, category: &str, key_for: F)
    where
        F: Fn(u64) -> String,
    {
        let Some(bulk) = self.bulk_errors.remove(category) else {
            return;
        };
        for failure in bulk {
            for offset in failure.start..failure.end {
                self.record_failure(
                    category,
                    FailedDocument {
                        offset,
                        key: key_for(offset),
                        error: failure.error.clone(),
                        extra: Map::new(),
                        timing: failure.timing,
                        retry: None,
                    },
                );
            }
        }
    }

    /// Stores the outcome of a retry. A successful retry moves the failure
    /// into `retried_errors`; a failed one stays put with updated retry info.
    ///
    /// Attempt counts accumulate across retry passes.
    pub fn apply_retry(&mut self, category: &str, offset: u64, mut retry: RetriedResult) {
        let Some(entries) = self.failures.get_mut(category) else {
            return;
        };
        let Some(failed) = entries.get_mut(&offset) else {
            return;
        };
        if let Some(previous) = &failed.retry {
            retry.attempts += previous.attempts;
        }
        if !retry.status {
            failed.retry = Some(retry);
            return;
        }
        let Some(mut failed) = entries.remove(&offset) else {
            return;
        };
        if entries.is_empty() {
            self.failures.remove(category);
        }
        failed.retry = Some(retry);
        self.retried_errors
            .entry(category.to_string())
            .or_default()
            .insert(offset, failed);
    }

    /// Number of failure records per category.
    pub fn failures_by_category(&self) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = self
            .failures
            .iter()
            .map(|(category, entries)| (category.clone(), entries.len() as u64))
            .collect();
        for (category, bulk) in &self.bulk_errors {
            let offsets: u64 = bulk.iter().map(|b| b.end.saturating_sub(b.start)).sum();
            *counts.entry(category.clone()).or_default() += offsets;
        }
        counts
    }

    /// Number of offsets recovered by retries.
    pub fn retried_count(&self) -> u64 {
        self.retried_errors.values().map(|v| v.len() as u64).sum()
    }

    /// Recomputes `success` and `failure` from the task state.
    pub fn recompute_counts(&mut self, state: &TaskState) {
        let total = self.end.saturating_sub(self.start);
        self.success = state.completed_in(self.start, self.end);
        self.failure = total - self.success;
        self.updated_at = Utc::now();
    }
}

/// Shared, lock-guarded handle to a [`TaskResult`].
///
/// The lock is held only for the duration of one ledger update.
#[derive(Debug, Clone)]
pub struct ResultRecorder {
    inner: Arc<Mutex<TaskResult>>,
}

impl ResultRecorder {
    pub fn new(result: TaskResult) -> Self {
        Self {
            inner: Arc::new(Mutex::new(result)),
        }
    }

    pub fn record_failure(&self, category: &str, failed: FailedDocument) {
        self.inner.lock().record_failure(category, failed);
    }

    pub fn record_bulk_failure(&self, category: &str, failure: BulkFailure) {
        self.inner.lock().record_bulk_failure(category, failure);
    }

    pub fn apply_retry(&self, category: &str, offset: u64, retry: RetriedResult) {
        self.inner.lock().apply_retry(category, offset, retry);
    }

    /// Runs `f` with exclusive access to the result.
    pub fn with<R>(&self, f: impl FnOnce(&mut TaskResult) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn snapshot(&self) -> TaskResult {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OffsetStatus;
    use pretty_assertions::assert_eq;

    fn failed(offset: u64, error: &str) -> FailedDocument {
        FailedDocument {
            offset,
            key: format!("k{offset}"),
            error: error.to_string(),
            extra: Map::new(),
            timing: SdkTiming::start().ack(),
            retry: None,
        }
    }

    fn retried(status: bool) -> RetriedResult {
        let timing = SdkTiming::start().ack();
        RetriedResult {
            status,
            attempts: 1,
            error: None,
            extra: Map::new(),
            init_time: timing.init_time,
            ack_time: timing.ack_time,
        }
    }

    #[test]
    fn test_record_failure_deduplicates_by_offset() {
        let mut result = TaskResult::new("r", OperationKind::Create, 0, 10);
        result.record_failure("timeout", failed(1, "first"));
        result.record_failure("timeout", failed(1, "second"));
        result.record_failure("timeout", failed(2, "x"));
        let entries = &result.failures["timeout"];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&1].error, "second");
    }

    #[test]
    fn test_successful_retry_moves_to_retried_ledger() {
        let mut result = TaskResult::new("r", OperationKind::Create, 0, 10);
        result.record_failure("documentExists", failed(5, "exists"));
        result.apply_retry("documentExists", 5, retried(true));
        assert!(!result.failures.contains_key("documentExists"));
        let moved = &result.retried_errors["documentExists"][&5];
        assert_eq!(moved.offset, 5);
        assert_eq!(moved.error, "exists");
        assert!(moved.retry.as_ref().unwrap().status);
        assert_eq!(result.retried_count(), 1);
    }

    #[test]
    fn test_failed_retry_stays_in_failures() {
        let mut result = TaskResult::new("r", OperationKind::Create, 0, 10);
        result.record_failure("timeout", failed(3, "t"));
        result.apply_retry("timeout", 3, retried(false));
        result.apply_retry("timeout", 3, retried(false));
        assert_eq!(result.failures["timeout"].len(), 1);
        let retry = result.failures["timeout"][&3].retry.as_ref().unwrap();
        assert_eq!(retry.attempts, 2);
        assert!(!retry.status);
        assert!(result.retried_errors.is_empty());
    }

    #[test]
    fn test_bulk_failures_expand_and_remove() {
        let mut result = TaskResult::new("r", OperationKind::BulkCreate, 0, 10);
        let timing = SdkTiming::start().ack();
        result.record_bulk_failure(
            "connectionFailed",
            BulkFailure {
                start: 2,
                end: 5,
                error: "down".to_string(),
                timing,
            },
        );
        assert_eq!(result.offsets_for("connectionFailed"), vec![2, 3, 4]);
        assert_eq!(result.failures_by_category()["connectionFailed"], 3);

        result.expand_bulk_failures("connectionFailed", |o| format!("key-{o}"));
        assert!(result.bulk_errors.is_empty());
        assert_eq!(result.failures["connectionFailed"][&3].key, "key-3");

        assert_eq!(result.remove_category("connectionFailed"), vec![2, 3, 4]);
        assert!(result.categories().is_empty());
    }

    #[test]
    fn test_counts_cover_whole_range() {
        let mut result = TaskResult::new("r", OperationKind::Create, 10, 20);
        let mut state = TaskState::new();
        for offset in 10..17 {
            state.apply(offset, OffsetStatus::Completed);
        }
        state.apply(17, OffsetStatus::Err);
        result.recompute_counts(&state);
        assert_eq!(result.success, 7);
        assert_eq!(result.failure, 3);
        assert_eq!(result.success + result.failure, 10);
    }

    #[test]
    fn test_result_json_shape() {
        let mut result = TaskResult::new("seed", OperationKind::SubDocUpsert, 0, 1);
        result.record_failure("timeout", failed(0, "t"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["resultSeed"], "seed");
        assert_eq!(json["operation"], "sub-doc-upsert");
        assert_eq!(json["failures"]["timeout"][0]["key"], "k0");
        assert!(json["failures"]["timeout"][0]["timing"]["initTime"].is_string());

        let back: TaskResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_large_bulk_failure_expands_and_retries_in_log_time() {
        const OFFSETS: u64 = 200_000;
        let mut result = TaskResult::new("r", OperationKind::BulkCreate, 0, OFFSETS);
        result.record_bulk_failure(
            "connectionFailed",
            BulkFailure {
                start: 0,
                end: OFFSETS,
                error: "down".to_string(),
                timing: SdkTiming::start().ack(),
            },
        );

        let started = std::time::Instant::now();
        result.expand_bulk_failures("connectionFailed", |o| format!("k{o}"));
        assert_eq!(result.failures["connectionFailed"].len() as u64, OFFSETS);
        for offset in (0..OFFSETS).rev() {
            result.apply_retry("connectionFailed", offset, retried(offset % 2 == 0));
        }

        assert_eq!(result.retried_count(), OFFSETS / 2);
        assert_eq!(result.failures_by_category()["connectionFailed"], OFFSETS / 2);
        assert!(result.failures["connectionFailed"].keys().all(|o| o % 2 == 1));
        // A linear scan per offset would take minutes here.
        assert!(started.elapsed() < std::time::Duration::from_secs(30));
    }
}
