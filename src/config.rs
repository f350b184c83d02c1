//! Operation and engine configuration.
//!
//! [`OperationConfig`] is the immutable per-task parameter set: document and
//! key sizing, template, offset range, mutable fields and the exception
//! policy. [`EngineSettings`] holds engine-wide tunables (thread fan-out, bulk
//! sizing, pool capacity, retry concurrency) and can be overlaid from
//! `DOCLOADER_*` environment variables.
//!
//! # Example TOML
//!
//! ```toml
//! doc_size = 512
//! key_prefix = "user-"
//! template = "person"
//! start = 0
//! end = 1000
//! fields_to_change = ["email", "age"]
//!
//! [exceptions]
//! ignore_exceptions = ["timeout"]
//! retry_exceptions = ["documentExists"]
//! retry_attempts = 2
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LoaderError;

/// Default document size in bytes.
pub const DEFAULT_DOC_SIZE: usize = 1024;

/// Default key length.
pub const DEFAULT_KEY_SIZE: usize = 20;

/// Default size of a generated sub-document value.
pub const DEFAULT_SUB_DOC_SIZE: usize = 64;

/// Default document template name.
pub const DEFAULT_TEMPLATE: &str = "person";

/// Largest document the engine will generate (20 MiB).
pub const MAX_DOC_SIZE: usize = 20 * 1024 * 1024;

/// Exception policy applied after the main execution pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exceptions {
    /// Categories whose failed offsets are treated as completed and dropped
    /// from the result.
    pub ignore_exceptions: Vec<String>,
    /// Categories to re-execute. Empty means every category present.
    pub retry_exceptions: Vec<String>,
    /// Attempts per failed offset. Zero disables retries inside a task run.
    pub retry_attempts: u32,
}

impl Exceptions {
    /// Returns `true` if `category` is in the ignore list.
    pub fn ignores(&self, category: &str) -> bool {
        self.ignore_exceptions.iter().any(|c| c == category)
    }
}

/// Immutable per-task operation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Target document size in bytes.
    pub doc_size: usize,
    /// Target key length; the numeric part of a key is zero-padded to reach it.
    pub key_size: usize,
    pub key_prefix: String,
    pub key_suffix: String,
    /// Name of the document template.
    pub template: String,
    /// First offset (inclusive).
    pub start: u64,
    /// Last offset (exclusive).
    pub end: u64,
    /// Fields rewritten by update operations. Empty means every mutable field.
    pub fields_to_change: Vec<String>,
    /// Size of each generated sub-document value.
    pub sub_doc_size: usize,
    /// Documents per backend bulk call, overriding the engine default.
    pub bulk_batch_size: Option<usize>,
    pub exceptions: Exceptions,
}

impl OperationConfig {
    /// Convenience constructor for a range with every other field defaulted.
    pub fn with_range(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    /// Number of offsets in `[start, end)`.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `offset` lies in `[start, end)`.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Validates the configuration and fills defaults for zero values.
    ///
    /// Checks:
    /// - `start <= end`
    /// - `doc_size` does not exceed [`MAX_DOC_SIZE`]
    /// - `bulk_batch_size`, when set, is positive
    pub fn validate(&mut self) -> Result<(), LoaderError> {
        if self.start > self.end {
            return Err(LoaderError::config(format!(
                "invalid offset range: start {} is greater than end {}",
                self.start, self.end
            )));
        }
        if self.doc_size == 0 {
            self.doc_size = DEFAULT_DOC_SIZE;
        }
        if self.doc_size > MAX_DOC_SIZE {
            return Err(LoaderError::config(format!(
                "doc_size {} exceeds the {MAX_DOC_SIZE} byte limit",
                self.doc_size
            )));
        }
        if self.key_size == 0 {
            self.key_size = DEFAULT_KEY_SIZE;
        }
        if self.sub_doc_size == 0 {
            self.sub_doc_size = DEFAULT_SUB_DOC_SIZE;
        }
        if self.template.trim().is_empty() {
            self.template = DEFAULT_TEMPLATE.to_string();
        }
        if self.bulk_batch_size == Some(0) {
            return Err(LoaderError::config(
                "bulk_batch_size must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

/// Engine-wide tunables shared by every task of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Number of sub-batches a task range is split into.
    pub max_threads: usize,
    /// Documents per bulk call when the operation does not override it.
    pub default_bulk_batch_size: usize,
    /// Concurrent sub-batches the shared worker pool accepts.
    pub pool_size: usize,
    /// Submission attempts before a sub-batch is recorded as failed.
    pub submit_retry_attempts: u32,
    /// Fixed wait between submission attempts (ms).
    pub submit_backoff_ms: u64,
    /// Concurrent single-offset retries in the exception pipeline.
    pub retry_concurrency: usize,
    /// Capacity of the offset status channel.
    pub state_channel_capacity: usize,
    /// Interval between state checkpoints while a task runs (ms).
    pub checkpoint_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_threads: 8,
            default_bulk_batch_size: 100,
            pool_size: 64,
            submit_retry_attempts: 30,
            submit_backoff_ms: 200,
            retry_concurrency: 10,
            state_channel_capacity: 10_000,
            checkpoint_interval_ms: 5_000,
        }
    }
}

impl EngineSettings {
    /// Builds settings from defaults overlaid with `DOCLOADER_*` variables.
    pub fn from_env() -> Result<Self, LoaderError> {
        let mut settings = Self::default();
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Overlays values from an environment lookup function.
    ///
    /// Recognized variables: `DOCLOADER_MAX_THREADS`,
    /// `DOCLOADER_BULK_BATCH_SIZE`, `DOCLOADER_POOL_SIZE`,
    /// `DOCLOADER_SUBMIT_RETRIES`, `DOCLOADER_SUBMIT_BACKOFF_MS`,
    /// `DOCLOADER_RETRY_CONCURRENCY`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), LoaderError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "DOCLOADER_MAX_THREADS")? {
            self.max_threads = v;
        }
        if let Some(v) = parse_env(&lookup, "DOCLOADER_BULK_BATCH_SIZE")? {
            self.default_bulk_batch_size = v;
        }
        if let Some(v) = parse_env(&lookup, "DOCLOADER_POOL_SIZE")? {
            self.pool_size = v;
        }
        if let Some(v) = parse_env(&lookup, "DOCLOADER_SUBMIT_RETRIES")? {
            self.submit_retry_attempts = v;
        }
        if let Some(v) = parse_env(&lookup, "DOCLOADER_SUBMIT_BACKOFF_MS")? {
            self.submit_backoff_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "DOCLOADER_RETRY_CONCURRENCY")? {
            self.retry_concurrency = v;
        }
        self.validate()
    }

    /// Rejects zero values for sizes that must be positive.
    pub fn validate(&self) -> Result<(), LoaderError> {
        let positive = [
            ("max_threads", self.max_threads),
            ("default_bulk_batch_size", self.default_bulk_batch_size),
            ("pool_size", self.pool_size),
            ("retry_concurrency", self.retry_concurrency),
            ("state_channel_capacity", self.state_channel_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LoaderError::config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }

    /// Converts `submit_backoff_ms` to a [`Duration`].
    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    /// Converts `checkpoint_interval_ms` to a [`Duration`].
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

fn parse_env<F, T>(lookup: &F, name: &str) -> Result<Option<T>, LoaderError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            LoaderError::config(format!("{name}={raw:?} is not a valid number"))
        }),
    }
}
