//! Per-task offset state.
//!
//! An offset is `Unknown` until an executor reports it, then either
//! `Completed` or `Err`. Within a pass the transition is terminal; the retry
//! pipeline may later move `Err` to `Completed`, never the reverse.
//!
//! [`TaskState`] holds the two sets. It is mutated only by the aggregator in
//! [`tracker`]; [`store`] persists snapshots of it.

pub mod store;
pub mod tracker;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use store::StateStore;
pub use tracker::{Checkpoint, StateSender, StateTracker};

/// Terminal status of an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OffsetStatus {
    Completed,
    Err,
}

/// Completed and errored offsets of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub completed: BTreeSet<u64>,
    pub err: BTreeSet<u64>,
}

impl TaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a status event, returning `true` if the state changed.
    ///
    /// `Err` for a completed offset is dropped.
    pub fn apply(&mut self, offset: u64, status: OffsetStatus) -> bool {
        match status {
            OffsetStatus::Completed => {
                let was_err = self.err.remove(&offset);
                self.completed.insert(offset) || was_err
            }
            OffsetStatus::Err => {
                if self.completed.contains(&offset) {
                    return false;
                }
                self.err.insert(offset)
            }
        }
    }

    /// Current status of `offset`, `None` while unknown.
    pub fn status(&self, offset: u64) -> Option<OffsetStatus> {
        if self.completed.contains(&offset) {
            Some(OffsetStatus::Completed)
        } else if self.err.contains(&offset) {
            Some(OffsetStatus::Err)
        } else {
            None
        }
    }

    /// Returns `true` if the offset has reached a terminal status.
    pub fn is_terminal(&self, offset: u64) -> bool {
        self.status(offset).is_some()
    }

    /// Number of completed offsets inside `[start, end)`.
    pub fn completed_in(&self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        self.completed.range(start..end).count() as u64
    }

    /// Offsets inside `[start, end)` that have no terminal status.
    pub fn unknown_in(&self, start: u64, end: u64) -> Vec<u64> {
        (start..end).filter(|o| !self.is_terminal(*o)).collect()
    }

    /// Total number of terminal offsets.
    pub fn len(&self) -> usize {
        self.completed.len() + self.err.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.err.is_empty()
    }
}
