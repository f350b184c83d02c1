//! Single-writer offset state aggregator.
//!
//! Executors never touch [`TaskState`] directly. They send
//! `{offset, status}` events through a bounded channel to one aggregator
//! task, which is the only writer of the shared state cell. Readers take a
//! read lock for point queries ([`StateTracker::check_offset_in_complete`]).
//!
//! The aggregator also checkpoints the state to the [`StateStore`] on a fixed
//! interval while events keep arriving, so an interrupted run can resume from
//! the last snapshot. The file write runs on the blocking pool; the
//! aggregator only clones the state and keeps draining events. At most one
//! checkpoint write is in flight, and it is awaited before the aggregator
//! exits so it can never land after the final save.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{OffsetStatus, StateStore, TaskState};

/// Message consumed by the aggregator.
#[derive(Debug)]
enum StateEvent {
    Status { offset: u64, status: OffsetStatus },
    /// Acknowledged once every earlier event has been applied.
    Flush(oneshot::Sender<()>),
    /// Stops accepting events; buffered events are still applied.
    Shutdown,
}

/// Periodic snapshot target.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub store: StateStore,
    pub result_seed: String,
    pub interval: Duration,
}

/// Cloneable producer handle given to executors.
#[derive(Debug, Clone)]
pub struct StateSender {
    tx: mpsc::Sender<StateEvent>,
}

impl StateSender {
    /// Reports a terminal status. Waits when the channel is full.
    ///
    /// Returns `false` if the aggregator has already shut down.
    pub async fn send(&self, offset: u64, status: OffsetStatus) -> bool {
        self.tx
            .send(StateEvent::Status { offset, status })
            .await
            .is_ok()
    }

    pub async fn completed(&self, offset: u64) -> bool {
        self.send(offset, OffsetStatus::Completed).await
    }

    pub async fn err(&self, offset: u64) -> bool {
        self.send(offset, OffsetStatus::Err).await
    }
}

/// Owner of the aggregator task and the shared state cell.
#[derive(Debug)]
pub struct StateTracker {
    sender: StateSender,
    state: Arc<RwLock<TaskState>>,
    handle: JoinHandle<()>,
}

impl StateTracker {
    /// Spawns the aggregator seeded with `initial` (a reloaded state, or empty).
    pub fn spawn(initial: TaskState, capacity: usize, checkpoint: Option<Checkpoint>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(RwLock::new(initial));
        let handle = tokio::spawn(state_aggregator(rx, state.clone(), checkpoint));
        Self {
            sender: StateSender { tx },
            state,
            handle,
        }
    }

    pub fn sender(&self) -> StateSender {
        self.sender.clone()
    }

    /// Returns `true` if `offset` is completed, as of the last applied event.
    pub fn check_offset_in_complete(&self, offset: u64) -> bool {
        self.state.read().completed.contains(&offset)
    }

    /// Returns `true` if `offset` is errored, as of the last applied event.
    pub fn check_offset_in_err(&self, offset: u64) -> bool {
        self.state.read().err.contains(&offset)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TaskState {
        self.state.read().clone()
    }

    /// Waits until every event sent before this call has been applied.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.tx.send(StateEvent::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stops the aggregator after draining buffered events and returns the
    /// final state.
    pub async fn finish(self) -> TaskState {
        let _ = self.sender.tx.send(StateEvent::Shutdown).await;
        drop(self.sender);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "state aggregator terminated abnormally");
        }
        let state = self.state.read().clone();
        state
    }
}

async fn state_aggregator(
    mut rx: mpsc::Receiver<StateEvent>,
    state: Arc<RwLock<TaskState>>,
    checkpoint: Option<Checkpoint>,
) {
    let period = checkpoint
        .as_ref()
        .map_or(Duration::from_secs(3600), |c| c.interval)
        .max(Duration::from_millis(10));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.reset();
    let checkpointing = checkpoint.is_some();
    let mut dirty = false;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;

            _ = tick.tick(), if checkpointing => {
                let busy = in_flight.as_ref().is_some_and(|write| !write.is_finished());
                if dirty && !busy {
                    if let Some(cp) = &checkpoint {
                        let snapshot = state.read().clone();
                        in_flight = Some(spawn_checkpoint(cp.clone(), snapshot));
                    }
                    dirty = false;
                }
            }
            event = rx.recv() => {
                match event {
                    Some(StateEvent::Status { offset, status }) => {
                        dirty |= state.write().apply(offset, status);
                    }
                    Some(StateEvent::Flush(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(StateEvent::Shutdown) => {
                        rx.close();
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(write) = in_flight {
        if let Err(e) = write.await {
            warn!(error = %e, "checkpoint write terminated abnormally");
        }
    }
}

fn spawn_checkpoint(checkpoint: Checkpoint, snapshot: TaskState) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        match checkpoint
            .store
            .save_state(&checkpoint.result_seed, &snapshot)
        {
            Ok(()) => debug!(
                result_seed = %checkpoint.result_seed,
                completed = snapshot.completed.len(),
                err = snapshot.err.len(),
                "checkpointed task state"
            ),
            Err(e) => warn!(
                result_seed = %checkpoint.result_seed,
                error = %e,
                "failed to checkpoint task state"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_concurrent_producers_lose_no_updates() {
        let tracker = StateTracker::spawn(TaskState::new(), 8, None);
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let tx = tracker.sender();
            handles.push(tokio::spawn(async move {
                for i in 0..250u64 {
                    let offset = worker * 250 + i;
                    let status = if offset % 10 == 0 {
                        OffsetStatus::Err
                    } else {
                        OffsetStatus::Completed
                    };
                    tx.send(offset, status).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let state = tracker.finish().await;
        assert_eq!(state.completed.len(), 900);
        assert_eq!(state.err.len(), 100);
    }

    #[tokio::test]
    async fn test_flush_makes_events_visible() {
        let tracker = StateTracker::spawn(TaskState::new(), 4, None);
        let tx = tracker.sender();
        tx.completed(3).await;
        tx.err(4).await;
        tracker.flush().await;
        assert!(tracker.check_offset_in_complete(3));
        assert!(tracker.check_offset_in_err(4));
        assert!(!tracker.check_offset_in_complete(4));

        tx.completed(4).await;
        tracker.flush().await;
        assert!(tracker.check_offset_in_complete(4));
        assert!(!tracker.check_offset_in_err(4));
    }

    #[tokio::test]
    async fn test_send_after_finish_is_rejected() {
        let tracker = StateTracker::spawn(TaskState::new(), 4, None);
        let tx = tracker.sender();
        tracker.finish().await;
        assert!(!tx.completed(1).await);
    }

    #[tokio::test]
    async fn test_periodic_checkpoint_writes_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let tracker = StateTracker::spawn(
            TaskState::new(),
            16,
            Some(Checkpoint {
                store: store.clone(),
                result_seed: "cp".to_string(),
                interval: Duration::from_millis(20),
            }),
        );
        let tx = tracker.sender();
        tx.completed(1).await;
        tx.err(2).await;

        let mut persisted = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.completed(3).await;
            if let Some(state) = store.load_state("cp").unwrap() {
                persisted = Some(state);
                break;
            }
        }
        let persisted = persisted.expect("checkpoint was never written");
        assert!(persisted.completed.contains(&1));
        assert!(persisted.err.contains(&2));
        tracker.finish().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producers_keep_draining_while_checkpointing() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let tracker = StateTracker::spawn(
            TaskState::new(),
            1,
            Some(Checkpoint {
                store: store.clone(),
                result_seed: "busy".to_string(),
                interval: Duration::from_millis(10),
            }),
        );
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let tx = tracker.sender();
            handles.push(tokio::spawn(async move {
                for i in 0..25_000u64 {
                    tx.completed(worker * 25_000 + i).await;
                    if i % 5_000 == 0 {
                        tokio::time::sleep(Duration::from_millis(15)).await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let state = tracker.finish().await;
        assert_eq!(state.completed.len(), 100_000);

        // Whatever checkpoint landed is a subset of the final state, and no
        // write lands once the aggregator has stopped.
        let persisted = store.load_state("busy").unwrap().unwrap_or_default();
        assert!(persisted.completed.is_subset(&state.completed));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = store.load_state("busy").unwrap().unwrap_or_default();
        assert_eq!(later, persisted);
    }

    #[tokio::test]
    async fn test_seeded_with_reloaded_state() {
        let mut initial = TaskState::new();
        initial.apply(7, OffsetStatus::Completed);
        let tracker = StateTracker::spawn(initial, 4, None);
        assert!(tracker.check_offset_in_complete(7));
        let tx = tracker.sender();
        tx.err(7).await;
        let state = tracker.finish().await;
        assert!(state.completed.contains(&7));
        assert!(state.err.is_empty());
    }
}
