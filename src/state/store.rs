//! File-based persistence for task state, results and request snapshots.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/task_state/<result_seed>.json   completed/err offset sets
//! <root>/results/<result_seed>.json      failure ledger
//! <root>/requests/<request_id>.json      metadata map and task descriptors
//! ```
//!
//! Writes go to a temporary file in the target directory and are renamed into
//! place, so a crash mid-write leaves the previous snapshot intact. Files are
//! compact JSON; state files can hold millions of offsets.
//!
//! Every method here does blocking file I/O. Async callers go through
//! [`StateStore::spawn_blocking`].

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::TaskState;
use crate::error::LoaderError;
use crate::request::RequestSnapshot;
use crate::result::TaskResult;

const STATE_DIR: &str = "task_state";
const RESULTS_DIR: &str = "results";
const REQUESTS_DIR: &str = "requests";

/// Root directory holding every persisted file of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LoaderError> {
        let root = root.into();
        for dir in [STATE_DIR, RESULTS_DIR, REQUESTS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|source| LoaderError::Persistence {
                path: path.clone(),
                source,
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self, result_seed: &str) -> PathBuf {
        self.root.join(STATE_DIR).join(format!("{result_seed}.json"))
    }

    pub fn result_path(&self, result_seed: &str) -> PathBuf {
        self.root.join(RESULTS_DIR).join(format!("{result_seed}.json"))
    }

    pub fn request_path(&self, request_id: &str) -> PathBuf {
        self.root.join(REQUESTS_DIR).join(format!("{request_id}.json"))
    }

    pub fn save_state(&self, result_seed: &str, state: &TaskState) -> Result<(), LoaderError> {
        write_json(&self.state_path(result_seed), state)
    }

    /// Loads a task state; `None` if the task never checkpointed.
    pub fn load_state(&self, result_seed: &str) -> Result<Option<TaskState>, LoaderError> {
        read_json(&self.state_path(result_seed))
    }

    pub fn save_result(&self, result: &TaskResult) -> Result<(), LoaderError> {
        write_json(&self.result_path(&result.result_seed), result)
    }

    pub fn load_result(&self, result_seed: &str) -> Result<Option<TaskResult>, LoaderError> {
        read_json(&self.result_path(result_seed))
    }

    pub fn save_request(&self, snapshot: &RequestSnapshot) -> Result<(), LoaderError> {
        write_json(&self.request_path(&snapshot.id), snapshot)
    }

    pub fn load_request(&self, request_id: &str) -> Result<Option<RequestSnapshot>, LoaderError> {
        read_json(&self.request_path(request_id))
    }

    /// Runs `f` against this store on tokio's blocking pool.
    pub async fn spawn_blocking<T, F>(&self, f: F) -> Result<T, LoaderError>
    where
        F: FnOnce(&StateStore) -> Result<T, LoaderError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| LoaderError::Persistence {
                path: self.root.clone(),
                source: std::io::Error::other(e),
            })?
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LoaderError> {
    let persistence = |source| LoaderError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec(value).map_err(|source| LoaderError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(persistence)?;
    tmp.write_all(&json).map_err(persistence)?;
    tmp.as_file().sync_all().map_err(persistence)?;
    tmp.persist(path).map_err(|e| persistence(e.error))?;
    debug!(path = %path.display(), bytes = json.len(), "persisted snapshot");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, LoaderError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LoaderError::Persistence {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| LoaderError::Serialization {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OffsetStatus;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut state = TaskState::new();
        state.apply(1, OffsetStatus::Completed);
        state.apply(2, OffsetStatus::Err);
        store.save_state("abc", &state).unwrap();

        let reopened = StateStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_state("abc").unwrap(), Some(state));
    }

    #[test]
    fn test_missing_files_load_as_none() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.load_state("nope").unwrap(), None);
        assert!(store.load_result("nope").unwrap().is_none());
        assert!(store.load_request("nope").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_serialization_error() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        fs::write(store.state_path("bad"), b"{not json").unwrap();
        let err = store.load_state("bad").unwrap_err();
        assert!(matches!(err, LoaderError::Serialization { .. }));
    }

    #[test]
    fn test_state_file_is_compact() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut state = TaskState::new();
        for offset in 0..1_000 {
            state.apply(offset, OffsetStatus::Completed);
        }
        store.save_state("big", &state).unwrap();
        let raw = fs::read_to_string(store.state_path("big")).unwrap();
        assert!(!raw.contains('\n'));
        assert!(!raw.contains(", "));
    }

    #[tokio::test]
    async fn test_spawn_blocking_round_trips_through_the_store() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut state = TaskState::new();
        state.apply(9, OffsetStatus::Err);
        let expected = state.clone();

        store
            .spawn_blocking(move |store| store.save_state("bg", &state))
            .await
            .unwrap();
        let loaded = store
            .spawn_blocking(|store| store.load_state("bg"))
            .await
            .unwrap();
        assert_eq!(loaded, Some(expected));
    }

    #[test]
    fn test_overwrite_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut state = TaskState::new();
        state.apply(1, OffsetStatus::Err);
        store.save_state("t", &state).unwrap();
        state.apply(1, OffsetStatus::Completed);
        store.save_state("t", &state).unwrap();
        let loaded = store.load_state("t").unwrap().unwrap();
        assert!(loaded.err.is_empty());
        assert!(loaded.completed.contains(&1));
    }
}
