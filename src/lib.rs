//! # docloader
//!
//! Deterministic data loading and correctness verification against pluggable
//! database backends.
//!
//! A task takes an offset range `[start, end)` and an [`OperationKind`],
//! derives a key per offset from its collection's seed, regenerates each
//! document from a seeded template, and applies the operation through the
//! [`Database`] contract. Per-offset outcomes land in a durable
//! [`TaskState`]; failures are classified by exception category in a
//! [`TaskResult`] and can be ignored or retried by policy. A task can be
//! rerun later against only its unresolved offsets.
//!
//! ```no_run
//! use std::sync::Arc;
//! use docloader::{
//!     ConnectionInfo, EngineSettings, LoadTask, OperationConfig, OperationKind, Request,
//!     StateStore, TaskSpec,
//! };
//!
//! # async fn demo() -> Result<(), docloader::LoaderError> {
//! let store = StateStore::open("./docloader-state")?;
//! let request = Arc::new(Request::new(store, EngineSettings::from_env()?));
//!
//! let task = LoadTask::configure(
//!     request.clone(),
//!     TaskSpec {
//!         operation: OperationKind::Create,
//!         db_type: "memory".into(),
//!         connection: ConnectionInfo::new("memory://local"),
//!         extras: Default::default(),
//!         config: OperationConfig::with_range(0, 10_000),
//!         seed: None,
//!     },
//! )
//! .await?;
//! let summary = task.run().await?;
//! assert_eq!(summary.success + summary.failure, 10_000);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod generator;
pub mod key;
pub mod metadata;
pub mod operation;
pub mod request;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;

pub use config::{EngineSettings, Exceptions, OperationConfig};
pub use db::{ConnectionInfo, ConnectionManager, Database, Extras, InMemoryDatabase};
pub use error::{DbError, GeneratorError, LoaderError};
pub use generator::{Template, TemplateRegistry};
pub use metadata::{CollectionIdentifier, CollectionMetadata};
pub use operation::OperationKind;
pub use request::{Request, RequestSnapshot, TaskDescriptor};
pub use result::{ResultRecorder, TaskResult};
pub use state::{StateStore, TaskState};
pub use task::{LoadTask, TaskSpec, TaskSummary};
