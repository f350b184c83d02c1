//! Error types for the loading engine.
//!
//! Defines [`LoaderError`] for configuration, connection and persistence
//! failures that abort a task, and [`DbError`] for per-operation backend
//! failures that are classified and recorded without stopping the task.

use std::path::PathBuf;

/// Exception category for a document that already exists.
pub const DOCUMENT_EXISTS: &str = "documentExists";
/// Exception category for a document that does not exist.
pub const DOCUMENT_NOT_FOUND: &str = "documentNotFound";
/// Exception category for a sub-document path that already exists.
pub const PATH_EXISTS: &str = "pathExists";
/// Exception category for a sub-document path that does not exist.
pub const PATH_NOT_FOUND: &str = "pathNotFound";
/// Exception category for a request that exceeded its timeout.
pub const TIMEOUT: &str = "timeout";
/// Exception category for connection-level failures.
pub const CONNECTION_FAILED: &str = "connectionFailed";
/// Exception category for rejected credentials.
pub const AUTHENTICATION_FAILED: &str = "authenticationFailed";
/// Exception category for an operation the backend does not provide.
pub const UNSUPPORTED_OPERATION: &str = "unsupportedOperation";
/// Exception category for a read-back that did not match the expected document.
pub const VALIDATION_MISMATCH: &str = "validationMismatch";
/// Exception category for a sub-batch the worker pool never accepted.
pub const POOL_SATURATED: &str = "poolSaturated";
/// Exception category for a bulk call that returned no entry for a key.
pub const MISSING_BULK_RESULT: &str = "missingBulkResult";
/// Exception category for a template that failed to build a payload.
pub const GENERATOR_FAILED: &str = "generatorFailed";

/// Errors that abort task configuration or execution.
///
/// Per-offset failures never surface here; they are classified into
/// [`DbError`] categories and recorded in the task result.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// Semantic validation failure in an operation or engine configuration.
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// The requested backend type has no registered factory.
    #[error("Unknown database backend '{db_type}'")]
    UnknownBackend { db_type: String },

    /// The requested document template is not registered.
    #[error("Unknown document template '{template}'")]
    UnknownTemplate { template: String },

    /// The operation name does not map to a known operation kind.
    #[error("Unknown operation '{operation}'")]
    UnknownOperation { operation: String },

    /// Connecting to the backend failed at configuration time.
    #[error("Failed to connect to '{connection}': {source}")]
    Connection {
        connection: String,
        #[source]
        source: DbError,
    },

    /// Reading or writing a persisted state, result or request file failed.
    #[error("Failed to access '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted file did not decode, or a value could not be encoded.
    #[error("Failed to (de)serialize '{path}': {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No task with this result seed is known to the request or on disk.
    #[error("No task found for result seed '{result_seed}'")]
    UnknownResultSeed { result_seed: String },

    /// The request was cancelled before the task could start.
    #[error("Request '{request_id}' was cancelled")]
    Cancelled { request_id: String },
}

impl LoaderError {
    /// Shorthand for a [`LoaderError::ConfigValidation`] error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// A backend error for a single document (or a whole bulk call).
///
/// Each variant maps to a stable exception category through
/// [`exception_category`](DbError::exception_category). Ignore and retry
/// policies are expressed in terms of those category strings.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Insert of a key that is already present.
    #[error("document already exists: {key}")]
    DocumentExists { key: String },

    /// Read, update or delete of a key that is absent.
    #[error("document not found: {key}")]
    DocumentNotFound { key: String },

    /// Sub-document insert of a path that is already present.
    #[error("sub-document path already exists: {key}/{path}")]
    PathExists { key: String, path: String },

    /// Sub-document access to a path that is absent.
    #[error("sub-document path not found: {key}/{path}")]
    PathNotFound { key: String, path: String },

    /// The backend did not acknowledge the request in time.
    #[error("operation timed out")]
    Timeout,

    /// Connection-level failure (DNS, TCP, TLS, pool exhaustion inside the client).
    #[error("connection error: {message}")]
    ConnectionFailed { message: String },

    /// Credentials were missing or rejected.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The backend does not implement this operation.
    #[error("operation not supported by this backend: {operation}")]
    Unsupported { operation: String },

    /// Any other backend error, already classified by the adapter.
    #[error("{category}: {message}")]
    Backend { category: String, message: String },
}

impl DbError {
    /// Returns the normalized exception category used by ignore/retry policies.
    pub fn exception_category(&self) -> &str {
        match self {
            Self::DocumentExists { .. } => DOCUMENT_EXISTS,
            Self::DocumentNotFound { .. } => DOCUMENT_NOT_FOUND,
            Self::PathExists { .. } => PATH_EXISTS,
            Self::PathNotFound { .. } => PATH_NOT_FOUND,
            Self::Timeout => TIMEOUT,
            Self::ConnectionFailed { .. } => CONNECTION_FAILED,
            Self::AuthenticationFailed { .. } => AUTHENTICATION_FAILED,
            Self::Unsupported { .. } => UNSUPPORTED_OPERATION,
            Self::Backend { category, .. } => category,
        }
    }

    /// Builds an already-classified backend error.
    pub fn backend(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by document templates.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    /// A field listed for mutation does not exist on the template.
    #[error("template '{template}' has no mutable field '{field}'")]
    UnknownField { template: String, field: String },

    /// A document could not be decoded into the template's shape.
    #[error("document does not match template '{template}': {message}")]
    Malformed { template: String, message: String },
}

/// Errors returned when handing a sub-batch to the worker pool.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker slot is busy.
    #[error("worker pool saturated")]
    Saturated,

    /// The pool was shut down.
    #[error("worker pool closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_categories_are_stable() {
        let key = "k".to_string();
        assert_eq!(
            DbError::DocumentExists { key: key.clone() }.exception_category(),
            "documentExists"
        );
        assert_eq!(
            DbError::DocumentNotFound { key: key.clone() }.exception_category(),
            "documentNotFound"
        );
        assert_eq!(
            DbError::PathExists {
                key: key.clone(),
                path: "a.b".to_string()
            }
            .exception_category(),
            "pathExists"
        );
        assert_eq!(
            DbError::PathNotFound {
                key,
                path: "a.b".to_string()
            }
            .exception_category(),
            "pathNotFound"
        );
        assert_eq!(DbError::Timeout.exception_category(), "timeout");
    }

    #[test]
    fn test_backend_error_uses_its_own_category() {
        let err = DbError::backend("durabilityAmbiguous", "replica did not ack");
        assert_eq!(err.exception_category(), "durabilityAmbiguous");
        assert!(err.to_string().contains("replica did not ack"));
    }

    #[test]
    fn test_connection_error_wraps_db_error() {
        let err = LoaderError::Connection {
            connection: "memory://local".to_string(),
            source: DbError::ConnectionFailed {
                message: "refused".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("memory://local"));
        assert!(msg.contains("refused"));
    }
}
