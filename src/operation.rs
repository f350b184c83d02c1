//! Operation kinds supported by the executor.
//!
//! The `kebab-case` names are the wire names used in TOML plans, persisted
//! descriptors and result files.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{
    LoaderError, DOCUMENT_EXISTS, DOCUMENT_NOT_FOUND, PATH_EXISTS, PATH_NOT_FOUND,
};

/// A document or sub-document operation, single or bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Create,
    Update,
    Read,
    Delete,
    Touch,
    Validate,
    SubDocInsert,
    SubDocUpsert,
    SubDocReplace,
    SubDocRead,
    SubDocDelete,
    BulkCreate,
    BulkUpdate,
    BulkRead,
    BulkDelete,
    BulkTouch,
    BulkValidate,
}

impl OperationKind {
    /// All kinds, in declaration order.
    pub const ALL: [OperationKind; 17] = [
        Self::Create,
        Self::Update,
        Self::Read,
        Self::Delete,
        Self::Touch,
        Self::Validate,
        Self::SubDocInsert,
        Self::SubDocUpsert,
        Self::SubDocReplace,
        Self::SubDocRead,
        Self::SubDocDelete,
        Self::BulkCreate,
        Self::BulkUpdate,
        Self::BulkRead,
        Self::BulkDelete,
        Self::BulkTouch,
        Self::BulkValidate,
    ];

    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Read => "read",
            Self::Delete => "delete",
            Self::Touch => "touch",
            Self::Validate => "validate",
            Self::SubDocInsert => "sub-doc-insert",
            Self::SubDocUpsert => "sub-doc-upsert",
            Self::SubDocReplace => "sub-doc-replace",
            Self::SubDocRead => "sub-doc-read",
            Self::SubDocDelete => "sub-doc-delete",
            Self::BulkCreate => "bulk-create",
            Self::BulkUpdate => "bulk-update",
            Self::BulkRead => "bulk-read",
            Self::BulkDelete => "bulk-delete",
            Self::BulkTouch => "bulk-touch",
            Self::BulkValidate => "bulk-validate",
        }
    }

    /// Returns `true` for kinds that batch several documents per backend call.
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            Self::BulkCreate
                | Self::BulkUpdate
                | Self::BulkRead
                | Self::BulkDelete
                | Self::BulkTouch
                | Self::BulkValidate
        )
    }

    /// Returns `true` for sub-document kinds.
    pub fn is_sub_doc(&self) -> bool {
        matches!(
            self,
            Self::SubDocInsert
                | Self::SubDocUpsert
                | Self::SubDocReplace
                | Self::SubDocRead
                | Self::SubDocDelete
        )
    }

    /// Returns `true` when the executor must rebuild the current document
    /// state by replaying earlier mutations before acting.
    pub fn needs_replay(&self) -> bool {
        matches!(
            self,
            Self::Update | Self::BulkUpdate | Self::Validate | Self::BulkValidate
        )
    }

    /// Returns `true` when tasks of this kind mutate documents in a way later
    /// tasks must replay to know the current document.
    pub fn is_replay_source(&self) -> bool {
        matches!(self, Self::Update | Self::BulkUpdate | Self::SubDocUpsert)
    }

    /// Maps a bulk kind to the single-document kind used for per-offset retries.
    pub fn single_counterpart(&self) -> OperationKind {
        match self {
            Self::BulkCreate => Self::Create,
            Self::BulkUpdate => Self::Update,
            Self::BulkRead => Self::Read,
            Self::BulkDelete => Self::Delete,
            Self::BulkTouch => Self::Touch,
            Self::BulkValidate => Self::Validate,
            other => *other,
        }
    }

    /// Returns the exception category that a re-run of this kind treats as a
    /// successful no-op, if any.
    ///
    /// A re-run insert that finds the document already present, or a re-run
    /// delete that finds it already gone, reached the intended end state.
    pub fn idempotent_category(&self) -> Option<&'static str> {
        match self.single_counterpart() {
            Self::Create => Some(DOCUMENT_EXISTS),
            Self::Delete => Some(DOCUMENT_NOT_FOUND),
            Self::SubDocInsert => Some(PATH_EXISTS),
            Self::SubDocDelete => Some(PATH_NOT_FOUND),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| LoaderError::UnknownOperation {
                operation: s.to_string(),
            })
    }
}
