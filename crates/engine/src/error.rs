use cardgraph_core::{CoreError, EntityKind, ValidationFailure};
use cardgraph_storage::StorageError;
use thiserror::Error;

use crate::jobs::JobKind;
use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("validation failed: {} invalid field(s)", .0.len())]
    Validation(Vec<ValidationFailure>),

    /// The durable write failed. Pending changes are left in their scopes.
    #[error("commit failed: {0}")]
    CommitFailure(#[source] StorageError),

    #[error("unresolved reference in record {record_id}: {field} -> {target}")]
    UnresolvedReference {
        record_id: String,
        field: &'static str,
        target: String,
    },

    #[error("remote failure: {0}")]
    Remote(#[from] RemoteError),

    #[error("a {0} job is already running")]
    ConcurrentJobRejected(JobKind),

    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),

    #[error("entity {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: String,
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
