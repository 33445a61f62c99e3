use thiserror::Error;

use crate::types::{RelationId, TxnId};

/// Convenience alias for `Result<T, HarrierError>`.
pub type HarrierResult<T> = Result<T, HarrierError>;

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum HarrierError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Index build error: {0}")]
    Build(#[from] BuildError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Catalog layer errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Relation not found: {0}")]
    RelationNotFound(RelationId),

    #[error("Index not found: {0}")]
    IndexNotFound(RelationId),

    #[error("Relation name already in use: {0}")]
    DuplicateName(String),

    #[error("Index flag invariant violated on {index}: {detail}")]
    FlagInvariant { index: RelationId, detail: String },

    #[error("{relation} is not an index")]
    NotAnIndex { relation: RelationId },

    #[error("{relation} is not a table")]
    NotATable { relation: RelationId },
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("No transaction is active on this session")]
    NoActiveTransaction,

    #[error("A transaction is already active on this session: {0}")]
    AlreadyActive(TxnId),

    #[error("Transaction not found: {0}")]
    NotFound(TxnId),

    #[error("Transaction {0} has already completed")]
    AlreadyCompleted(TxnId),

    #[error("Commit failed, transaction aborted: {0}")]
    CommitFailed(String),
}

/// Lock manager errors.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out waiting for {mode} lock on {tag} (held by {holders} conflicting transactions)")]
    Timeout {
        tag: crate::types::LockTag,
        mode: crate::types::LockMode,
        holders: usize,
    },

    #[error("Lock wait cancelled")]
    Cancelled,
}

/// Physical index build errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Unique constraint violation in index {index}: duplicate key {key_debug}")]
    UniqueViolation { index: RelationId, key_debug: String },

    #[error("Index structure missing for {0}")]
    StructureMissing(RelationId),

    #[error("Heap missing for table {0}")]
    HeapMissing(RelationId),

    #[error("Build failed: {0}")]
    Failed(String),
}

/// Errors surfaced by the concurrent DDL protocols.
///
/// The `Display` text carries the recovery guidance the invoking session
/// needs: whether a retry, a manual `DROP INDEX`, or a reindex is required.
#[derive(Error, Debug)]
pub enum DdlError {
    #[error("Invalid index definition: {0}")]
    Validation(String),

    #[error("Lock conflict: {0}; no catalog change was made, retry when the conflicting transaction ends")]
    LockConflict(#[from] LockError),

    /// The physical build failed after the catalog entry became visible.
    /// The orphaned entry must be dropped before retrying.
    #[error("Index build failed for {index}: {source}; the invalid index must be dropped before retrying")]
    BuildFailure {
        index: RelationId,
        #[source]
        source: BuildError,
    },

    /// The run was interrupted after one or more index pairs were already
    /// swapped. Every swapped pair is fully valid; only the retired old
    /// indexes remain to be dropped, which a re-run performs.
    #[error("Rebuild interrupted after swap: {detail}; old indexes {pending:?} remain and can be dropped or re-reindexed")]
    PartialRebuild {
        detail: String,
        pending: Vec<RelationId>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cannot run concurrently: {0}")]
    Unsupported(String),

    #[error("Catalog error during DDL: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Transaction error during DDL: {0}")]
    Txn(#[from] TxnError),

    #[error("Internal DDL error: {0}")]
    Internal(String),
}

impl DdlError {
    /// Whether this error left durable state behind (an orphaned or
    /// half-retired index) that the caller must clean up explicitly.
    pub fn leaves_residue(&self) -> bool {
        matches!(
            self,
            DdlError::BuildFailure { .. } | DdlError::PartialRebuild { .. }
        )
    }
}
