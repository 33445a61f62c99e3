//! Core identifier and lock/snapshot types shared across the workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a relation: tables, toast tables, and indexes all draw
/// from the same id space, so a lock tag or a catalog link can refer to
/// any of them uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u64);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel#{}", self.0)
    }
}

/// Permanent transaction id (xid). Totally ordered; allocation order is
/// commit-visibility order for the snapshot machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// One backend (session) of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}

/// Ephemeral id of one in-flight transaction of one backend. Cheap to
/// wait on: a waiter only needs to know when the transaction ends, not
/// whether it committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualTxnId {
    pub backend: BackendId,
    pub local: u64,
}

impl fmt::Display for VirtualTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend, self.local)
    }
}

/// Relation lock modes, restricted to the modes the DDL protocol and the
/// write path actually take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Plain reads.
    AccessShare,
    /// DML writes (insert/update/delete).
    RowExclusive,
    /// Concurrent DDL: blocks other schema changes and vacuum, not DML.
    ShareUpdateExclusive,
    /// Blocks writers; the wait mode used between build phases.
    Share,
    /// Blocks everything; the wait mode used before retiring an index.
    AccessExclusive,
}

impl LockMode {
    /// Standard relation-lock conflict matrix restricted to the five
    /// modes above.
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (AccessShare, AccessExclusive) | (AccessExclusive, AccessShare) => true,
            (RowExclusive, Share)
            | (Share, RowExclusive)
            | (RowExclusive, AccessExclusive)
            | (AccessExclusive, RowExclusive) => true,
            (ShareUpdateExclusive, ShareUpdateExclusive)
            | (ShareUpdateExclusive, Share)
            | (Share, ShareUpdateExclusive)
            | (ShareUpdateExclusive, AccessExclusive)
            | (AccessExclusive, ShareUpdateExclusive) => true,
            (Share, AccessExclusive) | (AccessExclusive, Share) => true,
            (AccessExclusive, AccessExclusive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockMode::AccessShare => "AccessShare",
            LockMode::RowExclusive => "RowExclusive",
            LockMode::ShareUpdateExclusive => "ShareUpdateExclusive",
            LockMode::Share => "Share",
            LockMode::AccessExclusive => "AccessExclusive",
        };
        f.write_str(s)
    }
}

/// How long an acquired lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Released when the acquiring transaction ends.
    Transaction,
    /// Survives commits; released by the owning protocol's cleanup path.
    Session,
}

/// Lockable resource. Relation-scoped only; that is all the protocol needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag(pub RelationId);

impl fmt::Display for LockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}", self.0)
    }
}

/// A single column value. The DDL core does not need a full type system;
/// three variants are enough to exercise ordering, uniqueness, and
/// partial predicates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Datum {
    Null,
    Int64(i64),
    Text(String),
}

/// One heap tuple's values, positional by column ordinal.
pub type Row = Vec<Datum>;

/// An immutable visibility horizon.
///
/// A transaction id is *potentially* visible when it precedes `xmax` and
/// was not in flight when the snapshot was taken; whether it actually
/// committed is resolved against the transaction status table.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Oldest transaction that was still in flight at snapshot time.
    pub xmin: TxnId,
    /// First transaction id not yet assigned at snapshot time.
    pub xmax: TxnId,
    /// Transactions in flight at snapshot time.
    pub in_progress: Vec<TxnId>,
}

impl Snapshot {
    /// Whether `xid`'s effects can be visible under this snapshot,
    /// assuming `xid` committed.
    pub fn might_see(&self, xid: TxnId) -> bool {
        xid < self.xmax && !self.in_progress.contains(&xid)
    }
}

/// Kind of a relation, matched exhaustively wherever target indexes are
/// collected so that unsupported kinds are rejected rather than falling
/// through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Table,
    Toast { owner: RelationId },
    MaterializedView,
    Partitioned,
}

/// Partial-index predicate, pre-resolved by the (external) DDL frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexPredicate {
    NotNull(usize),
    Equals(usize, Datum),
}

impl IndexPredicate {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            IndexPredicate::NotNull(col) => {
                row.get(*col).map(|d| *d != Datum::Null).unwrap_or(false)
            }
            IndexPredicate::Equals(col, want) => row.get(*col).map(|d| d == want).unwrap_or(false),
        }
    }
}

/// One indexed column with its resolved operator class and collation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub column: usize,
    pub opclass: String,
    pub collation: String,
}

impl IndexColumn {
    /// Default btree opclass / collation, which is all the in-memory
    /// access method distinguishes.
    pub fn plain(column: usize) -> Self {
        Self {
            column,
            opclass: "btree_ops".into(),
            collation: "default".into(),
        }
    }
}

/// A validated index definition as produced by the external resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub predicate: Option<IndexPredicate>,
    pub access_method: String,
    pub options: Vec<(String, String)>,
    /// Exclusion-constraint indexes cannot be rebuilt concurrently.
    pub exclusion: bool,
}

impl IndexSpec {
    pub fn btree(columns: Vec<usize>) -> Self {
        Self {
            columns: columns.into_iter().map(IndexColumn::plain).collect(),
            unique: false,
            predicate: None,
            access_method: "btree".into(),
            options: Vec::new(),
            exclusion: false,
        }
    }

    pub fn unique_btree(columns: Vec<usize>) -> Self {
        Self {
            unique: true,
            ..Self::btree(columns)
        }
    }

    /// Extract this spec's key from a heap row.
    pub fn key_of(&self, row: &Row) -> Vec<Datum> {
        self.columns
            .iter()
            .map(|c| row.get(c.column).cloned().unwrap_or(Datum::Null))
            .collect()
    }

    /// Whether the row belongs in this index at all (partial predicate).
    pub fn covers(&self, row: &Row) -> bool {
        self.predicate.as_ref().map(|p| p.matches(row)).unwrap_or(true)
    }
}
