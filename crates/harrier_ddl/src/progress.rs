//! Progress tracking for concurrent DDL operations.
//!
//! The registry does not execute anything; the coordinators report phase
//! transitions into it so other sessions can observe what a long-running
//! build or rebuild is currently doing, and which targets it skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use harrier_common::types::RelationId;

/// Current phase of a concurrent DDL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlPhase {
    /// Registered but no catalog change made yet.
    Pending,
    /// Bulk build of new index contents is in progress.
    Building,
    /// Catch-up validation and snapshot waits are in progress.
    Validating,
    /// Rebuilt pairs are being swapped into place.
    Swapping,
    /// Old indexes are being retired and dropped.
    Retiring,
    /// The operation finished successfully.
    Completed,
    /// The operation failed or was cancelled.
    Failed,
}

impl std::fmt::Display for DdlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DdlPhase::Pending => write!(f, "pending"),
            DdlPhase::Building => write!(f, "building"),
            DdlPhase::Validating => write!(f, "validating"),
            DdlPhase::Swapping => write!(f, "swapping"),
            DdlPhase::Retiring => write!(f, "retiring"),
            DdlPhase::Completed => write!(f, "completed"),
            DdlPhase::Failed => write!(f, "failed"),
        }
    }
}

/// The kind of operation being tracked.
#[derive(Debug, Clone)]
pub enum DdlOpKind {
    CreateIndexConcurrently { index_name: String },
    ReindexTableConcurrently { table_name: String },
    ReindexIndexConcurrently { index_name: String },
}

impl std::fmt::Display for DdlOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DdlOpKind::CreateIndexConcurrently { index_name } => {
                write!(f, "CREATE INDEX CONCURRENTLY {}", index_name)
            }
            DdlOpKind::ReindexTableConcurrently { table_name } => {
                write!(f, "REINDEX TABLE CONCURRENTLY {}", table_name)
            }
            DdlOpKind::ReindexIndexConcurrently { index_name } => {
                write!(f, "REINDEX INDEX CONCURRENTLY {}", index_name)
            }
        }
    }
}

/// A tracked concurrent DDL operation.
#[derive(Debug, Clone)]
pub struct DdlOperation {
    pub id: u64,
    pub kind: DdlOpKind,
    pub phase: DdlPhase,
    pub relation: RelationId,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
    /// Rows written by build and catch-up passes.
    pub rows_written: u64,
    /// Human-readable per-target remarks, e.g. skipped invalid indexes.
    pub notes: Vec<String>,
    /// Error message if phase == Failed.
    pub error: Option<String>,
}

impl DdlOperation {
    fn new(id: u64, relation: RelationId, kind: DdlOpKind) -> Self {
        Self {
            id,
            kind,
            phase: DdlPhase::Pending,
            relation,
            started_at: Instant::now(),
            completed_at: None,
            rows_written: 0,
            notes: Vec::new(),
            error: None,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_millis() as u64
    }
}

/// Registry of in-flight and recently completed concurrent DDL operations.
pub struct DdlProgressRegistry {
    next_id: AtomicU64,
    operations: Mutex<HashMap<u64, DdlOperation>>,
    /// Completed/failed operations retained for status queries.
    max_history: usize,
}

impl DdlProgressRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            operations: Mutex::new(HashMap::new()),
            max_history,
        }
    }

    /// Register a new operation. Returns its id.
    pub fn register(&self, relation: RelationId, kind: DdlOpKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut ops = self.operations.lock();
        ops.insert(id, DdlOperation::new(id, relation, kind));
        self.gc_completed(&mut ops);
        id
    }

    pub fn set_phase(&self, id: u64, phase: DdlPhase) {
        if let Some(op) = self.operations.lock().get_mut(&id) {
            op.phase = phase;
        }
    }

    pub fn record_rows(&self, id: u64, rows: u64) {
        if let Some(op) = self.operations.lock().get_mut(&id) {
            op.rows_written += rows;
        }
    }

    /// Attach a per-target remark, e.g. a skipped invalid index.
    pub fn note(&self, id: u64, note: String) {
        if let Some(op) = self.operations.lock().get_mut(&id) {
            op.notes.push(note);
        }
    }

    pub fn complete(&self, id: u64) {
        if let Some(op) = self.operations.lock().get_mut(&id) {
            op.phase = DdlPhase::Completed;
            op.completed_at = Some(Instant::now());
            tracing::info!(
                "ddl #{} completed: {} ({} rows, {}ms)",
                id,
                op.kind,
                op.rows_written,
                op.elapsed_ms()
            );
        }
    }

    pub fn fail(&self, id: u64, error: String) {
        if let Some(op) = self.operations.lock().get_mut(&id) {
            op.phase = DdlPhase::Failed;
            op.error = Some(error.clone());
            op.completed_at = Some(Instant::now());
            tracing::warn!("ddl #{} failed: {}: {}", id, op.kind, error);
        }
    }

    pub fn get(&self, id: u64) -> Option<DdlOperation> {
        self.operations.lock().get(&id).cloned()
    }

    /// Operations that are neither completed nor failed.
    pub fn list_active(&self) -> Vec<DdlOperation> {
        self.operations
            .lock()
            .values()
            .filter(|op| op.phase != DdlPhase::Completed && op.phase != DdlPhase::Failed)
            .cloned()
            .collect()
    }

    /// Evict the oldest finished operations beyond the history limit.
    fn gc_completed(&self, ops: &mut HashMap<u64, DdlOperation>) {
        let mut finished: Vec<(u64, Instant)> = ops
            .values()
            .filter_map(|op| op.completed_at.map(|at| (op.id, at)))
            .collect();
        if finished.len() <= self.max_history {
            return;
        }
        finished.sort_by_key(|(_, at)| *at);
        let excess = finished.len() - self.max_history;
        for (id, _) in finished.into_iter().take(excess) {
            ops.remove(&id);
        }
    }
}
