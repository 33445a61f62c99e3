//! Engine wiring and the session-facing DML surface.
//!
//! `Engine` owns one instance of every shared service and hands out
//! sessions. DML here is deliberately small: enough insert, delete and
//! scan machinery for writers to race the DDL protocols and for scans to
//! check what an index answers against what the heap answers.

use std::sync::Arc;

use harrier_common::config::HarrierConfig;
use harrier_common::error::{CatalogError, DdlError, HarrierError, HarrierResult, TxnError};
use harrier_common::types::{LockMode, LockScope, LockTag, RelationId, Row, TxnId};
use harrier_storage::heap::XidStatus;
use harrier_storage::{
    CatalogStore, HeapBuilder, HeapStore, IndexStore, InvalidationBus, PhysicalBuilder, RowId,
};
use harrier_txn::{LockManager, Session, SnapshotTracker, TxnManager};

use crate::create_index::ConcurrentIndexBuilder;
use crate::progress::DdlProgressRegistry;
use crate::reindex::{ReindexConcurrentCoordinator, ReindexTarget};
use crate::waiter::{map_lock, OlderSnapshotWaiter};

pub struct Engine {
    config: HarrierConfig,
    bus: Arc<InvalidationBus>,
    structures: Arc<IndexStore>,
    catalog: Arc<CatalogStore>,
    locks: Arc<LockManager>,
    txns: Arc<TxnManager>,
    snapshots: Arc<SnapshotTracker>,
    heap: Arc<HeapStore>,
    builder: Arc<dyn PhysicalBuilder>,
    progress: Arc<DdlProgressRegistry>,
}

impl Engine {
    pub fn new(config: HarrierConfig) -> Arc<Self> {
        let bus = Arc::new(InvalidationBus::new());
        let structures = Arc::new(IndexStore::new());
        let catalog = Arc::new(CatalogStore::new(bus.clone(), structures.clone()));
        let locks = Arc::new(LockManager::new(config.ddl.clone()));
        let txns = Arc::new(TxnManager::new(catalog.clone(), locks.clone()));
        let snapshots = Arc::new(SnapshotTracker::new(txns.clone()));
        let heap = Arc::new(HeapStore::new(
            catalog.clone(),
            structures.clone(),
            txns.clone() as Arc<dyn XidStatus>,
        ));
        let builder: Arc<dyn PhysicalBuilder> =
            Arc::new(HeapBuilder::new(heap.clone(), structures.clone()));
        let progress = Arc::new(DdlProgressRegistry::new(config.ddl.progress_history));
        Arc::new(Self {
            config,
            bus,
            structures,
            catalog,
            locks,
            txns,
            snapshots,
            heap,
            builder,
            progress,
        })
    }

    pub fn config(&self) -> &HarrierConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<CatalogStore> {
        &self.catalog
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    pub fn snapshots(&self) -> &Arc<SnapshotTracker> {
        &self.snapshots
    }

    pub fn heap(&self) -> &Arc<HeapStore> {
        &self.heap
    }

    pub fn structures(&self) -> &Arc<IndexStore> {
        &self.structures
    }

    pub fn invalidations(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    pub fn progress(&self) -> &Arc<DdlProgressRegistry> {
        &self.progress
    }

    /// The production physical builder. DDL entry points take this unless
    /// the caller substitutes another implementation.
    pub fn default_builder(&self) -> Arc<dyn PhysicalBuilder> {
        self.builder.clone()
    }

    pub fn waiter(&self) -> OlderSnapshotWaiter {
        OlderSnapshotWaiter::new(
            self.txns.clone(),
            self.locks.clone(),
            self.snapshots.clone(),
            self.config.ddl.wait_poll(),
        )
    }

    pub fn new_session(&self) -> Arc<Session> {
        self.txns.new_session()
    }

    pub fn new_vacuum_session(&self) -> Arc<Session> {
        self.txns.new_vacuum_session()
    }

    // ── DDL entry points ─────────────────────────────────────────────

    /// CREATE INDEX CONCURRENTLY with the engine's default builder.
    pub fn create_index_concurrently(
        self: &Arc<Self>,
        session: &Session,
        table: RelationId,
        name: &str,
        spec: harrier_common::types::IndexSpec,
    ) -> Result<RelationId, DdlError> {
        ConcurrentIndexBuilder::new(self).build_concurrently(session, table, name, spec)
    }

    /// REINDEX CONCURRENTLY with the engine's default builder.
    pub fn reindex_concurrently(
        self: &Arc<Self>,
        session: &Session,
        target: ReindexTarget,
    ) -> Result<bool, DdlError> {
        ReindexConcurrentCoordinator::new(self).rebuild_concurrently(session, target)
    }

    // ── DDL outside the concurrent protocols ─────────────────────────

    /// Create a table together with its toast table and empty heaps.
    pub fn create_table(&self, name: &str) -> HarrierResult<RelationId> {
        let (table, toast) = self.catalog.create_table_with_toast(name)?;
        self.heap.create(table);
        self.heap.create(toast);
        Ok(table)
    }

    /// Plain `DROP INDEX`: takes an exclusive lock on the owning table and
    /// deletes the entry. Runs in the caller's transaction when one is
    /// open, otherwise in its own.
    pub fn drop_index(&self, session: &Session, index: RelationId) -> Result<(), DdlError> {
        let owns_txn = session.current_xid().is_none();
        if owns_txn {
            self.txns.begin(session)?;
        }
        let result = self.drop_index_locked(session, index);
        if owns_txn {
            match &result {
                Ok(()) => self.txns.commit(session)?,
                Err(_) => self.txns.abort(session)?,
            }
        }
        result
    }

    fn drop_index_locked(&self, session: &Session, index: RelationId) -> Result<(), DdlError> {
        let xid = current_xid(session)?;
        let entry = self
            .catalog
            .index_entry(index, Some(xid))
            .ok_or(CatalogError::IndexNotFound(index))?;
        self.locks
            .acquire(
                session,
                LockTag(entry.table),
                LockMode::AccessExclusive,
                LockScope::Transaction,
            )
            .map_err(map_lock)?;
        self.catalog.drop_index(xid, index)?;
        Ok(())
    }

    // ── DML ──────────────────────────────────────────────────────────

    /// Insert a row in the session's open transaction, maintaining every
    /// ready index of the table.
    pub fn insert(&self, session: &Session, table: RelationId, row: Row) -> HarrierResult<RowId> {
        let xid = current_xid(session)?;
        self.locks.acquire(
            session,
            LockTag(table),
            LockMode::RowExclusive,
            LockScope::Transaction,
        )?;
        Ok(self.heap.insert(xid, table, row)?)
    }

    /// Delete a row in the session's open transaction.
    pub fn delete(&self, session: &Session, table: RelationId, row: RowId) -> HarrierResult<()> {
        let xid = current_xid(session)?;
        self.locks.acquire(
            session,
            LockTag(table),
            LockMode::RowExclusive,
            LockScope::Transaction,
        )?;
        Ok(self.heap.delete(xid, table, row)?)
    }

    /// Full table scan under a fresh snapshot, in row-id order.
    pub fn seq_scan(&self, session: &Session, table: RelationId) -> HarrierResult<Vec<Row>> {
        current_xid(session)?;
        self.locks.acquire(
            session,
            LockTag(table),
            LockMode::AccessShare,
            LockScope::Transaction,
        )?;
        let snapshot = self.snapshots.take(session)?;
        let rows = self.heap.scan_visible(table, &snapshot)?;
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// Scan every entry of a valid index under a fresh snapshot, resolving
    /// entries against heap visibility. Rejects indexes readers must not
    /// use.
    pub fn index_scan(&self, session: &Session, index: RelationId) -> HarrierResult<Vec<Row>> {
        current_xid(session)?;
        let entry = self
            .catalog
            .index_entry(index, session.current_xid())
            .ok_or(CatalogError::IndexNotFound(index))?;
        if !entry.valid {
            return Err(HarrierError::Internal(format!(
                "index {} is not valid for reads",
                entry.name
            )));
        }
        self.locks.acquire(
            session,
            LockTag(entry.table),
            LockMode::AccessShare,
            LockScope::Transaction,
        )?;
        let snapshot = self.snapshots.take(session)?;
        let visible: std::collections::HashMap<RowId, Row> = self
            .heap
            .scan_visible(entry.table, &snapshot)?
            .into_iter()
            .collect();
        let mut rows = Vec::new();
        for (_, row_id) in self.structures.scan_all(index) {
            if let Some(row) = visible.get(&row_id) {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }
}

/// The xid of the session's open transaction, or the error every DML and
/// catalog mutation path reports when none is open.
pub(crate) fn current_xid(session: &Session) -> Result<TxnId, TxnError> {
    session.current_xid().ok_or(TxnError::NoActiveTransaction)
}
