//! Transactional catalog of tables and indexes.
//!
//! Index-set mutations (create entry, flag promotion, swap, drop) buffer
//! per transaction and apply atomically at commit, so other sessions see
//! either none or all of a transaction's catalog work. A transaction
//! reads committed state overlaid with its own pending operations, in
//! order — a later operation of the same transaction observes earlier
//! renames, which is what lets batched swaps reuse temporary names.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use harrier_common::error::CatalogError;
use harrier_common::types::{IndexSpec, RelationId, RelationKind, TxnId};
use parking_lot::Mutex;

use crate::index::IndexStore;
use crate::invalidation::InvalidationBus;

/// A table (or toast table, or materialized view) known to the catalog.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub id: RelationId,
    pub name: String,
    pub kind: RelationKind,
    pub toast: Option<RelationId>,
    pub indexes: Vec<RelationId>,
}

/// One index's catalog row.
///
/// Flag invariants: `ready ⇒ live` and `valid ⇒ ready`. Flags only move
/// forward, except the explicit mark-dead step which demotes all three
/// just before deletion.
#[derive(Debug, Clone)]
pub struct IndexCatalogEntry {
    pub id: RelationId,
    pub table: RelationId,
    pub name: String,
    pub spec: IndexSpec,
    /// The entry exists and writers may maintain it.
    pub live: bool,
    /// Writers must maintain it (it is in the write-path index set).
    pub ready: bool,
    /// Readers may use it.
    pub valid: bool,
    /// Partition hierarchy link, when this index belongs to a partition.
    pub parent: Option<RelationId>,
}

impl IndexCatalogEntry {
    fn check_flags(&self) -> Result<(), CatalogError> {
        if self.ready && !self.live {
            return Err(CatalogError::FlagInvariant {
                index: self.id,
                detail: "ready requires live".into(),
            });
        }
        if self.valid && !self.ready {
            return Err(CatalogError::FlagInvariant {
                index: self.id,
                detail: "valid requires ready".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum CatalogOp {
    CreateIndex(IndexCatalogEntry),
    SetReady(RelationId),
    SetValid(RelationId),
    MarkDead(RelationId),
    Swap { old: RelationId, new: RelationId },
    DropIndex(RelationId),
}

struct CatalogState {
    tables: HashMap<RelationId, TableEntry>,
    indexes: HashMap<RelationId, IndexCatalogEntry>,
    pending: HashMap<TxnId, Vec<CatalogOp>>,
}

pub struct CatalogStore {
    next_id: AtomicU64,
    state: Mutex<CatalogState>,
    bus: Arc<InvalidationBus>,
    structures: Arc<IndexStore>,
}

impl CatalogStore {
    pub fn new(bus: Arc<InvalidationBus>, structures: Arc<IndexStore>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(CatalogState {
                tables: HashMap::new(),
                indexes: HashMap::new(),
                pending: HashMap::new(),
            }),
            bus,
            structures,
        }
    }

    fn alloc_id(&self) -> RelationId {
        RelationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    // ── Tables (bootstrap DDL, applied immediately) ──────────────────

    pub fn create_table(&self, name: &str, kind: RelationKind) -> Result<RelationId, CatalogError> {
        let mut state = self.state.lock();
        if Self::name_in_use(&state, name) {
            return Err(CatalogError::DuplicateName(name.into()));
        }
        let id = self.alloc_id();
        state.tables.insert(
            id,
            TableEntry {
                id,
                name: name.into(),
                kind,
                toast: None,
                indexes: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Create a table together with its toast table.
    pub fn create_table_with_toast(
        &self,
        name: &str,
    ) -> Result<(RelationId, RelationId), CatalogError> {
        let table = self.create_table(name, RelationKind::Table)?;
        let toast = self.create_table(
            &format!("toast_{}", name),
            RelationKind::Toast { owner: table },
        )?;
        let mut state = self.state.lock();
        if let Some(t) = state.tables.get_mut(&table) {
            t.toast = Some(toast);
        }
        Ok((table, toast))
    }

    pub fn table(&self, id: RelationId) -> Option<TableEntry> {
        self.state.lock().tables.get(&id).cloned()
    }

    fn name_in_use(state: &CatalogState, name: &str) -> bool {
        state.tables.values().any(|t| t.name == name)
            || state.indexes.values().any(|i| i.name == name)
            || state
                .pending
                .values()
                .flatten()
                .any(|op| matches!(op, CatalogOp::CreateIndex(e) if e.name == name))
    }

    // ── Transactional reads ──────────────────────────────────────────

    /// The index entry as seen by `txn` (committed state overlaid with
    /// that transaction's own pending operations).
    pub fn index_entry(&self, id: RelationId, txn: Option<TxnId>) -> Option<IndexCatalogEntry> {
        let state = self.state.lock();
        let view = Self::overlay(&state, txn);
        view.get(&id).cloned()
    }

    /// All index entries of `table` as seen by `txn`, in creation order.
    pub fn indexes_of(&self, table: RelationId, txn: Option<TxnId>) -> Vec<IndexCatalogEntry> {
        let state = self.state.lock();
        let view = Self::overlay(&state, txn);
        let mut out: Vec<IndexCatalogEntry> =
            view.into_values().filter(|e| e.table == table).collect();
        out.sort_by_key(|e| e.id);
        out
    }

    fn overlay(
        state: &CatalogState,
        txn: Option<TxnId>,
    ) -> HashMap<RelationId, IndexCatalogEntry> {
        let mut view = state.indexes.clone();
        if let Some(xid) = txn {
            if let Some(ops) = state.pending.get(&xid) {
                for op in ops {
                    // Overlay replay of already-validated ops cannot fail.
                    let _ = Self::apply_to_indexes(&mut view, op);
                }
            }
        }
        view
    }

    // ── Transactional writes (buffered until commit) ─────────────────

    /// Create a new index entry with all flags false. Visible only to
    /// `txn` until it commits.
    pub fn create_index_entry(
        &self,
        txn: TxnId,
        table: RelationId,
        name: &str,
        spec: IndexSpec,
        parent: Option<RelationId>,
    ) -> Result<RelationId, CatalogError> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(&table) {
            return Err(CatalogError::RelationNotFound(table));
        }
        if Self::name_in_use(&state, name) {
            return Err(CatalogError::DuplicateName(name.into()));
        }
        let id = self.alloc_id();
        let entry = IndexCatalogEntry {
            id,
            table,
            name: name.into(),
            spec,
            live: false,
            ready: false,
            valid: false,
            parent,
        };
        state
            .pending
            .entry(txn)
            .or_default()
            .push(CatalogOp::CreateIndex(entry));
        Ok(id)
    }

    pub fn set_ready(&self, txn: TxnId, index: RelationId) -> Result<(), CatalogError> {
        self.buffer_op(txn, CatalogOp::SetReady(index))
    }

    pub fn set_valid(&self, txn: TxnId, index: RelationId) -> Result<(), CatalogError> {
        self.buffer_op(txn, CatalogOp::SetValid(index))
    }

    /// Demote an index to dead: writers stop maintaining it and readers
    /// never consult it. The only flag regression in the protocol,
    /// taken just before deletion.
    pub fn mark_dead(&self, txn: TxnId, index: RelationId) -> Result<(), CatalogError> {
        self.buffer_op(txn, CatalogOp::MarkDead(index))
    }

    /// Atomically exchange the names (and hierarchy links) of a rebuilt
    /// pair, clearing `valid` on the old entry in the same step so at no
    /// observable instant the logical name has zero or two valid indexes.
    pub fn swap_identities(
        &self,
        txn: TxnId,
        old: RelationId,
        new: RelationId,
    ) -> Result<(), CatalogError> {
        self.buffer_op(txn, CatalogOp::Swap { old, new })
    }

    pub fn drop_index(&self, txn: TxnId, index: RelationId) -> Result<(), CatalogError> {
        self.buffer_op(txn, CatalogOp::DropIndex(index))
    }

    /// Validate `op` against the transaction's overlay view, then buffer it.
    fn buffer_op(&self, txn: TxnId, op: CatalogOp) -> Result<(), CatalogError> {
        let mut state = self.state.lock();
        let mut view = Self::overlay(&state, Some(txn));
        Self::apply_to_indexes(&mut view, &op)?;
        state.pending.entry(txn).or_default().push(op);
        Ok(())
    }

    // ── Commit / abort ───────────────────────────────────────────────

    /// Apply a transaction's pending catalog operations. Emits one
    /// relcache invalidation per affected table after the state change.
    pub fn commit_txn(&self, txn: TxnId) -> Result<(), CatalogError> {
        let mut affected: Vec<RelationId> = Vec::new();
        let mut dropped: Vec<RelationId> = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(ops) = state.pending.remove(&txn) else {
                return Ok(());
            };
            for op in &ops {
                let table = Self::apply_committed(&mut state, op)?;
                if !affected.contains(&table) {
                    affected.push(table);
                }
                if let CatalogOp::DropIndex(id) = op {
                    dropped.push(*id);
                }
            }
        }
        for index in dropped {
            self.structures.remove(index);
        }
        for table in affected {
            self.bus.invalidate(table);
        }
        Ok(())
    }

    /// Discard a transaction's pending catalog operations.
    pub fn abort_txn(&self, txn: TxnId) {
        self.state.lock().pending.remove(&txn);
    }

    /// Apply one op to committed state, returning the affected table.
    /// Ops apply in buffered order, so a flag promotion following a
    /// create in the same transaction finds its entry already present.
    fn apply_committed(
        state: &mut CatalogState,
        op: &CatalogOp,
    ) -> Result<RelationId, CatalogError> {
        let table = match op {
            CatalogOp::CreateIndex(e) => e.table,
            CatalogOp::SetReady(id)
            | CatalogOp::SetValid(id)
            | CatalogOp::MarkDead(id)
            | CatalogOp::DropIndex(id) => state
                .indexes
                .get(id)
                .map(|e| e.table)
                .ok_or(CatalogError::IndexNotFound(*id))?,
            CatalogOp::Swap { old, .. } => state
                .indexes
                .get(old)
                .map(|e| e.table)
                .ok_or(CatalogError::IndexNotFound(*old))?,
        };
        Self::apply_to_indexes(&mut state.indexes, op)?;
        match op {
            CatalogOp::CreateIndex(e) => {
                state
                    .tables
                    .get_mut(&e.table)
                    .ok_or(CatalogError::RelationNotFound(e.table))?
                    .indexes
                    .push(e.id);
            }
            CatalogOp::DropIndex(id) => {
                if let Some(t) = state.tables.get_mut(&table) {
                    t.indexes.retain(|i| i != id);
                }
            }
            _ => {}
        }
        Ok(table)
    }

    fn apply_to_indexes(
        view: &mut HashMap<RelationId, IndexCatalogEntry>,
        op: &CatalogOp,
    ) -> Result<(), CatalogError> {
        match op {
            CatalogOp::CreateIndex(e) => {
                view.insert(e.id, e.clone());
                Ok(())
            }
            CatalogOp::SetReady(id) => {
                let e = view.get_mut(id).ok_or(CatalogError::IndexNotFound(*id))?;
                e.live = true;
                e.ready = true;
                e.check_flags()
            }
            CatalogOp::SetValid(id) => {
                let e = view.get_mut(id).ok_or(CatalogError::IndexNotFound(*id))?;
                if !e.ready {
                    return Err(CatalogError::FlagInvariant {
                        index: *id,
                        detail: "cannot mark valid before ready".into(),
                    });
                }
                e.valid = true;
                e.check_flags()
            }
            CatalogOp::MarkDead(id) => {
                let e = view.get_mut(id).ok_or(CatalogError::IndexNotFound(*id))?;
                e.live = false;
                e.ready = false;
                e.valid = false;
                Ok(())
            }
            CatalogOp::Swap { old, new } => {
                if !view.contains_key(new) {
                    return Err(CatalogError::IndexNotFound(*new));
                }
                let old_entry = view.get(old).ok_or(CatalogError::IndexNotFound(*old))?;
                if !view[new].valid {
                    return Err(CatalogError::FlagInvariant {
                        index: *new,
                        detail: "cannot swap in a shadow index that is not valid".into(),
                    });
                }
                let old_name = old_entry.name.clone();
                let old_parent = old_entry.parent;
                let new_name = view[new].name.clone();
                let new_parent = view[new].parent;
                {
                    let e = view.get_mut(old).ok_or(CatalogError::IndexNotFound(*old))?;
                    e.name = new_name;
                    e.parent = new_parent;
                    e.valid = false;
                }
                {
                    let e = view.get_mut(new).ok_or(CatalogError::IndexNotFound(*new))?;
                    e.name = old_name;
                    e.parent = old_parent;
                }
                Ok(())
            }
            CatalogOp::DropIndex(id) => {
                view.remove(id).ok_or(CatalogError::IndexNotFound(*id))?;
                Ok(())
            }
        }
    }
}
