//! In-memory MVCC heap with write-path index maintenance.
//!
//! Rows carry the inserting xid (`xmin`) and, once deleted, the deleting
//! xid (`xmax`). Visibility is resolved against a snapshot plus the
//! transaction status source; nothing is physically removed on delete or
//! abort, so an aborted writer leaves only invisible residue.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use harrier_common::error::BuildError;
use harrier_common::types::{RelationId, Row, Snapshot, TxnId};
use parking_lot::Mutex;

use crate::catalog::CatalogStore;
use crate::index::IndexStore;

/// Commit-state oracle for xids, implemented by the transaction manager.
pub trait XidStatus: Send + Sync {
    fn is_committed(&self, xid: TxnId) -> bool;
    fn is_aborted(&self, xid: TxnId) -> bool;
}

/// Position of one tuple in its table's heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row#{}", self.0)
    }
}

struct HeapRow {
    data: Row,
    xmin: TxnId,
    xmax: Option<TxnId>,
}

struct TableHeap {
    rows: BTreeMap<RowId, HeapRow>,
    next_row: u64,
}

impl TableHeap {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_row: 1,
        }
    }
}

pub struct HeapStore {
    heaps: Mutex<HashMap<RelationId, TableHeap>>,
    catalog: Arc<CatalogStore>,
    structures: Arc<IndexStore>,
    status: Arc<dyn XidStatus>,
}

impl HeapStore {
    pub fn new(
        catalog: Arc<CatalogStore>,
        structures: Arc<IndexStore>,
        status: Arc<dyn XidStatus>,
    ) -> Self {
        Self {
            heaps: Mutex::new(HashMap::new()),
            catalog,
            structures,
            status,
        }
    }

    /// Create an empty heap for a new table.
    pub fn create(&self, table: RelationId) {
        self.heaps.lock().entry(table).or_insert_with(TableHeap::new);
    }

    /// Insert a row under `xid`, maintaining every committed live+ready
    /// index of the table. A unique violation aborts the statement; the
    /// half-inserted row is left behind but its xid never commits, so it
    /// stays invisible.
    pub fn insert(&self, xid: TxnId, table: RelationId, row: Row) -> Result<RowId, BuildError> {
        let row_id = {
            let mut heaps = self.heaps.lock();
            let heap = heaps.get_mut(&table).ok_or(BuildError::HeapMissing(table))?;
            let row_id = RowId(heap.next_row);
            heap.next_row += 1;
            heap.rows.insert(
                row_id,
                HeapRow {
                    data: row.clone(),
                    xmin: xid,
                    xmax: None,
                },
            );
            row_id
        };

        // Maintain the write-path index set: every committed index that is
        // live and ready. Not-yet-ready indexes are caught up later by the
        // validation pass; dead indexes are never touched again.
        for entry in self.catalog.indexes_of(table, None) {
            if !(entry.live && entry.ready) || !entry.spec.covers(&row) {
                continue;
            }
            let key = entry.spec.key_of(&row);
            self.structures
                .add_entry(entry.id, key, row_id, &|other| self.row_alive(table, other))?;
        }
        Ok(row_id)
    }

    /// Mark a row deleted by `xid`. Index entries are left in place; scans
    /// resolve them against heap visibility.
    pub fn delete(&self, xid: TxnId, table: RelationId, row: RowId) -> Result<(), BuildError> {
        let mut heaps = self.heaps.lock();
        let heap = heaps.get_mut(&table).ok_or(BuildError::HeapMissing(table))?;
        match heap.rows.get_mut(&row) {
            Some(r) if r.xmax.is_none() => {
                r.xmax = Some(xid);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(BuildError::Failed(format!("{} has no {}", table, row))),
        }
    }

    /// All rows visible under `snapshot`, in row-id order.
    pub fn scan_visible(
        &self,
        table: RelationId,
        snapshot: &Snapshot,
    ) -> Result<Vec<(RowId, Row)>, BuildError> {
        let heaps = self.heaps.lock();
        let heap = heaps.get(&table).ok_or(BuildError::HeapMissing(table))?;
        Ok(heap
            .rows
            .iter()
            .filter(|(_, r)| self.row_visible(r, snapshot))
            .map(|(id, r)| (*id, r.data.clone()))
            .collect())
    }

    /// Whether `row` is visible under `snapshot`.
    pub fn is_visible(&self, table: RelationId, row: RowId, snapshot: &Snapshot) -> bool {
        let heaps = self.heaps.lock();
        heaps
            .get(&table)
            .and_then(|h| h.rows.get(&row))
            .map(|r| self.row_visible(r, snapshot))
            .unwrap_or(false)
    }

    fn row_visible(&self, row: &HeapRow, snapshot: &Snapshot) -> bool {
        if !(snapshot.might_see(row.xmin) && self.status.is_committed(row.xmin)) {
            return false;
        }
        match row.xmax {
            None => true,
            Some(xmax) => !(snapshot.might_see(xmax) && self.status.is_committed(xmax)),
        }
    }

    /// Dirty liveness: the row's insert has not aborted and no delete of
    /// it has committed or is pending. Used for uniqueness conflicts,
    /// which must see uncommitted concurrent writers.
    pub fn row_alive(&self, table: RelationId, row: RowId) -> bool {
        let heaps = self.heaps.lock();
        let Some(r) = heaps.get(&table).and_then(|h| h.rows.get(&row)) else {
            return false;
        };
        if self.status.is_aborted(r.xmin) {
            return false;
        }
        match r.xmax {
            None => true,
            Some(xmax) => self.status.is_aborted(xmax),
        }
    }

    /// Total physical row count, visibility ignored.
    pub fn raw_len(&self, table: RelationId) -> usize {
        self.heaps
            .lock()
            .get(&table)
            .map(|h| h.rows.len())
            .unwrap_or(0)
    }
}
