//! Physical index structures and the bulk-build / catch-up paths.
//!
//! The access method is an in-memory ordered map; uniqueness is checked
//! against the *current* state of conflicting heap rows (a dirty check),
//! not against any one snapshot, because an insert must conflict with an
//! uncommitted concurrent insert of the same key.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use harrier_common::error::BuildError;
use harrier_common::types::{Datum, RelationId, Snapshot};
use parking_lot::Mutex;

use crate::catalog::IndexCatalogEntry;
use crate::heap::{HeapStore, RowId};

/// Key of one index entry: the indexed column values in column order.
pub type IndexKey = Vec<Datum>;

struct BtreeIndex {
    unique: bool,
    entries: BTreeMap<IndexKey, BTreeSet<RowId>>,
}

/// All physical index structures, keyed by the index's relation id.
pub struct IndexStore {
    inner: Mutex<HashMap<RelationId, BtreeIndex>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty structure for a new index. Replaces any leftover
    /// structure under the same id (a fresh id never has one).
    pub fn create(&self, index: RelationId, unique: bool) {
        self.inner.lock().insert(
            index,
            BtreeIndex {
                unique,
                entries: BTreeMap::new(),
            },
        );
    }

    /// Drop the physical structure of an index.
    pub fn remove(&self, index: RelationId) {
        self.inner.lock().remove(&index);
    }

    pub fn exists(&self, index: RelationId) -> bool {
        self.inner.lock().contains_key(&index)
    }

    pub fn contains(&self, index: RelationId, key: &IndexKey, row: RowId) -> bool {
        self.inner
            .lock()
            .get(&index)
            .and_then(|idx| idx.entries.get(key))
            .map(|rows| rows.contains(&row))
            .unwrap_or(false)
    }

    /// Insert one entry. For unique indexes the conflict check and the
    /// insert run under one lock acquisition: `alive` resolves whether a
    /// conflicting row id still counts, and no second writer can slip its
    /// own entry in between the check and the insert.
    pub fn add_entry(
        &self,
        index: RelationId,
        key: IndexKey,
        row: RowId,
        alive: &dyn Fn(RowId) -> bool,
    ) -> Result<(), BuildError> {
        let mut inner = self.inner.lock();
        let idx = inner
            .get_mut(&index)
            .ok_or(BuildError::StructureMissing(index))?;
        if idx.unique {
            if let Some(rows) = idx.entries.get(&key) {
                for other in rows {
                    if *other != row && alive(*other) {
                        return Err(BuildError::UniqueViolation {
                            index,
                            key_debug: format!("{:?}", key),
                        });
                    }
                }
            }
        }
        idx.entries.entry(key).or_default().insert(row);
        Ok(())
    }

    pub fn is_unique(&self, index: RelationId) -> bool {
        self.inner
            .lock()
            .get(&index)
            .map(|idx| idx.unique)
            .unwrap_or(false)
    }

    /// Every (key, row) pair in index order. Scans go through the heap
    /// for visibility; this is the raw structure.
    pub fn scan_all(&self, index: RelationId) -> Vec<(IndexKey, RowId)> {
        self.inner
            .lock()
            .get(&index)
            .map(|idx| {
                idx.entries
                    .iter()
                    .flat_map(|(k, rows)| rows.iter().map(move |r| (k.clone(), *r)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entry_count(&self, index: RelationId) -> usize {
        self.inner
            .lock()
            .get(&index)
            .map(|idx| idx.entries.values().map(|r| r.len()).sum())
            .unwrap_or(0)
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Populates an index's physical structure from heap contents.
///
/// `build` bulk-loads every tuple visible in the given snapshot into a
/// fresh structure; `catch_up` inserts tuples that became visible after a
/// base build but are missing from the structure because the index was
/// not yet maintained by writers. Both report the number of rows written.
pub trait PhysicalBuilder: Send + Sync {
    fn build(
        &self,
        table: RelationId,
        index: &IndexCatalogEntry,
        snapshot: &Snapshot,
    ) -> Result<u64, BuildError>;

    fn catch_up(
        &self,
        table: RelationId,
        index: &IndexCatalogEntry,
        snapshot: &Snapshot,
    ) -> Result<u64, BuildError>;
}

/// The production builder over the in-memory heap.
pub struct HeapBuilder {
    heap: Arc<HeapStore>,
    structures: Arc<IndexStore>,
}

impl HeapBuilder {
    pub fn new(heap: Arc<HeapStore>, structures: Arc<IndexStore>) -> Self {
        Self { heap, structures }
    }

}

impl PhysicalBuilder for HeapBuilder {
    fn build(
        &self,
        table: RelationId,
        index: &IndexCatalogEntry,
        snapshot: &Snapshot,
    ) -> Result<u64, BuildError> {
        self.structures.create(index.id, index.spec.unique);
        let mut written = 0u64;
        for (row_id, row) in self.heap.scan_visible(table, snapshot)? {
            if !index.spec.covers(&row) {
                continue;
            }
            let key = index.spec.key_of(&row);
            self.structures
                .add_entry(index.id, key, row_id, &|other| {
                    self.heap.row_alive(table, other)
                })?;
            written += 1;
        }
        tracing::debug!(
            "bulk build of index {} on {} wrote {} rows",
            index.id,
            table,
            written
        );
        Ok(written)
    }

    fn catch_up(
        &self,
        table: RelationId,
        index: &IndexCatalogEntry,
        snapshot: &Snapshot,
    ) -> Result<u64, BuildError> {
        if !self.structures.exists(index.id) {
            return Err(BuildError::StructureMissing(index.id));
        }
        let mut written = 0u64;
        for (row_id, row) in self.heap.scan_visible(table, snapshot)? {
            if !index.spec.covers(&row) {
                continue;
            }
            let key = index.spec.key_of(&row);
            if self.structures.contains(index.id, &key, row_id) {
                continue;
            }
            self.structures
                .add_entry(index.id, key, row_id, &|other| {
                    self.heap.row_alive(table, other)
                })?;
            written += 1;
        }
        tracing::debug!(
            "catch-up pass of index {} on {} inserted {} missed rows",
            index.id,
            table,
            written
        );
        Ok(written)
    }
}
