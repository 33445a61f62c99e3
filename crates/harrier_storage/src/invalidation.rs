//! Relcache invalidation broadcast.
//!
//! Every committed change to a relation's index set emits an invalidation
//! for the owning table so other sessions discard cached plans and
//! metadata. The engine here has no plan cache; the bus records the
//! broadcasts so sessions (and tests) can observe that one was sent at
//! every promotion point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use harrier_common::types::RelationId;
use parking_lot::Mutex;

pub struct InvalidationBus {
    per_relation: Mutex<HashMap<RelationId, u64>>,
    total: AtomicU64,
}

impl InvalidationBus {
    pub fn new() -> Self {
        Self {
            per_relation: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
        }
    }

    /// Broadcast an invalidation for `relation`.
    pub fn invalidate(&self, relation: RelationId) {
        *self.per_relation.lock().entry(relation).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("relcache invalidation broadcast for {}", relation);
    }

    /// Number of invalidations broadcast for `relation` so far.
    pub fn count(&self, relation: RelationId) -> u64 {
        self.per_relation.lock().get(&relation).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}
