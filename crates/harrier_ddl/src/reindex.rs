//! REINDEX CONCURRENTLY.
//!
//! Rebuilds every eligible index of a table (or one named index) by
//! building a temporarily-named shadow index next to each original,
//! promoting the shadows through the same ready/valid protocol as a
//! concurrent create, then atomically swapping catalog identities and
//! retiring the originals. The original is never dropped before its
//! replacement is proven valid.
//!
//! Every phase is applied to the whole job set before the next phase
//! starts, so each wait is paid once per batch instead of once per index.

use std::sync::Arc;

use harrier_common::error::{CatalogError, DdlError};
use harrier_common::types::{LockMode, LockTag, RelationId, RelationKind, TxnId};
use harrier_storage::{IndexCatalogEntry, PhysicalBuilder};
use harrier_txn::{Session, SessionLockGuard};

use crate::create_index::ConcurrentIndexBuilder;
use crate::engine::Engine;
use crate::progress::{DdlOpKind, DdlPhase};
use crate::waiter::map_lock;

/// What to rebuild.
#[derive(Debug, Clone, Copy)]
pub enum ReindexTarget {
    /// Every eligible index of the table, plus its toast table's indexes.
    Table(RelationId),
    /// One named index.
    Index(RelationId),
}

/// One old/shadow pair carried through the batched phases.
struct BuildJob {
    table: RelationId,
    old: RelationId,
    old_name: String,
    new: RelationId,
}

/// Batch state. `guards` holds every session-scoped lock taken in the
/// shadow-creation phase; all are released at the single cleanup point.
struct RebuildState {
    jobs: Vec<BuildJob>,
    guards: Vec<SessionLockGuard>,
    table_tags: Vec<LockTag>,
    /// At least one identity swap has committed; from here on a failure
    /// leaves a safe but unfinished state instead of rolling back.
    swapped: bool,
    op: u64,
}

pub struct ReindexConcurrentCoordinator {
    engine: Arc<Engine>,
    builder: Arc<dyn PhysicalBuilder>,
}

impl ReindexConcurrentCoordinator {
    pub fn new(engine: &Arc<Engine>) -> Self {
        Self {
            engine: engine.clone(),
            builder: engine.default_builder(),
        }
    }

    /// Substitute the physical builder, keeping the protocol unchanged.
    pub fn with_builder(mut self, builder: Arc<dyn PhysicalBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Rebuild `target` concurrently. Returns `false` when the target had
    /// no eligible index to rebuild.
    pub fn rebuild_concurrently(
        &self,
        session: &Session,
        target: ReindexTarget,
    ) -> Result<bool, DdlError> {
        if session.current_xid().is_some() {
            return Err(DdlError::Unsupported(
                "REINDEX CONCURRENTLY cannot run inside a transaction block".into(),
            ));
        }

        let (relation, kind, targets, skipped) = self.resolve(target)?;
        let op = self.engine.progress().register(relation, kind);
        for note in &skipped {
            tracing::warn!("{}", note);
            self.engine.progress().note(op, note.clone());
        }
        if targets.is_empty() {
            tracing::info!("relation {} has no index to rebuild concurrently", relation);
            self.engine.progress().complete(op);
            return Ok(false);
        }

        let mut state = RebuildState {
            jobs: Vec::new(),
            guards: Vec::new(),
            table_tags: Vec::new(),
            swapped: false,
            op,
        };
        let result = self.drive(session, &mut state, targets);
        self.cleanup(session, &mut state);
        match result {
            Ok(()) => {
                self.engine.progress().complete(op);
                Ok(true)
            }
            Err(err) => {
                // Past the swap point every pair is fully valid; only the
                // retired old indexes remain to be dropped.
                let err = if state.swapped && !err.leaves_residue() {
                    DdlError::PartialRebuild {
                        detail: err.to_string(),
                        pending: state.jobs.iter().map(|j| j.old).collect(),
                    }
                } else {
                    err
                };
                self.engine.progress().fail(op, err.to_string());
                Err(err)
            }
        }
    }

    /// Resolve the target into the (table, old index) pairs to rebuild,
    /// plus remarks for everything skipped.
    #[allow(clippy::type_complexity)]
    fn resolve(
        &self,
        target: ReindexTarget,
    ) -> Result<
        (
            RelationId,
            DdlOpKind,
            Vec<(RelationId, IndexCatalogEntry)>,
            Vec<String>,
        ),
        DdlError,
    > {
        let catalog = self.engine.catalog();
        match target {
            ReindexTarget::Index(id) => {
                let entry = catalog
                    .index_entry(id, None)
                    .ok_or(CatalogError::IndexNotFound(id))?;
                if entry.spec.exclusion {
                    return Err(DdlError::Unsupported(
                        "exclusion constraint indexes".into(),
                    ));
                }
                let table = catalog
                    .table(entry.table)
                    .ok_or(CatalogError::RelationNotFound(entry.table))?;
                if table.kind == RelationKind::Partitioned {
                    return Err(DdlError::Unsupported(
                        "indexes on partitioned tables".into(),
                    ));
                }
                let kind = DdlOpKind::ReindexIndexConcurrently {
                    index_name: entry.name.clone(),
                };
                Ok((id, kind, vec![(entry.table, entry)], Vec::new()))
            }
            ReindexTarget::Table(id) => {
                let table = catalog
                    .table(id)
                    .ok_or(CatalogError::RelationNotFound(id))?;
                if table.kind == RelationKind::Partitioned {
                    return Err(DdlError::Unsupported("partitioned tables".into()));
                }
                let kind = DdlOpKind::ReindexTableConcurrently {
                    table_name: table.name.clone(),
                };
                let mut targets = Vec::new();
                let mut skipped = Vec::new();
                let mut relations = vec![id];
                if let Some(toast) = table.toast {
                    relations.push(toast);
                }
                for relation in relations {
                    for entry in catalog.indexes_of(relation, None) {
                        if !entry.valid {
                            skipped.push(format!(
                                "skipping invalid index {}; reindex it directly once repaired",
                                entry.name
                            ));
                            continue;
                        }
                        if entry.spec.exclusion {
                            skipped.push(format!(
                                "skipping exclusion constraint index {}",
                                entry.name
                            ));
                            continue;
                        }
                        targets.push((relation, entry));
                    }
                }
                Ok((id, kind, targets, skipped))
            }
        }
    }

    fn drive(
        &self,
        session: &Session,
        state: &mut RebuildState,
        targets: Vec<(RelationId, IndexCatalogEntry)>,
    ) -> Result<(), DdlError> {
        let cib = ConcurrentIndexBuilder::new(&self.engine).with_builder(self.builder.clone());

        self.create_shadows(session, state, targets)?;
        self.build_shadows(session, state, &cib)?;
        self.validate_shadows(session, state, &cib)?;
        self.swap_pairs(session, state)?;
        self.retire_old(session, state)?;
        self.drop_old(session, state)?;
        Ok(())
    }

    /// Phase 1: create one temporarily-named shadow entry per job and take
    /// session locks on every table, old index and shadow index involved,
    /// all in one committed transaction.
    fn create_shadows(
        &self,
        session: &Session,
        state: &mut RebuildState,
        targets: Vec<(RelationId, IndexCatalogEntry)>,
    ) -> Result<(), DdlError> {
        let catalog = self.engine.catalog();
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;

        let result: Result<(), DdlError> = (|| {
            for (table, old) in targets {
                let new = create_shadow_entry(catalog.as_ref(), xid, table, &old)?;
                if !state.table_tags.contains(&LockTag(table)) {
                    state.table_tags.push(LockTag(table));
                }
                state.jobs.push(BuildJob {
                    table,
                    old: old.id,
                    old_name: old.name.clone(),
                    new,
                });
            }
            let mut lock_tags = state.table_tags.clone();
            for job in &state.jobs {
                lock_tags.push(LockTag(job.old));
                lock_tags.push(LockTag(job.new));
            }
            for tag in lock_tags {
                let guard = self
                    .engine
                    .locks()
                    .acquire_session(session, tag, LockMode::ShareUpdateExclusive)
                    .map_err(map_lock)?;
                state.guards.push(guard);
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                txns.commit(session)?;
                tracing::debug!("created {} shadow indexes", state.jobs.len());
                Ok(())
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// Phase 2: one wait over the merged table set, then bulk-build each
    /// shadow in its own short transaction so one job's failure cannot
    /// roll back another's committed build.
    fn build_shadows(
        &self,
        session: &Session,
        state: &mut RebuildState,
        cib: &ConcurrentIndexBuilder,
    ) -> Result<(), DdlError> {
        self.engine.progress().set_phase(state.op, DdlPhase::Building);
        self.engine
            .waiter()
            .wait_for_lockers(session, &state.table_tags, LockMode::Share)?;
        for job in &state.jobs {
            let rows = cib.build_in_txn(session, job.table, job.new)?;
            self.engine.progress().record_rows(state.op, rows);
        }
        Ok(())
    }

    /// Phase 3: one wait over the merged table set, then per job the
    /// reference-snapshot catch-up, the older-snapshot wait and the
    /// `valid` promotion.
    fn validate_shadows(
        &self,
        session: &Session,
        state: &mut RebuildState,
        cib: &ConcurrentIndexBuilder,
    ) -> Result<(), DdlError> {
        self.engine
            .progress()
            .set_phase(state.op, DdlPhase::Validating);
        self.engine
            .waiter()
            .wait_for_lockers(session, &state.table_tags, LockMode::Share)?;
        for job in &state.jobs {
            let (rows, limit_xmin) = cib.catch_up_in_txn(session, job.table, job.new)?;
            self.engine.progress().record_rows(state.op, rows);
            cib.promote_valid_after_wait(session, job.new, limit_xmin)?;
        }
        Ok(())
    }

    /// Phase 4: exchange every pair's catalog identity in one committed
    /// transaction. Swaps apply in order, so a later swap observes an
    /// earlier one's rename even when temporary names would collide.
    fn swap_pairs(&self, session: &Session, state: &mut RebuildState) -> Result<(), DdlError> {
        self.engine.progress().set_phase(state.op, DdlPhase::Swapping);
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let result: Result<(), DdlError> = (|| {
            for job in &state.jobs {
                self.engine.catalog().swap_identities(xid, job.old, job.new)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                txns.commit(session)?;
                state.swapped = true;
                tracing::info!("swapped {} rebuilt index pairs", state.jobs.len());
                Ok(())
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// Phase 5: wait out every transaction that could still hold a plan
    /// referencing an old index, then mark the old indexes dead.
    fn retire_old(&self, session: &Session, state: &mut RebuildState) -> Result<(), DdlError> {
        self.engine.progress().set_phase(state.op, DdlPhase::Retiring);
        self.engine
            .waiter()
            .wait_for_lockers(session, &state.table_tags, LockMode::AccessExclusive)?;
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let result: Result<(), DdlError> = (|| {
            for job in &state.jobs {
                self.engine.catalog().mark_dead(xid, job.old)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                txns.commit(session)?;
                Ok(())
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// Phase 6: wait once more, then batch-delete the dead old indexes.
    fn drop_old(&self, session: &Session, state: &mut RebuildState) -> Result<(), DdlError> {
        self.engine
            .waiter()
            .wait_for_lockers(session, &state.table_tags, LockMode::AccessExclusive)?;
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let result: Result<(), DdlError> = (|| {
            for job in &state.jobs {
                self.engine.catalog().drop_index(xid, job.old)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                txns.commit(session)?;
                for job in &state.jobs {
                    tracing::debug!("dropped retired index {} ({})", job.old, job.old_name);
                }
                Ok(())
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// The single exit point: aborts any transaction a failed phase left
    /// open and releases every session lock from the shadow phase.
    fn cleanup(&self, session: &Session, state: &mut RebuildState) {
        if session.current_xid().is_some() {
            if let Err(err) = self.engine.txns().abort(session) {
                tracing::warn!("abort during reindex cleanup failed: {}", err);
            }
        }
        for guard in &mut state.guards {
            guard.release();
        }
        state.guards.clear();
    }
}

/// Create the shadow entry for `old`, probing for a free temporary name.
fn create_shadow_entry(
    catalog: &harrier_storage::CatalogStore,
    xid: TxnId,
    table: RelationId,
    old: &IndexCatalogEntry,
) -> Result<RelationId, DdlError> {
    for attempt in 0u32.. {
        let name = if attempt == 0 {
            format!("{}_ccnew", old.name)
        } else {
            format!("{}_ccnew{}", old.name, attempt)
        };
        match catalog.create_index_entry(xid, table, &name, old.spec.clone(), old.parent) {
            Ok(id) => return Ok(id),
            Err(CatalogError::DuplicateName(_)) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(DdlError::Internal(format!(
        "no free temporary name for rebuilding {}",
        old.name
    )))
}
