//! CREATE INDEX CONCURRENTLY.
//!
//! The build spans multiple committed transactions so that readers and
//! writers are never excluded for longer than a catalog flag flip:
//!
//!   0. create the catalog entry, all flags false, and commit
//!   1. take a session lock on the table and wait out every writer that
//!      began before the entry was visible
//!   2. bulk-build the index from a fresh snapshot, set `ready`, commit
//!   3. wait out writers again, catch up tuples the build missed, then
//!      wait out every snapshot older than the validation horizon and
//!      set `valid`
//!
//! After step 1 every new writer maintains the entry once `ready` is set;
//! after step 3 no live transaction can observe a row set the index does
//! not also answer. A failure before `ready` leaves an inert entry the
//! caller must drop; a failure after `ready` leaves a maintained but
//! unreadable index that a reindex can finish.

use std::sync::Arc;

use harrier_common::error::{CatalogError, DdlError};
use harrier_common::types::{IndexSpec, LockMode, LockTag, RelationId, RelationKind, TxnId};
use harrier_storage::{CatalogStore, PhysicalBuilder};
use harrier_txn::{Session, SessionLockGuard};

use crate::engine::Engine;
use crate::progress::{DdlOpKind, DdlPhase};
use crate::waiter::map_lock;

/// Protocol phases. Each phase function commits (or has no transaction
/// open) before the next begins; no transaction straddles two waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatePhase {
    CreateEntry,
    WaitForWriters,
    Build,
    Validate,
    Done,
}

/// Mutable state threaded through the phase functions.
struct BuildState {
    table: RelationId,
    tag: LockTag,
    name: String,
    spec: Option<IndexSpec>,
    index: Option<RelationId>,
    /// Session-scoped table lock; released only by `cleanup`.
    table_guard: Option<SessionLockGuard>,
    op: u64,
}

pub struct ConcurrentIndexBuilder {
    engine: Arc<Engine>,
    builder: Arc<dyn PhysicalBuilder>,
}

impl ConcurrentIndexBuilder {
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

    /// Build `spec` as index `name` on `table` without blocking concurrent
    /// readers or writers. Returns the id of the now-valid index.
    pub fn build_concurrently(
        &self,
        session: &Session,
        table: RelationId,
        name: &str,
        spec: IndexSpec,
    ) -> Result<RelationId, DdlError> {
        if session.current_xid().is_some() {
            return Err(DdlError::Unsupported(
                "CREATE INDEX CONCURRENTLY cannot run inside a transaction block".into(),
            ));
        }
        validate_spec(self.engine.catalog().as_ref(), table, &spec)?;

        let op = self.engine.progress().register(
            table,
            DdlOpKind::CreateIndexConcurrently {
                index_name: name.into(),
            },
        );
        let mut state = BuildState {
            table,
            tag: LockTag(table),
            name: name.into(),
            spec: Some(spec),
            index: None,
            table_guard: None,
            op,
        };

        let result = self.drive(session, &mut state);
        self.cleanup(session, &mut state);
        match result {
            Ok(index) => {
                self.engine.progress().complete(op);
                tracing::info!("index {} on {} is now valid", state.name, table);
                Ok(index)
            }
            Err(err) => {
                self.engine.progress().fail(op, err.to_string());
                Err(err)
            }
        }
    }

    fn drive(&self, session: &Session, state: &mut BuildState) -> Result<RelationId, DdlError> {
        let mut phase = CreatePhase::CreateEntry;
        loop {
            phase = match phase {
                CreatePhase::CreateEntry => self.create_entry(session, state)?,
                CreatePhase::WaitForWriters => self.wait_for_writers(session, state)?,
                CreatePhase::Build => self.build_contents(session, state)?,
                CreatePhase::Validate => self.validate_contents(session, state)?,
                CreatePhase::Done => {
                    return state
                        .index
                        .ok_or_else(|| DdlError::Internal("protocol finished without an index".into()))
                }
            };
        }
    }

    /// Phase 0: create the entry with all flags false and commit, so every
    /// transaction that starts from here on sees it.
    fn create_entry(
        &self,
        session: &Session,
        state: &mut BuildState,
    ) -> Result<CreatePhase, DdlError> {
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let spec = state
            .spec
            .take()
            .ok_or_else(|| DdlError::Internal("index spec already consumed".into()))?;
        let index =
            self.engine
                .catalog()
                .create_index_entry(xid, state.table, &state.name, spec, None)?;
        txns.commit(session)?;
        state.index = Some(index);
        tracing::debug!("created catalog entry {} for index {}", index, state.name);
        Ok(CreatePhase::WaitForWriters)
    }

    /// Phase 1: block concurrent table drop with a session-scoped lock,
    /// then wait out every transaction that began before the entry was
    /// visible. After this, any transaction that will still be running
    /// when `ready` commits has the entry in its working index set.
    fn wait_for_writers(
        &self,
        session: &Session,
        state: &mut BuildState,
    ) -> Result<CreatePhase, DdlError> {
        let guard = self
            .engine
            .locks()
            .acquire_session(session, state.tag, LockMode::ShareUpdateExclusive)
            .map_err(map_lock)?;
        state.table_guard = Some(guard);
        self.engine
            .waiter()
            .wait_for_lockers(session, &[state.tag], LockMode::Share)?;
        Ok(CreatePhase::Build)
    }

    /// Phase 2: bulk-build from a fresh snapshot and promote to `ready`.
    fn build_contents(
        &self,
        session: &Session,
        state: &mut BuildState,
    ) -> Result<CreatePhase, DdlError> {
        let index = state
            .index
            .ok_or_else(|| DdlError::Internal("no catalog entry to build".into()))?;
        self.engine.progress().set_phase(state.op, DdlPhase::Building);
        let rows = self.build_in_txn(session, state.table, index)?;
        self.engine.progress().record_rows(state.op, rows);
        Ok(CreatePhase::Validate)
    }

    /// Phase 3: wait out pre-`ready` writers, catch up missed tuples under
    /// a registered reference snapshot, then wait out every snapshot older
    /// than the horizon and promote to `valid`.
    fn validate_contents(
        &self,
        session: &Session,
        state: &mut BuildState,
    ) -> Result<CreatePhase, DdlError> {
        let index = state
            .index
            .ok_or_else(|| DdlError::Internal("no catalog entry to validate".into()))?;
        self.engine.progress().set_phase(state.op, DdlPhase::Validating);

        self.engine
            .waiter()
            .wait_for_lockers(session, &[state.tag], LockMode::Share)?;

        let (rows, limit_xmin) = self.catch_up_in_txn(session, state.table, index)?;
        self.engine.progress().record_rows(state.op, rows);
        self.promote_valid_after_wait(session, index, limit_xmin)?;
        Ok(CreatePhase::Done)
    }

    /// The single exit point: aborts any transaction a failed phase left
    /// open and releases the session lock.
    fn cleanup(&self, session: &Session, state: &mut BuildState) {
        if session.current_xid().is_some() {
            if let Err(err) = self.engine.txns().abort(session) {
                tracing::warn!("abort during index build cleanup failed: {}", err);
            }
        }
        if let Some(mut guard) = state.table_guard.take() {
            guard.release();
        }
    }

    // ── Shared with the reindex coordinator ──────────────────────────

    /// Bulk-build `index` in its own short transaction and promote it to
    /// `ready`. Returns the number of rows written.
    pub(crate) fn build_in_txn(
        &self,
        session: &Session,
        table: RelationId,
        index: RelationId,
    ) -> Result<u64, DdlError> {
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let result: Result<u64, DdlError> = (|| {
            let snapshot = self.engine.snapshots().take(session)?;
            let entry = self
                .engine
                .catalog()
                .index_entry(index, Some(xid))
                .ok_or(CatalogError::IndexNotFound(index))?;
            let rows = self
                .builder
                .build(table, &entry, &snapshot)
                .map_err(|source| DdlError::BuildFailure { index, source })?;
            self.engine.catalog().set_ready(xid, index)?;
            Ok(rows)
        })();
        match result {
            Ok(rows) => {
                txns.commit(session)?;
                Ok(rows)
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// Catch up tuples committed after the bulk build, under a registered
    /// reference snapshot, in its own short transaction. Returns the rows
    /// inserted and the validation horizon (`limit_xmin`).
    pub(crate) fn catch_up_in_txn(
        &self,
        session: &Session,
        table: RelationId,
        index: RelationId,
    ) -> Result<(u64, TxnId), DdlError> {
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        let result: Result<(u64, TxnId), DdlError> = (|| {
            let snapshot = self.engine.snapshots().take(session)?;
            self.engine.snapshots().register(session, &snapshot)?;
            let entry = self
                .engine
                .catalog()
                .index_entry(index, Some(xid))
                .ok_or(CatalogError::IndexNotFound(index))?;
            let rows = self
                .builder
                .catch_up(table, &entry, &snapshot)
                .map_err(|source| DdlError::BuildFailure { index, source });
            let limit_xmin = snapshot.xmin;
            self.engine.snapshots().unregister(session);
            Ok((rows?, limit_xmin))
        })();
        match result {
            Ok(out) => {
                txns.commit(session)?;
                Ok(out)
            }
            Err(err) => {
                txns.abort(session)?;
                Err(err)
            }
        }
    }

    /// Wait until no live snapshot predates `limit_xmin`, then promote
    /// `index` to `valid` in its own short transaction.
    pub(crate) fn promote_valid_after_wait(
        &self,
        session: &Session,
        index: RelationId,
        limit_xmin: TxnId,
    ) -> Result<(), DdlError> {
        let txns = self.engine.txns();
        let xid = txns.begin(session)?;
        if let Err(err) = self
            .engine
            .waiter()
            .wait_for_older_snapshots(session, limit_xmin)
        {
            txns.abort(session)?;
            return Err(err);
        }
        self.engine.catalog().set_valid(xid, index)?;
        txns.commit(session)?;
        Ok(())
    }
}

/// Reject definitions this protocol cannot build before touching the
/// catalog.
fn validate_spec(
    catalog: &CatalogStore,
    table: RelationId,
    spec: &IndexSpec,
) -> Result<(), DdlError> {
    let entry = catalog
        .table(table)
        .ok_or(CatalogError::RelationNotFound(table))?;
    match entry.kind {
        RelationKind::Table | RelationKind::Toast { .. } | RelationKind::MaterializedView => {}
        RelationKind::Partitioned => {
            return Err(DdlError::Unsupported(
                "concurrent index builds on partitioned tables".into(),
            ))
        }
    }
    if spec.columns.is_empty() {
        return Err(DdlError::Validation("index has no key columns".into()));
    }
    if spec.access_method != "btree" {
        return Err(DdlError::Validation(format!(
            "unknown access method {:?}",
            spec.access_method
        )));
    }
    if spec.exclusion {
        return Err(DdlError::Unsupported(
            "exclusion constraint indexes".into(),
        ));
    }
    Ok(())
}
