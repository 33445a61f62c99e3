//! Transaction lifecycle: begin, commit, abort, xid allocation, and the
//! end-of-transaction wakeup that lock waiters and snapshot waiters block
//! on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use harrier_common::cancel::CancelToken;
use harrier_common::error::{LockError, TxnError};
use harrier_common::types::{BackendId, TxnId, VirtualTxnId};
use harrier_storage::catalog::CatalogStore;
use harrier_storage::heap::XidStatus;
use parking_lot::{Condvar, Mutex};

use crate::lock::LockManager;
use crate::session::{CurrentTxn, Session};

/// Resolved state of a transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    Committed,
    Aborted,
}

pub(crate) struct ActiveTxn {
    pub xid: TxnId,
    pub backend: BackendId,
    pub is_vacuum: bool,
    /// Oldest snapshot xmin this transaction has taken, if any.
    pub snapshot_xmin: Option<TxnId>,
    /// Explicitly registered reference snapshot's xmin, if any.
    pub registered_xmin: Option<TxnId>,
}

pub struct TxnManager {
    /// Next xid to assign.
    xid_counter: AtomicU64,
    backend_counter: AtomicU32,
    statuses: DashMap<TxnId, TxnStatus>,
    pub(crate) active: Mutex<HashMap<VirtualTxnId, ActiveTxn>>,
    pub(crate) ended: Condvar,
    catalog: Arc<CatalogStore>,
    locks: Arc<LockManager>,
}

impl TxnManager {
    pub fn new(catalog: Arc<CatalogStore>, locks: Arc<LockManager>) -> Self {
        Self {
            xid_counter: AtomicU64::new(1),
            backend_counter: AtomicU32::new(1),
            statuses: DashMap::new(),
            active: Mutex::new(HashMap::new()),
            ended: Condvar::new(),
            catalog,
            locks,
        }
    }

    pub fn new_session(&self) -> Arc<Session> {
        let backend = BackendId(self.backend_counter.fetch_add(1, Ordering::SeqCst));
        Arc::new(Session::new(backend, false))
    }

    /// A vacuum-class session: excluded from snapshot waits.
    pub fn new_vacuum_session(&self) -> Arc<Session> {
        let backend = BackendId(self.backend_counter.fetch_add(1, Ordering::SeqCst));
        Arc::new(Session::new(backend, true))
    }

    /// First xid not yet assigned. Snapshot `xmax`.
    pub(crate) fn next_xid(&self) -> TxnId {
        TxnId(self.xid_counter.load(Ordering::SeqCst))
    }

    /// Begin a transaction on `session`.
    pub fn begin(&self, session: &Session) -> Result<TxnId, TxnError> {
        if let Some(xid) = session.current_xid() {
            return Err(TxnError::AlreadyActive(xid));
        }
        let xid = TxnId(self.xid_counter.fetch_add(1, Ordering::SeqCst));
        let vxid = session.next_vxid();
        self.statuses.insert(xid, TxnStatus::InProgress);
        self.active.lock().insert(
            vxid,
            ActiveTxn {
                xid,
                backend: session.backend(),
                is_vacuum: session.is_vacuum(),
                snapshot_xmin: None,
                registered_xmin: None,
            },
        );
        session.set_current(CurrentTxn { xid, vxid });
        tracing::debug!("TXN begin: {} as {} on {}", xid, vxid, session.backend());
        Ok(xid)
    }

    /// Commit `session`'s transaction: apply its catalog work, flip its
    /// status, release its transaction-scoped locks, and wake everyone
    /// waiting for this transaction to end.
    pub fn commit(&self, session: &Session) -> Result<(), TxnError> {
        let current = session.take_current().ok_or(TxnError::NoActiveTransaction)?;
        if let Err(e) = self.catalog.commit_txn(current.xid) {
            // Catalog apply failed: the transaction aborts instead.
            self.statuses.insert(current.xid, TxnStatus::Aborted);
            self.finish(current);
            tracing::warn!("TXN {} aborted at commit: {}", current.xid, e);
            return Err(TxnError::CommitFailed(e.to_string()));
        }
        self.statuses.insert(current.xid, TxnStatus::Committed);
        self.finish(current);
        tracing::debug!("TXN commit: {}", current.xid);
        Ok(())
    }

    /// Abort `session`'s transaction, discarding its catalog work.
    pub fn abort(&self, session: &Session) -> Result<(), TxnError> {
        let current = session.take_current().ok_or(TxnError::NoActiveTransaction)?;
        self.catalog.abort_txn(current.xid);
        self.statuses.insert(current.xid, TxnStatus::Aborted);
        self.finish(current);
        tracing::debug!("TXN abort: {}", current.xid);
        Ok(())
    }

    fn finish(&self, current: CurrentTxn) {
        self.locks.release_transaction(current.vxid);
        self.active.lock().remove(&current.vxid);
        self.ended.notify_all();
    }

    pub fn status(&self, xid: TxnId) -> Option<TxnStatus> {
        self.statuses.get(&xid).map(|s| *s)
    }

    pub fn is_vxid_active(&self, vxid: VirtualTxnId) -> bool {
        self.active.lock().contains_key(&vxid)
    }

    /// Native lock-wait primitive: block until the identified virtual
    /// transaction ends. Returns immediately if it already has.
    pub fn wait_for_vxid_end(
        &self,
        vxid: VirtualTxnId,
        cancel: &CancelToken,
        poll: std::time::Duration,
    ) -> Result<(), LockError> {
        let mut active = self.active.lock();
        while active.contains_key(&vxid) {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            self.ended.wait_for(&mut active, poll);
        }
        Ok(())
    }

    /// Number of transactions currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl XidStatus for TxnManager {
    fn is_committed(&self, xid: TxnId) -> bool {
        matches!(self.status(xid), Some(TxnStatus::Committed))
    }

    fn is_aborted(&self, xid: TxnId) -> bool {
        matches!(self.status(xid), Some(TxnStatus::Aborted))
    }
}
