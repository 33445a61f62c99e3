//! Waiting out other sessions.
//!
//! Both DDL protocols promote catalog flags in short committed
//! transactions and then block until every transaction that could still
//! observe the pre-promotion state has ended. The two primitives here are
//! the only suspension points in either protocol; both are bounded only
//! by the longest concurrent transaction and respond to cancellation
//! within one poll interval.

use std::sync::Arc;

use harrier_common::error::{DdlError, LockError};
use harrier_common::types::{LockMode, LockTag, TxnId};
use harrier_txn::{LockManager, Session, SnapshotTracker, TxnManager};

/// Translate lock-wait failures into the DDL error taxonomy. A cancelled
/// wait is an operation cancellation, not a lock conflict.
pub(crate) fn map_lock(err: LockError) -> DdlError {
    match err {
        LockError::Cancelled => DdlError::Cancelled,
        other => DdlError::LockConflict(other),
    }
}

/// Blocks a DDL session on the virtual transactions it must outwait.
pub struct OlderSnapshotWaiter {
    txns: Arc<TxnManager>,
    locks: Arc<LockManager>,
    snapshots: Arc<SnapshotTracker>,
    poll: std::time::Duration,
}

impl OlderSnapshotWaiter {
    pub fn new(
        txns: Arc<TxnManager>,
        locks: Arc<LockManager>,
        snapshots: Arc<SnapshotTracker>,
        poll: std::time::Duration,
    ) -> Self {
        Self {
            txns,
            locks,
            snapshots,
            poll,
        }
    }

    /// Block until every transaction currently holding a lock on any tag
    /// in `tags` that conflicts with `mode` has ended.
    ///
    /// The holder set is enumerated once: transactions that start after
    /// the enumeration began after the caller's last commit and therefore
    /// already observe the promoted catalog state.
    pub fn wait_for_lockers(
        &self,
        session: &Session,
        tags: &[LockTag],
        mode: LockMode,
    ) -> Result<(), DdlError> {
        let cancel = session.cancel_token();
        let holders = self
            .locks
            .conflicting_holders(tags, mode, session.backend());
        if holders.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "waiting for {} transactions holding locks conflicting with {} on {} relations",
            holders.len(),
            mode,
            tags.len()
        );
        for vxid in holders {
            self.txns
                .wait_for_vxid_end(vxid, &cancel, self.poll)
                .map_err(map_lock)?;
        }
        Ok(())
    }

    /// Block until no live transaction (vacuum workers excepted) holds a
    /// snapshot with `xmin < limit_xmin`.
    ///
    /// The active set is re-enumerated before every individual wait: a
    /// transaction can end between enumeration and wait, and a stale entry
    /// must be dropped rather than waited on.
    pub fn wait_for_older_snapshots(
        &self,
        session: &Session,
        limit_xmin: TxnId,
    ) -> Result<(), DdlError> {
        let cancel = session.cancel_token();
        loop {
            let blocker = self
                .snapshots
                .active_backends(session)
                .into_iter()
                .find(|info| {
                    !info.is_vacuum && info.xmin.map(|x| x < limit_xmin).unwrap_or(false)
                });
            let Some(info) = blocker else {
                return Ok(());
            };
            tracing::debug!(
                "waiting for {} with snapshot xmin {:?} older than {}",
                info.vxid,
                info.xmin,
                limit_xmin
            );
            self.txns
                .wait_for_vxid_end(info.vxid, &cancel, self.poll)
                .map_err(map_lock)?;
        }
    }
}
