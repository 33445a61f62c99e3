//! Snapshot issue and tracking.
//!
//! `take` builds a visibility horizon from the in-flight transaction set;
//! `register`/`unregister` pin a reference snapshot so its xmin stays
//! reported in the backend's entry while a long validation scan runs.
//! `active_backends` is the enumeration `wait_for_older_snapshots` is
//! built on.

use std::sync::Arc;

use harrier_common::error::TxnError;
use harrier_common::types::{Snapshot, TxnId, VirtualTxnId};

use crate::manager::TxnManager;
use crate::session::Session;

/// One in-flight transaction's snapshot horizon as seen by waiters.
#[derive(Debug, Clone, Copy)]
pub struct BackendSnapshotInfo {
    pub vxid: VirtualTxnId,
    /// Oldest xmin this backend holds (its snapshot or a registered
    /// reference snapshot), if it holds one at all.
    pub xmin: Option<TxnId>,
    pub is_vacuum: bool,
}

pub struct SnapshotTracker {
    txns: Arc<TxnManager>,
}

impl SnapshotTracker {
    pub fn new(txns: Arc<TxnManager>) -> Self {
        Self { txns }
    }

    /// Take a fresh snapshot for `session`'s current transaction and
    /// record its xmin in the backend's entry.
    pub fn take(&self, session: &Session) -> Result<Snapshot, TxnError> {
        let vxid = session
            .current_vxid()
            .ok_or(TxnError::NoActiveTransaction)?;
        let mut active = self.txns.active.lock();
        let xmax = self.txns.next_xid();
        let in_progress: Vec<TxnId> = active.values().map(|t| t.xid).collect();
        let xmin = in_progress.iter().copied().min().unwrap_or(xmax);
        if let Some(me) = active.get_mut(&vxid) {
            me.snapshot_xmin = Some(match me.snapshot_xmin {
                Some(existing) => existing.min(xmin),
                None => xmin,
            });
        }
        Ok(Snapshot {
            xmin,
            xmax,
            in_progress,
        })
    }

    /// Pin `snapshot`'s xmin as a registered reference snapshot for
    /// `session`'s backend entry.
    pub fn register(&self, session: &Session, snapshot: &Snapshot) -> Result<(), TxnError> {
        let vxid = session
            .current_vxid()
            .ok_or(TxnError::NoActiveTransaction)?;
        let mut active = self.txns.active.lock();
        if let Some(me) = active.get_mut(&vxid) {
            me.registered_xmin = Some(snapshot.xmin);
        }
        Ok(())
    }

    /// Release the registered reference snapshot, if any.
    pub fn unregister(&self, session: &Session) {
        if let Some(vxid) = session.current_vxid() {
            let mut active = self.txns.active.lock();
            if let Some(me) = active.get_mut(&vxid) {
                me.registered_xmin = None;
            }
        }
    }

    /// Every in-flight transaction's snapshot horizon, excluding
    /// `exclude`'s own backend.
    pub fn active_backends(&self, exclude: &Session) -> Vec<BackendSnapshotInfo> {
        let active = self.txns.active.lock();
        active
            .iter()
            .filter(|(_, t)| t.backend != exclude.backend())
            .map(|(vxid, t)| BackendSnapshotInfo {
                vxid: *vxid,
                xmin: match (t.snapshot_xmin, t.registered_xmin) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                },
                is_vacuum: t.is_vacuum,
            })
            .collect()
    }
}
