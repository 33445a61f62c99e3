//! Session (backend) handles.
//!
//! Each coordinator or writer runs single-threaded inside one session; a
//! session has at most one transaction in flight, a per-run virtual
//! transaction id, and a cancellation token that reaches into every wait
//! the session's current operation is blocked in.

use std::sync::atomic::{AtomicU64, Ordering};

use harrier_common::cancel::CancelToken;
use harrier_common::types::{BackendId, TxnId, VirtualTxnId};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CurrentTxn {
    pub xid: TxnId,
    pub vxid: VirtualTxnId,
}

pub struct Session {
    backend: BackendId,
    is_vacuum: bool,
    cancel: CancelToken,
    vxid_counter: AtomicU64,
    current: Mutex<Option<CurrentTxn>>,
}

impl Session {
    pub(crate) fn new(backend: BackendId, is_vacuum: bool) -> Self {
        Self {
            backend,
            is_vacuum,
            cancel: CancelToken::new(),
            vxid_counter: AtomicU64::new(1),
            current: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Vacuum-class sessions never depend on not-yet-valid index entries,
    /// so snapshot waits skip them.
    pub fn is_vacuum(&self) -> bool {
        self.is_vacuum
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cancellation of whatever this session is blocked in.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn current_xid(&self) -> Option<TxnId> {
        self.current.lock().map(|c| c.xid)
    }

    pub fn current_vxid(&self) -> Option<VirtualTxnId> {
        self.current.lock().map(|c| c.vxid)
    }

    pub(crate) fn next_vxid(&self) -> VirtualTxnId {
        VirtualTxnId {
            backend: self.backend,
            local: self.vxid_counter.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub(crate) fn set_current(&self, txn: CurrentTxn) {
        *self.current.lock() = Some(txn);
    }

    pub(crate) fn take_current(&self) -> Option<CurrentTxn> {
        self.current.lock().take()
    }
}
