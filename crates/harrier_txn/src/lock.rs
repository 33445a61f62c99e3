//! Relation lock manager.
//!
//! A single lock table guarded by one mutex, with a Condvar waking all
//! waiters on every release. Grants are either transaction-scoped
//! (released when the owning transaction ends) or session-scoped
//! (released only by the owning protocol's cleanup path, surviving the
//! commits in between). Waiters poll the cancellation token on every
//! wakeup, so a cancel unwinds a blocked acquire promptly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use harrier_common::config::DdlConfig;
use harrier_common::error::LockError;
use harrier_common::types::{BackendId, LockMode, LockScope, LockTag, VirtualTxnId};
use parking_lot::{Condvar, Mutex};

use crate::session::Session;

/// Record of one acquired lock, needed to release exactly that grant.
#[derive(Debug, Clone)]
pub struct LockTicket {
    pub tag: LockTag,
    pub mode: LockMode,
    pub scope: LockScope,
    pub backend: BackendId,
    pub vxid: VirtualTxnId,
}

#[derive(Debug, Clone)]
struct Grant {
    backend: BackendId,
    vxid: VirtualTxnId,
    mode: LockMode,
    scope: LockScope,
}

struct LockTable {
    grants: HashMap<LockTag, Vec<Grant>>,
}

pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    config: DdlConfig,
}

impl LockManager {
    pub fn new(config: DdlConfig) -> Self {
        Self {
            table: Mutex::new(LockTable {
                grants: HashMap::new(),
            }),
            released: Condvar::new(),
            config,
        }
    }

    /// Acquire `mode` on `tag`, blocking while any other backend holds a
    /// conflicting grant. A backend's own grants never conflict with its
    /// new requests.
    pub fn acquire(
        &self,
        session: &Session,
        tag: LockTag,
        mode: LockMode,
        scope: LockScope,
    ) -> Result<LockTicket, LockError> {
        let cancel = session.cancel_token();
        let backend = session.backend();
        let vxid = session.current_vxid().unwrap_or(VirtualTxnId {
            backend,
            local: 0,
        });
        let deadline = self.config.lock_timeout().map(|d| Instant::now() + d);
        let poll = self.config.wait_poll();

        let mut table = self.table.lock();
        loop {
            let conflicts = table
                .grants
                .get(&tag)
                .map(|grants| {
                    grants
                        .iter()
                        .filter(|g| g.backend != backend && g.mode.conflicts_with(mode))
                        .count()
                })
                .unwrap_or(0);
            if conflicts == 0 {
                table.grants.entry(tag).or_default().push(Grant {
                    backend,
                    vxid,
                    mode,
                    scope,
                });
                tracing::debug!("{} acquired {} {:?} on {}", backend, mode, scope, tag);
                return Ok(LockTicket {
                    tag,
                    mode,
                    scope,
                    backend,
                    vxid,
                });
            }
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(LockError::Timeout {
                        tag,
                        mode,
                        holders: conflicts,
                    });
                }
            }
            self.released.wait_for(&mut table, poll);
        }
    }

    /// Acquire a session-scoped lock wrapped in a guard. The guard must be
    /// released by the owning protocol's single cleanup point; `Drop` is
    /// only a backstop.
    pub fn acquire_session(
        self: &Arc<Self>,
        session: &Session,
        tag: LockTag,
        mode: LockMode,
    ) -> Result<SessionLockGuard, LockError> {
        let ticket = self.acquire(session, tag, mode, LockScope::Session)?;
        Ok(SessionLockGuard {
            locks: Arc::clone(self),
            ticket: Some(ticket),
        })
    }

    /// Release exactly one grant matching the ticket.
    pub fn release(&self, ticket: &LockTicket) {
        let mut table = self.table.lock();
        if let Some(grants) = table.grants.get_mut(&ticket.tag) {
            if let Some(pos) = grants.iter().position(|g| {
                g.backend == ticket.backend
                    && g.vxid == ticket.vxid
                    && g.mode == ticket.mode
                    && g.scope == ticket.scope
            }) {
                grants.remove(pos);
                if grants.is_empty() {
                    table.grants.remove(&ticket.tag);
                }
            }
        }
        drop(table);
        self.released.notify_all();
    }

    /// Release every transaction-scoped grant of the ended `vxid`.
    pub fn release_transaction(&self, vxid: VirtualTxnId) {
        let mut table = self.table.lock();
        table.grants.retain(|_, grants| {
            grants.retain(|g| !(g.scope == LockScope::Transaction && g.vxid == vxid));
            !grants.is_empty()
        });
        drop(table);
        self.released.notify_all();
    }

    /// Virtual transactions of other backends currently holding a grant
    /// that conflicts with `mode` on any tag in `tags`.
    pub fn conflicting_holders(
        &self,
        tags: &[LockTag],
        mode: LockMode,
        exclude: BackendId,
    ) -> Vec<VirtualTxnId> {
        let table = self.table.lock();
        let mut holders = Vec::new();
        for tag in tags {
            if let Some(grants) = table.grants.get(tag) {
                for g in grants {
                    if g.backend != exclude
                        && g.mode.conflicts_with(mode)
                        && !holders.contains(&g.vxid)
                    {
                        holders.push(g.vxid);
                    }
                }
            }
        }
        holders
    }

    /// Number of session-scoped grants held by `backend`.
    pub fn session_lock_count(&self, backend: BackendId) -> usize {
        self.table
            .lock()
            .grants
            .values()
            .flatten()
            .filter(|g| g.backend == backend && g.scope == LockScope::Session)
            .count()
    }

    /// Total grants held by `backend`, any scope.
    pub fn held_count(&self, backend: BackendId) -> usize {
        self.table
            .lock()
            .grants
            .values()
            .flatten()
            .filter(|g| g.backend == backend)
            .count()
    }
}

/// Owned session-scoped lock. Released exactly once; the designated
/// end-of-protocol cleanup calls [`release`](Self::release) on every exit
/// path so a half-built shadow index can never become undroppable.
pub struct SessionLockGuard {
    locks: Arc<LockManager>,
    ticket: Option<LockTicket>,
}

impl SessionLockGuard {
    pub fn tag(&self) -> Option<LockTag> {
        self.ticket.as_ref().map(|t| t.tag)
    }

    /// Release the lock now. Idempotent.
    pub fn release(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.locks.release(&ticket);
            tracing::debug!("{} released session lock on {}", ticket.backend, ticket.tag);
        }
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
