pub mod lock;
pub mod manager;
pub mod session;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use lock::{LockManager, LockTicket, SessionLockGuard};
pub use manager::{TxnManager, TxnStatus};
pub use session::Session;
pub use snapshot::{BackendSnapshotInfo, SnapshotTracker};
