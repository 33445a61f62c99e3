//! Concurrent index DDL: build and rebuild indexes without blocking
//! readers or writers.
//!
//! Two protocols live here, both driven from a single session and both
//! relying on waiting out *other* sessions rather than excluding them:
//!
//!   - [`ConcurrentIndexBuilder`]: CREATE INDEX CONCURRENTLY. Creates the
//!     catalog entry with all flags false, then promotes it to `ready`
//!     and finally `valid` across three committed transactions, waiting
//!     out conflicting lock holders and older snapshots between
//!     promotions.
//!   - [`ReindexConcurrentCoordinator`]: REINDEX CONCURRENTLY. Builds a
//!     shadow index per rebuilt index, swaps catalog identities
//!     atomically, then retires and drops the originals, batching every
//!     wait across the whole job set.
//!
//! [`Engine`] wires the catalog, heap, lock manager and transaction
//! manager together and is the entry point for embedding and for tests.

pub mod create_index;
pub mod engine;
pub mod progress;
pub mod reindex;
pub mod waiter;


pub use create_index::ConcurrentIndexBuilder;
pub use engine::Engine;
pub use progress::{DdlOpKind, DdlOperation, DdlPhase, DdlProgressRegistry};
pub use reindex::{ReindexConcurrentCoordinator, ReindexTarget};
pub use waiter::OlderSnapshotWaiter;
