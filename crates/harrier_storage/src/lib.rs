pub mod catalog;
pub mod heap;
pub mod index;
pub mod invalidation;

#[cfg(test)]
mod tests;

pub use catalog::{CatalogStore, IndexCatalogEntry, TableEntry};
pub use heap::{HeapStore, RowId, XidStatus};
pub use index::{HeapBuilder, IndexStore, PhysicalBuilder};
pub use invalidation::InvalidationBus;
