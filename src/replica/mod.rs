//! Read-optimized mirror of the inventory, kept current by applying events.

pub mod snapshot;
pub mod store;

pub use snapshot::{ReplicaSnapshot, SnapshotStore};
pub use store::{ApplyOutcome, CatalogEntry, InMemoryReplica, ReplicaStore};
