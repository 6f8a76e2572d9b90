//! Event-driven replication of a book inventory into a read-optimized catalog.
//!
//! The inventory-of-record publishes a [`BookEvent`] to a durable fan-out
//! exchange after every committed change; each catalog instance binds its own
//! exclusive queue and applies what it receives to a local replica.
//!
//! ```text
//! Inventory ──► EventPublisher ──► ConnectionManager ──► [book_events] (fanout)
//!                                                              │
//!                               ReplicaStore ◄── EventConsumer ◄┘ (exclusive queue)
//! ```
//!
//! The replica converges under ordered delivery but may be briefly stale,
//! and misses whatever is published while its consumer is disconnected.

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod inventory;
pub mod replica;
pub mod resilience;
pub mod service;

pub use broker::{ConnectionManager, EventConsumer, EventPublisher};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{BookEvent, BookSnapshot, EventKind};
pub use inventory::Inventory;
pub use replica::{CatalogEntry, InMemoryReplica, ReplicaStore};
pub use service::ReplicaService;
