//! Cadence Storage - Storage Traits and In-Memory Implementation
//!
//! Defines the two collaborator seams the engine reads and writes through:
//! the append-only event log ([`EventSource`]) and the per-entity-day rollup
//! tables plus watermarks ([`BucketStore`]). The relational implementation
//! lives with the application; [`MemoryStore`] here backs tests and
//! embedded use.

pub mod memory;
pub mod traits;

pub use memory::{MemoryStore, StoreStats};
pub use traits::{ActivitySlice, BucketStore, EntityDay, EventSource, StoreResult};
