//! temdb Store
//!
//! The [`DocumentStore`] interface the integrity engine persists through,
//! and [`MemoryStore`], an in-process implementation used by tests and the
//! simulation binary.
//!
//! Production drivers implement the same trait; the engine never assumes
//! anything beyond point reads and writes, revision compare-and-swap,
//! equality queries on reference fields and atomic counters.

#![warn(unreachable_pub)]

mod error;
mod memory;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use store::{DocumentStore, Revision, StoredEntity};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
