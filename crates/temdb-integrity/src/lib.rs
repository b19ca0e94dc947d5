//! temdb Integrity
//!
//! Reference-integrity engine for the TEM imaging pipeline's hierarchical
//! records (specimen → block → cutting session → section → ROI →
//! acquisition → tile).
//!
//! # Components
//!
//! - [`Allocator`]: per-scope sequence counters over the store's CAS
//! - [`Resolver`]: cached foreign-key resolution
//! - [`Validator`]: structural invariants of the entity graph
//! - [`Lifecycle`]: task and acquisition state machines
//! - [`Cascade`]: delete planning and execution
//! - [`IntegrityEngine`]: the write pipeline composing all of the above
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use temdb_integrity::{IntegrityConfig, IntegrityEngine};
//! use temdb_model::Metadata;
//! use temdb_store::MemoryStore;
//!
//! # async fn run() -> temdb_integrity::Result<()> {
//! let engine = IntegrityEngine::new(Arc::new(MemoryStore::new()), IntegrityConfig::default())?;
//! let specimen = engine.create_specimen(Metadata::new()).await?;
//! let block = engine.create_block(specimen.id(), Metadata::new()).await?;
//! assert_eq!(block.id().as_str(), "SPEC001.BLK001");
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod allocator;
pub mod cascade;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod resolver;
pub mod simulation;
pub mod validator;

pub use allocator::{roi_prefix, Allocation, Allocator};
pub use cascade::{Cascade, CascadeMode, CascadeReport, DeletePlan, EntityRef};
pub use clock::{Clock, SystemClock};
pub use config::{
    AllocationConfig, CacheConfig, ConfigError, HierarchyConfig, IntegrityConfig,
    LifecycleConfig,
};
pub use engine::{IntegrityEngine, Materialized, NewAcquisition, NewRoi, NewTask};
pub use error::{ErrorKind, IntegrityError, Result, Violation};
pub use lifecycle::{
    allowed_task_transitions, validate_task_transition, AcquisitionEvent, Lifecycle,
    LifecycleEvent, LifecycleState, TaskEvent, Transition, TransitionError,
};
pub use resolver::{
    Ancestry, EntityHandle, MaterializedReference, ParentChain, ReferenceTarget, Resolver,
    WalkEnd,
};
pub use validator::{check_sibling_sequences, ValidationContext, ValidationReport, Validator};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
