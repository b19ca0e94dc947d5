//! temdb Model
//!
//! Entity kinds, identifiers and records of the TEM imaging pipeline.
//!
//! # Core Concepts
//!
//! - [`EntityKind`]: the closed set of pipeline stages
//! - [`REFERENCE_EDGES`]: the fixed foreign-key topology between kinds
//! - [`EntityId`] / [`HierarchicalId`]: stored keys and their dotted form
//! - [`Entity`]: any record, tagged by kind
//! - [`ScopeKey`]: the sibling scope of a sequence counter
//!
//! # Example
//!
//! ```rust
//! use temdb_model::{HierarchicalId, ROI_TAG};
//!
//! let section_path: HierarchicalId = "SPEC001.BLK001.SEC001.SUB001".parse().unwrap();
//! let roi = section_path.child_sequence(ROI_TAG, 2);
//! assert_eq!(roi.to_string(), "SPEC001.BLK001.SEC001.SUB001.ROI002");
//! ```

#![warn(unreachable_pub)]

mod entity;
mod id;
mod kind;
mod scope;
mod status;

pub use entity::{
    Acquisition, AcquisitionTask, Block, CuttingSession, Entity, Metadata, Roi, Section,
    Specimen, Substrate, Tile,
};
pub use id::{
    format_sequence, is_valid_segment, parse_section_id, parse_tile_id, section_id, tile_id,
    EntityId, HierarchicalId, IdError, SequenceSegment, SECTION_NUMBER_WIDTH, SEQUENCE_WIDTH,
    TILE_NUMBER_WIDTH,
};
pub use kind::{
    EntityKind, ReferenceEdge, ACQUISITION_TOKEN_PREFIX, BLOCK_TAG, CUTTING_SESSION_TAG,
    REFERENCE_EDGES, ROI_TAG, SECTION_TAG, SPECIMEN_TAG, SUBSTRATE_TAG, TASK_TOKEN_PREFIX,
};
pub use scope::ScopeKey;
pub use status::{AcquisitionPhase, AcquisitionStatus, TaskStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
