//! Entity kinds and the fixed reference topology
//!
//! The pipeline has a closed set of entity kinds connected by a fixed set of
//! foreign-key edges. [`REFERENCE_EDGES`] is the single source of truth for
//! both directions: resolving a child's parents and finding an entity's
//! dependents.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Sequence tag of specimen identifiers
pub const SPECIMEN_TAG: &str = "SPEC";
/// Sequence tag of block segments
pub const BLOCK_TAG: &str = "BLK";
/// Sequence tag of cutting-session segments
pub const CUTTING_SESSION_TAG: &str = "CUT";
/// Sequence tag of the section segment inside ROI identifiers
pub const SECTION_TAG: &str = "SEC";
/// Sequence tag of allocated substrate media ids
pub const SUBSTRATE_TAG: &str = "SUB";
/// Sequence tag of ROI segments
pub const ROI_TAG: &str = "ROI";
/// Token prefix of allocated acquisition task ids
pub const TASK_TOKEN_PREFIX: &str = "TASK";
/// Token prefix of allocated acquisition ids
pub const ACQUISITION_TOKEN_PREFIX: &str = "ACQ";

/// Pipeline stage of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Biological specimen (root)
    Specimen,
    /// Embedded block cut from a specimen
    Block,
    /// Sectioning run on a block
    CuttingSession,
    /// Physical medium sections are placed on (tape, wafer, grid)
    Substrate,
    /// Single section produced by a cutting session
    Section,
    /// Region of interest on a section
    Roi,
    /// Planned acquisition of an ROI
    AcquisitionTask,
    /// Imaging run executing a task
    Acquisition,
    /// Single image tile of an acquisition
    Tile,
}

impl EntityKind {
    /// Every kind, roots first
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Specimen,
        EntityKind::Block,
        EntityKind::CuttingSession,
        EntityKind::Substrate,
        EntityKind::Section,
        EntityKind::Roi,
        EntityKind::AcquisitionTask,
        EntityKind::Acquisition,
        EntityKind::Tile,
    ];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Specimen => "specimen",
            Self::Block => "block",
            Self::CuttingSession => "cutting_session",
            Self::Substrate => "substrate",
            Self::Section => "section",
            Self::Roi => "roi",
            Self::AcquisitionTask => "acquisition_task",
            Self::Acquisition => "acquisition",
            Self::Tile => "tile",
        }
    }

    /// Name of the field holding the entity's own identifier
    #[must_use]
    pub const fn id_field(self) -> &'static str {
        match self {
            Self::Specimen => "specimen_id",
            Self::Block => "block_id",
            Self::CuttingSession => "cutting_session_id",
            Self::Substrate => "media_id",
            Self::Section => "section_id",
            Self::Roi => "roi_id",
            Self::AcquisitionTask => "task_id",
            Self::Acquisition => "acquisition_id",
            Self::Tile => "tile_id",
        }
    }

    /// Whether identifiers of this kind are dotted hierarchical paths
    #[must_use]
    pub const fn is_hierarchical(self) -> bool {
        matches!(
            self,
            Self::Specimen | Self::Block | Self::CuttingSession | Self::Roi
        )
    }

    /// Whether this kind carries a lifecycle state machine
    #[must_use]
    pub const fn has_lifecycle(self) -> bool {
        matches!(self, Self::AcquisitionTask | Self::Acquisition)
    }

    /// Edges from this kind to the kinds it references
    pub fn references(self) -> impl Iterator<Item = &'static ReferenceEdge> {
        REFERENCE_EDGES.iter().filter(move |e| e.child == self)
    }

    /// Edges from other kinds that reference this kind
    pub fn dependents(self) -> impl Iterator<Item = &'static ReferenceEdge> {
        REFERENCE_EDGES.iter().filter(move |e| e.parent == self)
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A foreign-key field of `child` pointing at an entity of kind `parent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceEdge {
    /// Kind holding the field
    pub child: EntityKind,
    /// Field name
    pub field: &'static str,
    /// Kind the field points at
    pub parent: EntityKind,
    /// `false` if the field may be null
    pub required: bool,
}

impl ReferenceEdge {
    const fn required(child: EntityKind, field: &'static str, parent: EntityKind) -> Self {
        Self {
            child,
            field,
            parent,
            required: true,
        }
    }

    const fn optional(child: EntityKind, field: &'static str, parent: EntityKind) -> Self {
        Self {
            child,
            field,
            parent,
            required: false,
        }
    }
}

/// The fixed foreign-key topology of the pipeline
pub const REFERENCE_EDGES: &[ReferenceEdge] = &[
    ReferenceEdge::required(EntityKind::Block, "specimen_id", EntityKind::Specimen),
    ReferenceEdge::required(EntityKind::CuttingSession, "specimen_id", EntityKind::Specimen),
    ReferenceEdge::required(EntityKind::CuttingSession, "block_id", EntityKind::Block),
    ReferenceEdge::required(EntityKind::Section, "cutting_session_id", EntityKind::CuttingSession),
    ReferenceEdge::required(EntityKind::Section, "media_id", EntityKind::Substrate),
    ReferenceEdge::required(EntityKind::Roi, "section_id", EntityKind::Section),
    ReferenceEdge::optional(EntityKind::Roi, "parent_roi_id", EntityKind::Roi),
    ReferenceEdge::required(EntityKind::AcquisitionTask, "specimen_id", EntityKind::Specimen),
    ReferenceEdge::required(EntityKind::AcquisitionTask, "block_id", EntityKind::Block),
    ReferenceEdge::required(EntityKind::AcquisitionTask, "roi_id", EntityKind::Roi),
    ReferenceEdge::required(EntityKind::Acquisition, "specimen_id", EntityKind::Specimen),
    ReferenceEdge::required(EntityKind::Acquisition, "roi_id", EntityKind::Roi),
    ReferenceEdge::required(
        EntityKind::Acquisition,
        "acquisition_task_id",
        EntityKind::AcquisitionTask,
    ),
    ReferenceEdge::optional(
        EntityKind::Acquisition,
        "replaces_acquisition_id",
        EntityKind::Acquisition,
    ),
    ReferenceEdge::optional(
        EntityKind::Acquisition,
        "lens_correction_acquisition_id",
        EntityKind::Acquisition,
    ),
    ReferenceEdge::required(EntityKind::Tile, "acquisition_id", EntityKind::Acquisition),
];
