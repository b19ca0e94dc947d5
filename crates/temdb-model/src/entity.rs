//! Entity records
//!
//! One struct per [`EntityKind`], plus the [`Entity`] sum type the store and
//! the integrity engine pass around. Foreign keys are plain [`EntityId`]s;
//! nothing is dereferenced implicitly.

#![allow(missing_docs)]

use crate::id::{EntityId, HierarchicalId};
use crate::kind::{EntityKind, ReferenceEdge, ROI_TAG, SPECIMEN_TAG, SUBSTRATE_TAG};
use crate::scope::ScopeKey;
use crate::status::{AcquisitionPhase, AcquisitionStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque caller metadata, never inspected by the core
pub type Metadata = Map<String, Value>;

/// Root of every lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specimen {
    pub specimen_id: EntityId,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: EntityId,
    pub specimen_id: EntityId,
    pub block_number: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuttingSession {
    pub cutting_session_id: EntityId,
    pub specimen_id: EntityId,
    pub block_id: EntityId,
    pub session_number: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Physical medium (tape, wafer, grid); its own namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substrate {
    pub media_id: EntityId,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One section, linked to both its cutting session and its medium
///
/// `specimen_id` and `block_id` are denormalized from the cutting session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub section_id: EntityId,
    pub cutting_session_id: EntityId,
    pub media_id: EntityId,
    pub specimen_id: EntityId,
    pub block_id: EntityId,
    pub section_number: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Region of interest
///
/// The dotted `roi_id` is authoritative; `roi_number` repeats its last
/// segment's number for display. `hierarchy_level` is 1 for top-level ROIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub roi_id: EntityId,
    pub section_id: EntityId,
    #[serde(default)]
    pub parent_roi_id: Option<EntityId>,
    pub specimen_id: EntityId,
    pub block_id: EntityId,
    pub substrate_media_id: EntityId,
    pub section_number: u64,
    pub roi_number: u64,
    pub hierarchy_level: u32,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionTask {
    pub task_id: EntityId,
    pub specimen_id: EntityId,
    pub block_id: EntityId,
    pub roi_id: EntityId,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by every status change; 1 on creation
    #[serde(default = "first_version")]
    pub version: u32,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Imaging run
///
/// The phase is derived from `start_time`/`end_time`; `status` records the
/// outcome. A replacing acquisition carries the replaced one's version + 1.
/// Lens-correction runs calibrate the microscope; ordinary runs point at
/// the one they were corrected with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub acquisition_id: EntityId,
    pub specimen_id: EntityId,
    pub roi_id: EntityId,
    pub acquisition_task_id: EntityId,
    #[serde(default)]
    pub status: AcquisitionStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replaces_acquisition_id: Option<EntityId>,
    #[serde(default)]
    pub lens_correction: bool,
    #[serde(default)]
    pub lens_correction_acquisition_id: Option<EntityId>,
    pub version: u32,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Acquisition {
    /// Phase derived from timestamp presence
    #[must_use]
    pub fn phase(&self) -> AcquisitionPhase {
        match (self.start_time, self.end_time) {
            (_, Some(_)) => AcquisitionPhase::Finished,
            (Some(_), None) => AcquisitionPhase::Imaging,
            (None, None) => AcquisitionPhase::Planned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub tile_id: EntityId,
    pub acquisition_id: EntityId,
    pub tile_number: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Any entity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Specimen(Specimen),
    Block(Block),
    CuttingSession(CuttingSession),
    Substrate(Substrate),
    Section(Section),
    Roi(Roi),
    AcquisitionTask(AcquisitionTask),
    Acquisition(Acquisition),
    Tile(Tile),
}

macro_rules! each_record {
    ($entity:expr, $rec:ident => $body:expr) => {
        match $entity {
            Entity::Specimen($rec) => $body,
            Entity::Block($rec) => $body,
            Entity::CuttingSession($rec) => $body,
            Entity::Substrate($rec) => $body,
            Entity::Section($rec) => $body,
            Entity::Roi($rec) => $body,
            Entity::AcquisitionTask($rec) => $body,
            Entity::Acquisition($rec) => $body,
            Entity::Tile($rec) => $body,
        }
    };
}

impl Entity {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Specimen(_) => EntityKind::Specimen,
            Self::Block(_) => EntityKind::Block,
            Self::CuttingSession(_) => EntityKind::CuttingSession,
            Self::Substrate(_) => EntityKind::Substrate,
            Self::Section(_) => EntityKind::Section,
            Self::Roi(_) => EntityKind::Roi,
            Self::AcquisitionTask(_) => EntityKind::AcquisitionTask,
            Self::Acquisition(_) => EntityKind::Acquisition,
            Self::Tile(_) => EntityKind::Tile,
        }
    }

    /// The entity's own identifier
    #[must_use]
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Specimen(r) => &r.specimen_id,
            Self::Block(r) => &r.block_id,
            Self::CuttingSession(r) => &r.cutting_session_id,
            Self::Substrate(r) => &r.media_id,
            Self::Section(r) => &r.section_id,
            Self::Roi(r) => &r.roi_id,
            Self::AcquisitionTask(r) => &r.task_id,
            Self::Acquisition(r) => &r.acquisition_id,
            Self::Tile(r) => &r.tile_id,
        }
    }

    /// Value of a reference field; `None` if null or not a field of this kind
    #[must_use]
    pub fn reference(&self, field: &str) -> Option<&EntityId> {
        match (self, field) {
            (Self::Block(r), "specimen_id") => Some(&r.specimen_id),
            (Self::CuttingSession(r), "specimen_id") => Some(&r.specimen_id),
            (Self::CuttingSession(r), "block_id") => Some(&r.block_id),
            (Self::Section(r), "cutting_session_id") => Some(&r.cutting_session_id),
            (Self::Section(r), "media_id") => Some(&r.media_id),
            (Self::Section(r), "specimen_id") => Some(&r.specimen_id),
            (Self::Section(r), "block_id") => Some(&r.block_id),
            (Self::Roi(r), "section_id") => Some(&r.section_id),
            (Self::Roi(r), "parent_roi_id") => r.parent_roi_id.as_ref(),
            (Self::Roi(r), "specimen_id") => Some(&r.specimen_id),
            (Self::Roi(r), "block_id") => Some(&r.block_id),
            (Self::AcquisitionTask(r), "specimen_id") => Some(&r.specimen_id),
            (Self::AcquisitionTask(r), "block_id") => Some(&r.block_id),
            (Self::AcquisitionTask(r), "roi_id") => Some(&r.roi_id),
            (Self::Acquisition(r), "specimen_id") => Some(&r.specimen_id),
            (Self::Acquisition(r), "roi_id") => Some(&r.roi_id),
            (Self::Acquisition(r), "acquisition_task_id") => Some(&r.acquisition_task_id),
            (Self::Acquisition(r), "replaces_acquisition_id") => {
                r.replaces_acquisition_id.as_ref()
            }
            (Self::Acquisition(r), "lens_correction_acquisition_id") => {
                r.lens_correction_acquisition_id.as_ref()
            }
            (Self::Tile(r), "acquisition_id") => Some(&r.acquisition_id),
            _ => None,
        }
    }

    /// Every reference edge of this kind with the field's current value
    pub fn edges(&self) -> impl Iterator<Item = (&'static ReferenceEdge, Option<&EntityId>)> {
        self.kind()
            .references()
            .map(move |edge| (edge, self.reference(edge.field)))
    }

    /// Sibling scope this entity's sequence number belongs to
    #[must_use]
    pub fn scope(&self) -> Option<ScopeKey> {
        match self {
            Self::Specimen(_) => Some(ScopeKey::global(EntityKind::Specimen)),
            Self::Substrate(_) => self
                .sequence_number()
                .map(|_| ScopeKey::global(EntityKind::Substrate)),
            Self::Block(r) => Some(ScopeKey::under(
                EntityKind::Block,
                "specimen_id",
                r.specimen_id.clone(),
            )),
            Self::CuttingSession(r) => Some(ScopeKey::under(
                EntityKind::CuttingSession,
                "block_id",
                r.block_id.clone(),
            )),
            Self::Section(r) => Some(ScopeKey::under(
                EntityKind::Section,
                "cutting_session_id",
                r.cutting_session_id.clone(),
            )),
            Self::Roi(r) => Some(match &r.parent_roi_id {
                Some(parent) => ScopeKey::under(EntityKind::Roi, "parent_roi_id", parent.clone()),
                None => ScopeKey::under(EntityKind::Roi, "section_id", r.section_id.clone()),
            }),
            Self::Tile(r) => Some(ScopeKey::under(
                EntityKind::Tile,
                "acquisition_id",
                r.acquisition_id.clone(),
            )),
            Self::AcquisitionTask(_) | Self::Acquisition(_) => None,
        }
    }

    /// Sequence number within [`Entity::scope`]
    ///
    /// Specimens and allocated substrates carry it only in their identifier.
    /// Caller-named substrates have none.
    #[must_use]
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Self::Specimen(r) => trailing(&r.specimen_id, SPECIMEN_TAG),
            Self::Substrate(r) => trailing(&r.media_id, SUBSTRATE_TAG),
            Self::Block(r) => Some(r.block_number),
            Self::CuttingSession(r) => Some(r.session_number),
            Self::Section(r) => Some(r.section_number),
            Self::Roi(r) => Some(r.roi_number),
            Self::Tile(r) => Some(r.tile_number),
            Self::AcquisitionTask(_) | Self::Acquisition(_) => None,
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        each_record!(self, r => &r.metadata)
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        each_record!(self, r => r.created_at)
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        each_record!(self, r => r.updated_at)
    }

    /// Replace metadata and bump `updated_at` (never earlier than before)
    pub fn set_metadata(&mut self, metadata: Metadata, now: DateTime<Utc>) {
        each_record!(self, r => {
            r.metadata = metadata;
            r.updated_at = now.max(r.updated_at);
        });
    }

    /// Bump `updated_at` (never earlier than before)
    pub fn touch(&mut self, now: DateTime<Utc>) {
        each_record!(self, r => r.updated_at = now.max(r.updated_at));
    }

    /// Number of `ROI` segments for ROIs; `None` for other kinds
    #[must_use]
    pub fn roi_depth(&self) -> Option<usize> {
        self.as_roi()
            .and_then(|r| r.roi_id.hierarchical().ok())
            .map(|h| h.count_tag(ROI_TAG))
    }

    #[must_use]
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Self::Block(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_cutting_session(&self) -> Option<&CuttingSession> {
        match self {
            Self::CuttingSession(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_section(&self) -> Option<&Section> {
        match self {
            Self::Section(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_roi(&self) -> Option<&Roi> {
        match self {
            Self::Roi(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_task(&self) -> Option<&AcquisitionTask> {
        match self {
            Self::AcquisitionTask(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_acquisition(&self) -> Option<&Acquisition> {
        match self {
            Self::Acquisition(r) => Some(r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_tile(&self) -> Option<&Tile> {
        match self {
            Self::Tile(r) => Some(r),
            _ => None,
        }
    }
}

fn first_version() -> u32 {
    1
}

fn trailing(id: &EntityId, tag: &str) -> Option<u64> {
    id.as_str()
        .parse::<HierarchicalId>()
        .ok()
        .filter(|h| h.len() == 1)
        .and_then(|h| h.trailing_sequence(tag))
}

macro_rules! impl_from_record {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Entity {
                fn from(record: $variant) -> Self {
                    Entity::$variant(record)
                }
            }
        )*
    };
}

impl_from_record!(
    Specimen,
    Block,
    CuttingSession,
    Substrate,
    Section,
    Roi,
    AcquisitionTask,
    Acquisition,
    Tile,
);
