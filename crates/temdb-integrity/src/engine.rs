//! The write pipeline
//!
//! [`IntegrityEngine`] composes the allocator, resolver, validator,
//! lifecycle driver and cascade coordinator. Every create runs
//! resolve → allocate → validate → insert; a rejected candidate leaves at
//! most a gap in a counter, never a half-written record.

use crate::allocator::{Allocation, Allocator};
use crate::cascade::{Cascade, CascadeMode, CascadeReport, DeletePlan};
use crate::clock::{Clock, SystemClock};
use crate::config::IntegrityConfig;
use crate::error::{IntegrityError, Result};
use crate::lifecycle::{check_replacement_target, Lifecycle, LifecycleEvent, Transition};
use crate::resolver::{
    EntityHandle, MaterializedReference, ParentChain, ReferenceTarget, Resolver,
};
use crate::validator::{ValidationContext, ValidationReport, Validator};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use temdb_model::{
    Acquisition, AcquisitionPhase, AcquisitionStatus, AcquisitionTask, Block, CuttingSession, Entity, EntityId,
    EntityKind, Metadata, Roi, ScopeKey, Section, Specimen, Substrate, TaskStatus, Tile,
};
use temdb_store::{DocumentStore, StoreError, StoredEntity};
use tracing::{debug, info, warn};

/// Request to create an acquisition task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Caller-chosen identifier; a `TASK_` token is minted if absent
    #[serde(default)]
    pub task_id: Option<EntityId>,
    /// Specimen the ROI belongs to
    pub specimen_id: EntityId,
    /// Block the ROI belongs to
    pub block_id: EntityId,
    /// ROI to image
    pub roi_id: EntityId,
    /// Opaque caller data
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTask {
    /// Task on `roi_id` in the given lineage
    #[must_use]
    pub fn new(specimen_id: EntityId, block_id: EntityId, roi_id: EntityId) -> Self {
        Self {
            task_id: None,
            specimen_id,
            block_id,
            roi_id,
            metadata: Metadata::new(),
        }
    }

    /// Use a caller-chosen identifier
    #[must_use]
    pub fn with_id(mut self, task_id: impl Into<EntityId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Replace the metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Request to create an acquisition
///
/// Specimen and ROI are taken from the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAcquisition {
    /// Caller-chosen identifier; an `ACQ_` token is minted if absent
    #[serde(default)]
    pub acquisition_id: Option<EntityId>,
    /// Task the run executes
    pub acquisition_task_id: EntityId,
    /// Finished acquisition this one re-images
    #[serde(default)]
    pub replaces_acquisition_id: Option<EntityId>,
    /// Whether this run is a lens correction
    #[serde(default)]
    pub lens_correction: bool,
    /// Lens-correction run this acquisition is corrected with
    #[serde(default)]
    pub lens_correction_acquisition_id: Option<EntityId>,
    /// Opaque caller data
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewAcquisition {
    /// Acquisition for `task_id`
    #[must_use]
    pub fn new(task_id: EntityId) -> Self {
        Self {
            acquisition_id: None,
            acquisition_task_id: task_id,
            replaces_acquisition_id: None,
            lens_correction: false,
            lens_correction_acquisition_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Use a caller-chosen identifier
    #[must_use]
    pub fn with_id(mut self, acquisition_id: impl Into<EntityId>) -> Self {
        self.acquisition_id = Some(acquisition_id.into());
        self
    }

    /// Mark as a re-imaging of `target`
    #[must_use]
    pub fn replacing(mut self, target: EntityId) -> Self {
        self.replaces_acquisition_id = Some(target);
        self
    }

    /// Mark as a lens-correction run
    #[must_use]
    pub fn as_lens_correction(mut self) -> Self {
        self.lens_correction = true;
        self
    }

    /// Attach the lens-correction run `correction`
    #[must_use]
    pub fn corrected_by(mut self, correction: EntityId) -> Self {
        self.lens_correction_acquisition_id = Some(correction);
        self
    }

    /// Replace the metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Request to create an ROI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRoi {
    /// Section the ROI is drawn on
    pub section_id: EntityId,
    /// Enclosing ROI; top level if absent
    #[serde(default)]
    pub parent_roi_id: Option<EntityId>,
    /// Opaque caller data
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewRoi {
    /// Top-level ROI on `section_id`
    #[must_use]
    pub fn new(section_id: EntityId) -> Self {
        Self {
            section_id,
            parent_roi_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Nest under `parent`
    #[must_use]
    pub fn under(mut self, parent: EntityId) -> Self {
        self.parent_roi_id = Some(parent);
        self
    }
}

/// A record with every reference resolved or annotated
#[derive(Debug, Clone)]
pub struct Materialized {
    /// The record itself
    pub record: EntityHandle,
    /// One entry per reference field, in edge order
    pub references: Vec<MaterializedReference>,
}

impl Materialized {
    /// Check if any non-null reference points at an absent record
    #[must_use]
    pub fn has_missing(&self) -> bool {
        self.references
            .iter()
            .any(|r| matches!(r.target, ReferenceTarget::Missing(_)))
    }
}

/// Façade over the integrity components
#[derive(Clone)]
pub struct IntegrityEngine {
    store: Arc<dyn DocumentStore>,
    resolver: Resolver,
    allocator: Allocator,
    validator: Validator,
    lifecycle: Lifecycle,
    cascade: Cascade,
    clock: Arc<dyn Clock>,
    config: IntegrityConfig,
}

impl std::fmt::Debug for IntegrityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityEngine")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl IntegrityEngine {
    /// Create an engine over `store` using the wall clock
    ///
    /// # Errors
    /// [`IntegrityError::Config`] if `config` does not validate.
    pub fn new(store: Arc<dyn DocumentStore>, config: IntegrityConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit time source
    ///
    /// # Errors
    /// [`IntegrityError::Config`] if `config` does not validate.
    pub fn with_clock(
        store: Arc<dyn DocumentStore>,
        config: IntegrityConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let resolver = Resolver::new(Arc::clone(&store), config.cache.capacity);
        let allocator = Allocator::new(Arc::clone(&store), config.allocation.clone());
        let validator = Validator::new(config.hierarchy.max_roi_depth);
        let lifecycle = Lifecycle::new(
            Arc::clone(&store),
            resolver.clone(),
            Arc::clone(&clock),
            config.lifecycle.clone(),
        );
        let cascade = Cascade::new(Arc::clone(&store), resolver.clone(), lifecycle.clone());

        Ok(Self {
            store,
            resolver,
            allocator,
            validator,
            lifecycle,
            cascade,
            clock,
            config,
        })
    }

    /// Cached reference resolver
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Sequence allocator
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Structural validator
    #[must_use]
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Status state machines
    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Delete coordinator
    #[must_use]
    pub fn cascade(&self) -> &Cascade {
        &self.cascade
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &IntegrityConfig {
        &self.config
    }

    /// Create a specimen with the next global number
    ///
    /// # Errors
    /// Allocation, validation or store errors.
    pub async fn create_specimen(&self, metadata: Metadata) -> Result<StoredEntity> {
        let allocation = self
            .allocator
            .allocate(EntityKind::Specimen, &ParentChain::new())
            .await?;
        let now = self.clock.now();
        let specimen = Specimen {
            specimen_id: allocation.id,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(specimen.into()).await
    }

    /// Create the next block of `specimen_id`
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if the specimen is absent,
    /// allocation, validation or store errors.
    pub async fn create_block(
        &self,
        specimen_id: &EntityId,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let specimen = self.resolver.resolve(EntityKind::Specimen, specimen_id).await?;
        let parents = ParentChain::new().with("specimen_id", specimen);
        let allocation = self.allocator.allocate(EntityKind::Block, &parents).await?;
        let now = self.clock.now();
        let block = Block {
            block_number: sequence(&allocation),
            block_id: allocation.id,
            specimen_id: specimen_id.clone(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(block.into()).await
    }

    /// Create the next cutting session of `block_id`
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if the block is absent,
    /// allocation, validation or store errors.
    pub async fn create_cutting_session(
        &self,
        block_id: &EntityId,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let block = self.resolver.resolve(EntityKind::Block, block_id).await?;
        let specimen_id = match &block.entity {
            Entity::Block(b) => b.specimen_id.clone(),
            _ => return Err(not_found(EntityKind::Block, block_id)),
        };
        let parents = ParentChain::new().with("block_id", block);
        let allocation = self
            .allocator
            .allocate(EntityKind::CuttingSession, &parents)
            .await?;
        let now = self.clock.now();
        let session = CuttingSession {
            session_number: sequence(&allocation),
            cutting_session_id: allocation.id,
            specimen_id,
            block_id: block_id.clone(),
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(session.into()).await
    }

    /// Create a substrate, either caller-named or as the next `SUB` number
    ///
    /// A caller-supplied `media_id` must be a single identifier segment.
    ///
    /// # Errors
    /// [`IntegrityError::IdentifierTaken`] if `media_id` exists, validation
    /// or store errors.
    pub async fn create_substrate(
        &self,
        media_id: Option<EntityId>,
        media_type: Option<String>,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let caller_named = media_id.is_some();
        let media_id = match media_id {
            Some(id) => id,
            None => {
                self.allocator
                    .allocate(EntityKind::Substrate, &ParentChain::new())
                    .await?
                    .id
            }
        };
        let now = self.clock.now();
        let substrate = Entity::from(Substrate {
            media_id,
            media_type,
            metadata,
            created_at: now,
            updated_at: now,
        });
        let stored = self.create(substrate).await?;
        if caller_named {
            self.advance_counter(&stored.entity).await?;
        }
        Ok(stored)
    }

    /// Create the next section of a cutting session on medium `media_id`
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if either parent is absent,
    /// allocation, validation or store errors.
    pub async fn create_section(
        &self,
        cutting_session_id: &EntityId,
        media_id: &EntityId,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let session = self
            .resolver
            .resolve(EntityKind::CuttingSession, cutting_session_id)
            .await?;
        let substrate = self.resolver.resolve(EntityKind::Substrate, media_id).await?;
        let (specimen_id, block_id) = match &session.entity {
            Entity::CuttingSession(c) => (c.specimen_id.clone(), c.block_id.clone()),
            _ => return Err(not_found(EntityKind::CuttingSession, cutting_session_id)),
        };
        let parents = ParentChain::new()
            .with("cutting_session_id", session)
            .with("media_id", substrate);
        let allocation = self.allocator.allocate(EntityKind::Section, &parents).await?;
        let now = self.clock.now();
        let section = Section {
            section_number: sequence(&allocation),
            section_id: allocation.id,
            cutting_session_id: cutting_session_id.clone(),
            media_id: media_id.clone(),
            specimen_id,
            block_id,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(section.into()).await
    }

    /// Create an ROI on `section_id`, top level or under `parent_roi_id`
    ///
    /// Denormalized lineage fields and `hierarchy_level` are derived from
    /// the parent ROI or the section.
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if a parent is absent,
    /// allocation, validation or store errors.
    pub async fn create_roi(
        &self,
        section_id: &EntityId,
        parent_roi_id: Option<&EntityId>,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let section_handle = self.resolver.resolve(EntityKind::Section, section_id).await?;
        let Entity::Section(section) = &section_handle.entity else {
            return Err(not_found(EntityKind::Section, section_id));
        };
        let mut parents = ParentChain::new().with("section_id", Arc::clone(&section_handle));
        let mut level = 1;

        if let Some(parent_id) = parent_roi_id {
            let parent_handle = self.resolver.resolve(EntityKind::Roi, parent_id).await?;
            if let Entity::Roi(parent) = &parent_handle.entity {
                level = parent.hierarchy_level.saturating_add(1);
            }
            parents = parents.with("parent_roi_id", parent_handle);
        }

        let allocation = self.allocator.allocate(EntityKind::Roi, &parents).await?;
        let now = self.clock.now();
        let roi = Roi {
            roi_number: sequence(&allocation),
            roi_id: allocation.id,
            section_id: section_id.clone(),
            parent_roi_id: parent_roi_id.cloned(),
            specimen_id: section.specimen_id.clone(),
            block_id: section.block_id.clone(),
            substrate_media_id: section.media_id.clone(),
            section_number: section.section_number,
            hierarchy_level: level,
            metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(roi.into()).await
    }

    /// Create one acquisition task in state `created`
    ///
    /// # Errors
    /// [`IntegrityError::IdentifierTaken`] for a duplicate `task_id`,
    /// validation (including lineage consistency) or store errors.
    pub async fn create_task(&self, request: NewTask) -> Result<StoredEntity> {
        let task = self.draft_task(request).await?;
        self.create(task).await
    }

    /// Create several tasks, all or nothing
    ///
    /// Every candidate is validated before the first insert; duplicate
    /// identifiers within the batch or against the store reject the whole
    /// batch. If an insert still fails, tasks inserted so far are removed.
    ///
    /// # Errors
    /// The first validation or store error.
    pub async fn create_tasks_batch(&self, requests: Vec<NewTask>) -> Result<Vec<StoredEntity>> {
        let mut drafts = Vec::with_capacity(requests.len());
        let mut seen = HashSet::with_capacity(requests.len());
        for request in requests {
            let draft = self.draft_task(request).await?;
            if !seen.insert(draft.id().clone()) {
                return Err(IntegrityError::IdentifierTaken {
                    kind: EntityKind::AcquisitionTask,
                    id: draft.id().clone(),
                });
            }
            drafts.push(draft);
        }

        let ids: Vec<EntityId> = drafts.iter().map(|d| d.id().clone()).collect();
        let existing = self
            .store
            .get_many(EntityKind::AcquisitionTask, &ids)
            .await?;
        if let Some(id) = ids.iter().find(|id| existing.contains_key(*id)) {
            return Err(IntegrityError::IdentifierTaken {
                kind: EntityKind::AcquisitionTask,
                id: id.clone(),
            });
        }

        for draft in &drafts {
            let ctx = self.context_for(draft, false).await?;
            self.validator.validate(draft, &ctx).into_result(draft)?;
        }

        let mut committed = Vec::with_capacity(drafts.len());
        for draft in drafts {
            match self.insert(draft).await {
                Ok(stored) => committed.push(stored),
                Err(e) => {
                    warn!(inserted = committed.len(), error = %e, "task batch failed, rolling back");
                    self.roll_back(&committed).await?;
                    return Err(e);
                }
            }
        }
        info!(count = committed.len(), "task batch committed");
        Ok(committed)
    }

    /// Create several ROIs in order, all or nothing
    ///
    /// A request may nest under an ROI created earlier in the same batch.
    /// If any create fails, ROIs created so far are removed again; numbers
    /// they consumed stay consumed.
    ///
    /// # Errors
    /// The first failing create's error.
    pub async fn create_rois_batch(&self, requests: Vec<NewRoi>) -> Result<Vec<StoredEntity>> {
        let mut committed = Vec::with_capacity(requests.len());
        for request in requests {
            let created = self
                .create_roi(
                    &request.section_id,
                    request.parent_roi_id.as_ref(),
                    request.metadata,
                )
                .await;
            match created {
                Ok(stored) => committed.push(stored),
                Err(e) => {
                    warn!(inserted = committed.len(), error = %e, "ROI batch failed, rolling back");
                    self.roll_back(&committed).await?;
                    return Err(e);
                }
            }
        }
        info!(count = committed.len(), "ROI batch committed");
        Ok(committed)
    }

    /// Create an acquisition of a task, optionally replacing a finished one
    ///
    /// A replacement takes the target's version + 1 and holds the target's
    /// single successor slot until it is deleted.
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] for an absent task or target,
    /// [`IntegrityError::ReplacementTargetActive`],
    /// [`IntegrityError::ReplacementConflict`], validation or store errors.
    pub async fn create_acquisition(&self, request: NewAcquisition) -> Result<StoredEntity> {
        let task_handle = self
            .resolver
            .resolve(EntityKind::AcquisitionTask, &request.acquisition_task_id)
            .await?;
        let Entity::AcquisitionTask(task) = &task_handle.entity else {
            return Err(not_found(
                EntityKind::AcquisitionTask,
                &request.acquisition_task_id,
            ));
        };

        let mut version = 1;
        if let Some(target_id) = &request.replaces_acquisition_id {
            let target = self
                .resolver
                .fetch_fresh(EntityKind::Acquisition, target_id)
                .await?
                .ok_or_else(|| not_found(EntityKind::Acquisition, target_id))?;
            if let Entity::Acquisition(target) = &target.entity {
                check_replacement_target(target)?;
                version = target.version.saturating_add(1);
            }
        }

        let acquisition_id = match request.acquisition_id {
            Some(id) => id,
            None => {
                self.allocator
                    .allocate(EntityKind::Acquisition, &ParentChain::new())
                    .await?
                    .id
            }
        };
        let now = self.clock.now();
        let acquisition = Acquisition {
            acquisition_id,
            specimen_id: task.specimen_id.clone(),
            roi_id: task.roi_id.clone(),
            acquisition_task_id: request.acquisition_task_id,
            status: AcquisitionStatus::Imaging,
            start_time: None,
            end_time: None,
            replaces_acquisition_id: request.replaces_acquisition_id,
            lens_correction: request.lens_correction,
            lens_correction_acquisition_id: request.lens_correction_acquisition_id,
            version,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        self.create(acquisition.into()).await
    }

    /// Append `tiles.len()` tiles to an acquisition with one counter swap
    ///
    /// Tiles exist only once imaging has begun. The append is all or
    /// nothing: if an insert fails, tiles written by this call are removed
    /// and their reserved numbers stay consumed.
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if the acquisition is absent,
    /// [`IntegrityError::IllegalTransition`] while it is still planned,
    /// allocation, validation or store errors.
    pub async fn append_tiles(
        &self,
        acquisition_id: &EntityId,
        tiles: Vec<Metadata>,
    ) -> Result<Vec<StoredEntity>> {
        if tiles.is_empty() {
            return Ok(Vec::new());
        }
        let acquisition = self
            .resolver
            .resolve(EntityKind::Acquisition, acquisition_id)
            .await?;
        if let Some(record) = acquisition.entity.as_acquisition() {
            let phase = record.phase();
            if phase == AcquisitionPhase::Planned {
                return Err(IntegrityError::IllegalTransition {
                    kind: EntityKind::Acquisition,
                    id: acquisition_id.clone(),
                    state: phase.to_string(),
                    event: "append_tiles".to_string(),
                });
            }
        }
        let parents = ParentChain::new().with("acquisition_id", acquisition);
        let ctx = ValidationContext::new(parents);

        let scope = ScopeKey::under(EntityKind::Tile, "acquisition_id", acquisition_id.clone());
        let numbers = self
            .allocator
            .reserve(&scope, tiles.len() as u64)
            .await?;
        debug!(%scope, first = numbers.start(), last = numbers.end(), "tile range reserved");

        let now = self.clock.now();
        let mut committed = Vec::with_capacity(tiles.len());
        for (tile_number, metadata) in numbers.zip(tiles) {
            let tile = Entity::from(Tile {
                tile_id: temdb_model::tile_id(acquisition_id, tile_number),
                acquisition_id: acquisition_id.clone(),
                tile_number,
                metadata,
                created_at: now,
                updated_at: now,
            });
            let written = match self.validator.validate(&tile, &ctx).into_result(&tile) {
                Ok(()) => self.insert(tile).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(stored) => committed.push(stored),
                Err(e) => {
                    warn!(%acquisition_id, inserted = committed.len(), error = %e, "tile append failed, rolling back");
                    self.roll_back(&committed).await?;
                    return Err(e);
                }
            }
        }
        info!(%acquisition_id, count = committed.len(), "tiles appended");
        Ok(committed)
    }

    /// Insert a record with caller-supplied identifiers
    ///
    /// The record is fully validated, including sibling-sequence uniqueness,
    /// and the scope counter is advanced past its number.
    ///
    /// # Errors
    /// [`IntegrityError::Validation`], [`IntegrityError::IdentifierTaken`],
    /// replacement errors for acquisitions, or store errors.
    pub async fn import(&self, entity: Entity) -> Result<StoredEntity> {
        let ctx = self.context_for(&entity, true).await?;
        let stored = self.commit(entity, &ctx).await?;
        self.advance_counter(&stored.entity).await?;
        Ok(stored)
    }

    /// Validate a candidate without writing it
    ///
    /// # Errors
    /// Store errors while resolving the context.
    pub async fn check(&self, entity: &Entity) -> Result<ValidationReport> {
        let ctx = self.context_for(entity, true).await?;
        Ok(self.validator.validate(entity, &ctx))
    }

    /// Replace the metadata of a record
    ///
    /// Identifiers and references never change; the record's references
    /// are re-resolved before the write.
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if the record is absent,
    /// [`IntegrityError::Validation`] if a parent disappeared,
    /// [`IntegrityError::ConcurrentModification`] after repeated conflicts.
    pub async fn update_metadata(
        &self,
        kind: EntityKind,
        id: &EntityId,
        metadata: Metadata,
    ) -> Result<StoredEntity> {
        let attempts = self.config.lifecycle.max_update_attempts;
        for attempt in 0..attempts {
            let fresh = self
                .resolver
                .fetch_fresh(kind, id)
                .await?
                .ok_or_else(|| not_found(kind, id))?;
            let mut entity = fresh.entity;
            entity.set_metadata(metadata.clone(), self.clock.now());

            let parents = self.resolver.resolve_parents(&entity).await?;
            let ctx = ValidationContext::new(parents);
            self.validator.validate(&entity, &ctx).into_result(&entity)?;

            match self.store.update(entity.clone(), fresh.revision).await {
                Ok(revision) => {
                    self.resolver.invalidate(kind, id).await;
                    info!(%kind, %id, %revision, "metadata updated");
                    return Ok(StoredEntity { entity, revision });
                }
                Err(StoreError::RevisionConflict { .. }) => {
                    debug!(%kind, %id, attempt, "metadata update conflict, re-reading");
                }
                Err(StoreError::NotFound { .. }) => {
                    self.resolver.invalidate(kind, id).await;
                    return Err(not_found(kind, id));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(IntegrityError::ConcurrentModification {
            kind,
            id: id.clone(),
            attempts,
        })
    }

    /// Apply a lifecycle event to a task or acquisition
    ///
    /// # Errors
    /// See [`Lifecycle::transition`].
    pub async fn transition(
        &self,
        id: &EntityId,
        event: impl Into<LifecycleEvent>,
    ) -> Result<Transition> {
        self.lifecycle.transition(id, event).await
    }

    /// Delete a record, rejecting or cascading over its dependents
    ///
    /// # Errors
    /// See [`Cascade::cascade_delete`].
    pub async fn delete(
        &self,
        kind: EntityKind,
        id: &EntityId,
        mode: CascadeMode,
    ) -> Result<CascadeReport> {
        self.cascade.cascade_delete(kind, id, mode).await
    }

    /// Ordered cascade plan for a record
    ///
    /// # Errors
    /// See [`Cascade::plan_delete`].
    pub async fn plan_delete(&self, kind: EntityKind, id: &EntityId) -> Result<DeletePlan> {
        self.cascade.plan_delete(kind, id).await
    }

    /// Read a record through the cache
    ///
    /// # Errors
    /// Store errors only.
    pub async fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<EntityHandle>> {
        self.resolver.try_resolve(kind, id).await
    }

    /// Read a task, optionally pinned to one version
    ///
    /// Only the latest version is kept, so asking for any other version
    /// reads as absent.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn get_task(
        &self,
        task_id: &EntityId,
        version: Option<u32>,
    ) -> Result<Option<EntityHandle>> {
        let Some(handle) = self
            .resolver
            .try_resolve(EntityKind::AcquisitionTask, task_id)
            .await?
        else {
            return Ok(None);
        };
        let current = match &handle.entity {
            Entity::AcquisitionTask(task) => task.version,
            _ => return Ok(None),
        };
        Ok(match version {
            Some(wanted) if wanted != current => None,
            _ => Some(handle),
        })
    }

    /// Acquisitions with no usable lens correction
    ///
    /// Lens-correction runs themselves are never orphans. An acquisition
    /// is orphaned when its correction link is null or names a run that
    /// no longer exists.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn find_orphan_acquisitions(&self) -> Result<Vec<StoredEntity>> {
        let acquisitions = self.store.list(EntityKind::Acquisition).await?;
        let linked: Vec<EntityId> = acquisitions
            .iter()
            .filter_map(|stored| stored.entity.as_acquisition())
            .filter_map(|acq| acq.lens_correction_acquisition_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let present = self
            .store
            .get_many(EntityKind::Acquisition, &linked)
            .await?;

        let orphans: Vec<StoredEntity> = acquisitions
            .into_iter()
            .filter(|stored| match stored.entity.as_acquisition() {
                Some(acq) if !acq.lens_correction => acq
                    .lens_correction_acquisition_id
                    .as_ref()
                    .map_or(true, |id| !present.contains_key(id)),
                _ => false,
            })
            .collect();
        debug!(count = orphans.len(), "orphan acquisitions listed");
        Ok(orphans)
    }

    /// Acquisitions corrected with the lens-correction run `correction_id`
    ///
    /// # Errors
    /// Store errors only.
    pub async fn acquisitions_corrected_by(
        &self,
        correction_id: &EntityId,
    ) -> Result<Vec<StoredEntity>> {
        Ok(self
            .store
            .find_by_reference(
                EntityKind::Acquisition,
                "lens_correction_acquisition_id",
                Some(correction_id),
            )
            .await?)
    }

    /// Read a record with its references resolved best-effort
    ///
    /// # Errors
    /// Store errors only; absent parents are annotated, not fatal.
    pub async fn materialize(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<Materialized>> {
        let Some(record) = self.resolver.try_resolve(kind, id).await? else {
            return Ok(None);
        };
        let references = self.resolver.materialize(&record.entity).await?;
        Ok(Some(Materialized { record, references }))
    }

    /// Records of `child` kind that reference `parent_kind`/`parent_id`
    ///
    /// Returns an empty list when no edge links the two kinds.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn list_children(
        &self,
        parent_kind: EntityKind,
        parent_id: &EntityId,
        child: EntityKind,
    ) -> Result<Vec<StoredEntity>> {
        let mut children = Vec::new();
        let mut seen = HashSet::new();
        for edge in parent_kind.dependents().filter(|e| e.child == child) {
            for stored in self
                .store
                .find_by_reference(child, edge.field, Some(parent_id))
                .await?
            {
                if seen.insert(stored.id().clone()) {
                    children.push(stored);
                }
            }
        }
        Ok(children)
    }

    async fn draft_task(&self, request: NewTask) -> Result<Entity> {
        let task_id = match request.task_id {
            Some(id) => id,
            None => {
                self.allocator
                    .allocate(EntityKind::AcquisitionTask, &ParentChain::new())
                    .await?
                    .id
            }
        };
        let now = self.clock.now();
        Ok(AcquisitionTask {
            task_id,
            specimen_id: request.specimen_id,
            block_id: request.block_id,
            roi_id: request.roi_id,
            status: TaskStatus::Created,
            version: 1,
            error_message: None,
            started_at: None,
            completed_at: None,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        }
        .into())
    }

    async fn create(&self, entity: Entity) -> Result<StoredEntity> {
        let ctx = self.context_for(&entity, false).await?;
        self.commit(entity, &ctx).await
    }

    async fn context_for(&self, entity: &Entity, with_siblings: bool) -> Result<ValidationContext> {
        let max_depth = self.validator.max_roi_depth();
        let parents = self.resolver.resolve_parents(entity).await?;
        let mut ctx = ValidationContext::new(parents);

        match entity {
            Entity::Roi(roi) => {
                let ancestry = self
                    .resolver
                    .roi_ancestry(roi.parent_roi_id.as_ref(), max_depth)
                    .await?;
                ctx = ctx.with_roi_ancestry(ancestry);
            }
            Entity::Acquisition(acq) => {
                let chain = self
                    .resolver
                    .replacement_chain(acq.replaces_acquisition_id.as_ref(), max_depth)
                    .await?;
                ctx = ctx.with_replacement_chain(chain);
            }
            _ => {}
        }

        if with_siblings {
            if let Some(scope) = entity.scope() {
                let siblings = self.cascade.siblings(&scope).await?;
                ctx = ctx.with_siblings(siblings);
            }
        }
        Ok(ctx)
    }

    async fn commit(&self, entity: Entity, ctx: &ValidationContext) -> Result<StoredEntity> {
        self.validator.validate(&entity, ctx).into_result(&entity)?;

        let successor_of = entity
            .as_acquisition()
            .and_then(|a| a.replaces_acquisition_id.clone());
        if let Some(target) = &successor_of {
            self.lifecycle.claim_successor_slot(target).await?;
        }

        let stored = match self.insert(entity).await {
            Ok(stored) => stored,
            Err(e) => {
                if let Some(target) = &successor_of {
                    // A slot left held here is reclaimed by the next claim
                    if let Err(release) = self.lifecycle.release_successor_slot(target).await {
                        warn!(%target, error = %release, "successor slot not released");
                    }
                }
                return Err(e);
            }
        };

        if let Some(target) = &successor_of {
            if let Err(e) = self.lifecycle.confirm_successor(target, stored.id()).await {
                self.roll_back(std::slice::from_ref(&stored)).await?;
                return Err(e);
            }
        }
        Ok(stored)
    }

    /// Remove records written by a failed multi-record operation, newest first
    async fn roll_back(&self, committed: &[StoredEntity]) -> Result<()> {
        for stored in committed.iter().rev() {
            let kind = stored.entity.kind();
            self.store.delete(kind, stored.id()).await?;
            self.resolver.invalidate(kind, stored.id()).await;
        }
        Ok(())
    }

    async fn insert(&self, entity: Entity) -> Result<StoredEntity> {
        let kind = entity.kind();
        let id = entity.id().clone();
        let revision = self.store.insert(entity.clone()).await.map_err(|e| match e {
            StoreError::DuplicateKey { kind, id } => IntegrityError::IdentifierTaken { kind, id },
            other => other.into(),
        })?;
        self.resolver.invalidate(kind, &id).await;
        info!(%kind, %id, %revision, "committed");
        Ok(StoredEntity { entity, revision })
    }

    async fn advance_counter(&self, entity: &Entity) -> Result<()> {
        if let (Some(scope), Some(n)) = (entity.scope(), entity.sequence_number()) {
            self.allocator.advance_to(&scope, n).await?;
        }
        Ok(())
    }
}

fn sequence(allocation: &Allocation) -> u64 {
    allocation.sequence.unwrap_or_default()
}

fn not_found(kind: EntityKind, id: &EntityId) -> IntegrityError {
    IntegrityError::ReferenceNotFound {
        kind,
        id: id.clone(),
    }
}
