//! Structural validation of candidate records
//!
//! The validator is pure: it reads only the candidate and an already
//! resolved [`ValidationContext`], and reports every violation it finds
//! rather than stopping at the first one.

use crate::allocator::roi_prefix;
use crate::error::{ErrorKind, IntegrityError, Result, Violation};
use crate::lifecycle;
use crate::resolver::{Ancestry, ParentChain, WalkEnd};
use std::collections::HashMap;
use temdb_model::{
    is_valid_segment, section_id, tile_id, Acquisition, AcquisitionPhase, AcquisitionTask,
    Block, CuttingSession, Entity, EntityId, Roi, ScopeKey, Section, Tile, BLOCK_TAG,
    CUTTING_SESSION_TAG, ROI_TAG,
};

/// Outcome of validating one candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    violations: Vec<Violation>,
}

impl ValidationReport {
    /// Check if no violation was found
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    /// Every violation found
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// Check if a violation of `kind` was found
    #[must_use]
    pub fn has(&self, kind: ErrorKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// Turn a failed report into [`IntegrityError::Validation`]
    ///
    /// # Errors
    /// If any violation was found.
    pub fn into_result(self, entity: &Entity) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(IntegrityError::Validation {
                kind: entity.kind(),
                id: entity.id().clone(),
                violations: self.violations,
            })
        }
    }
}

/// Already-resolved data a candidate is checked against
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Resolved reference fields
    pub parents: ParentChain,
    /// Walk up `parent_roi_id` from the candidate's parent
    pub roi_ancestry: Ancestry,
    /// Walk up `replaces_acquisition_id` from the candidate's target
    pub replacement_chain: Ancestry,
    /// Other members of the candidate's sibling scope
    pub siblings: Vec<Entity>,
}

impl ValidationContext {
    /// Context with resolved parents only
    #[must_use]
    pub fn new(parents: ParentChain) -> Self {
        Self {
            parents,
            ..Self::default()
        }
    }

    /// Attach the walked `parent_roi_id` chain
    #[must_use]
    pub fn with_roi_ancestry(mut self, ancestry: Ancestry) -> Self {
        self.roi_ancestry = ancestry;
        self
    }

    /// Attach the walked replacement chain
    #[must_use]
    pub fn with_replacement_chain(mut self, chain: Ancestry) -> Self {
        self.replacement_chain = chain;
        self
    }

    /// Attach records sharing the candidate's sibling scope
    #[must_use]
    pub fn with_siblings(mut self, siblings: Vec<Entity>) -> Self {
        self.siblings = siblings;
        self
    }
}

/// Enforces the structural invariants of the entity graph
#[derive(Debug, Clone)]
pub struct Validator {
    max_roi_depth: usize,
}

impl Validator {
    /// Create a validator bounding ancestry walks at `max_roi_depth` hops
    #[must_use]
    pub fn new(max_roi_depth: usize) -> Self {
        Self { max_roi_depth }
    }

    /// Hop bound for ancestry walks
    #[must_use]
    pub fn max_roi_depth(&self) -> usize {
        self.max_roi_depth
    }

    /// Check `entity` against `ctx`
    #[must_use]
    pub fn validate(&self, entity: &Entity, ctx: &ValidationContext) -> ValidationReport {
        let mut report = ValidationReport::default();
        check_references(entity, &ctx.parents, &mut report);

        match entity {
            Entity::Specimen(s) => {
                let single = s.specimen_id.hierarchical().map(|h| h.len() == 1);
                if !matches!(single, Ok(true)) {
                    report.push(Violation::on(
                        ErrorKind::InvalidIdentifier,
                        "specimen_id",
                        format!("'{}' is not a single segment", s.specimen_id),
                    ));
                }
            }
            Entity::Substrate(s) => {
                if !is_valid_segment(s.media_id.as_str()) {
                    report.push(Violation::on(
                        ErrorKind::InvalidIdentifier,
                        "media_id",
                        format!("'{}' is not a valid identifier segment", s.media_id),
                    ));
                }
            }
            Entity::Block(b) => check_block(b, &mut report),
            Entity::CuttingSession(c) => check_cutting_session(c, &ctx.parents, &mut report),
            Entity::Section(s) => check_section(s, &ctx.parents, &mut report),
            Entity::Roi(r) => self.check_roi(r, ctx, &mut report),
            Entity::AcquisitionTask(t) => check_task(t, &ctx.parents, &mut report),
            Entity::Acquisition(a) => self.check_acquisition(a, ctx, &mut report),
            Entity::Tile(t) => check_tile(t, &mut report),
        }

        check_unique_sequence(entity, &ctx.siblings, &mut report);
        report
    }

    fn check_roi(&self, roi: &Roi, ctx: &ValidationContext, report: &mut ValidationReport) {
        let id = match roi.roi_id.hierarchical() {
            Ok(id) => id,
            Err(e) => {
                report.push(Violation::on(
                    ErrorKind::InvalidIdentifier,
                    "roi_id",
                    e.to_string(),
                ));
                return;
            }
        };

        if id.trailing_sequence(ROI_TAG) != Some(roi.roi_number) {
            report.push(Violation::on(
                ErrorKind::PrefixMismatch,
                "roi_number",
                format!("{} does not match '{}'", roi.roi_number, roi.roi_id),
            ));
        }

        let depth = id.count_tag(ROI_TAG);
        if roi.hierarchy_level as usize != depth {
            report.push(Violation::on(
                ErrorKind::LevelMismatch,
                "hierarchy_level",
                format!(
                    "level {} but '{}' has {depth} ROI segments",
                    roi.hierarchy_level, roi.roi_id
                ),
            ));
        }

        match &roi.parent_roi_id {
            Some(parent_id) => {
                if parent_id == &roi.roi_id {
                    report.push(Violation::on(
                        ErrorKind::CycleDetected,
                        "parent_roi_id",
                        "ROI is its own parent",
                    ));
                    return;
                }
                if let Some(parent) = ctx.parents.get("parent_roi_id").and_then(Entity::as_roi) {
                    check_roi_under_parent(roi, &id, parent, report);
                }
                self.check_ancestry(
                    &roi.roi_id,
                    "parent_roi_id",
                    &ctx.roi_ancestry,
                    report,
                );
            }
            None => {
                if roi.hierarchy_level != 1 {
                    report.push(Violation::on(
                        ErrorKind::LevelMismatch,
                        "hierarchy_level",
                        format!("top-level ROI has level {}", roi.hierarchy_level),
                    ));
                }
                if let Some(section) = ctx.parents.get("section_id") {
                    check_roi_under_section(roi, &id, section, report);
                }
            }
        }
    }

    fn check_acquisition(
        &self,
        acq: &Acquisition,
        ctx: &ValidationContext,
        report: &mut ValidationReport,
    ) {
        if let Some(task) = ctx
            .parents
            .get("acquisition_task_id")
            .and_then(Entity::as_task)
        {
            expect_same(report, "roi_id", &acq.roi_id, &task.roi_id, "task's ROI");
            expect_same(
                report,
                "specimen_id",
                &acq.specimen_id,
                &task.specimen_id,
                "task's specimen",
            );
        }
        if let Some(roi) = ctx.parents.get("roi_id").and_then(Entity::as_roi) {
            expect_same(
                report,
                "specimen_id",
                &acq.specimen_id,
                &roi.specimen_id,
                "ROI's specimen",
            );
        }
        for violation in lifecycle::acquisition_record_violations(acq) {
            report.push(violation);
        }
        check_lens_correction(acq, &ctx.parents, report);

        let Some(target_id) = &acq.replaces_acquisition_id else {
            if acq.version != 1 {
                report.push(Violation::on(
                    ErrorKind::ReplacementConflict,
                    "version",
                    format!("first acquisition must have version 1, got {}", acq.version),
                ));
            }
            return;
        };

        if target_id == &acq.acquisition_id {
            report.push(Violation::on(
                ErrorKind::CycleDetected,
                "replaces_acquisition_id",
                "acquisition replaces itself",
            ));
            return;
        }
        if let Some(target) = ctx
            .parents
            .get("replaces_acquisition_id")
            .and_then(Entity::as_acquisition)
        {
            if target.roi_id != acq.roi_id {
                report.push(Violation::on(
                    ErrorKind::PrefixMismatch,
                    "replaces_acquisition_id",
                    format!(
                        "'{}' is under ROI '{}', not '{}'",
                        target.acquisition_id, target.roi_id, acq.roi_id
                    ),
                ));
            }
            if target.phase() != AcquisitionPhase::Finished {
                report.push(Violation::on(
                    ErrorKind::ReplacementTargetActive,
                    "replaces_acquisition_id",
                    format!("'{}' is still {}", target.acquisition_id, target.phase()),
                ));
            }
            match target.version.checked_add(1) {
                Some(expected) if acq.version == expected => {}
                expected => report.push(Violation::on(
                    ErrorKind::ReplacementConflict,
                    "version",
                    format!(
                        "replacement of version {} must have version {}, got {}",
                        target.version,
                        expected.map_or_else(|| "none".to_string(), |v| v.to_string()),
                        acq.version
                    ),
                )),
            }
        }
        self.check_ancestry(
            &acq.acquisition_id,
            "replaces_acquisition_id",
            &ctx.replacement_chain,
            report,
        );
    }

    fn check_ancestry(
        &self,
        candidate: &EntityId,
        field: &'static str,
        ancestry: &Ancestry,
        report: &mut ValidationReport,
    ) {
        if ancestry.contains(candidate) {
            report.push(Violation::on(
                ErrorKind::CycleDetected,
                field,
                format!("'{candidate}' is its own ancestor"),
            ));
            return;
        }
        match &ancestry.end {
            WalkEnd::Root => {}
            WalkEnd::Repeated(id) => report.push(Violation::on(
                ErrorKind::CycleDetected,
                field,
                format!("ancestry revisits '{id}'"),
            )),
            WalkEnd::DepthExceeded => report.push(Violation::on(
                ErrorKind::CycleDetected,
                field,
                format!("ancestry exceeds {} levels", self.max_roi_depth),
            )),
            // The first hop is already reported as an unresolved reference
            WalkEnd::Missing(id) if !ancestry.chain.is_empty() => report.push(Violation::on(
                ErrorKind::ReferenceNotFound,
                field,
                format!("ancestor '{id}' does not exist"),
            )),
            WalkEnd::Missing(_) => {}
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Report scopes in which two entities share a sequence number
///
/// `entities` may span several scopes; members without a scope or number
/// are ignored.
#[must_use]
pub fn check_sibling_sequences(entities: &[Entity]) -> Vec<Violation> {
    let mut by_slot: HashMap<(ScopeKey, u64), Vec<&EntityId>> = HashMap::new();
    for entity in entities {
        if let (Some(scope), Some(n)) = (entity.scope(), entity.sequence_number()) {
            by_slot.entry((scope, n)).or_default().push(entity.id());
        }
    }

    let mut violations: Vec<Violation> = by_slot
        .into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|((scope, n), mut ids)| {
            ids.sort();
            let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
            Violation::new(
                ErrorKind::DuplicateSequenceNumber,
                format!("{scope}: sequence {n} held by {}", ids.join(", ")),
            )
        })
        .collect();
    violations.sort_by(|a, b| a.message.cmp(&b.message));
    violations
}

fn check_references(entity: &Entity, parents: &ParentChain, report: &mut ValidationReport) {
    for missing in parents.missing() {
        let message = match &missing.id {
            Some(id) => format!("{} '{id}' does not exist", missing.edge.parent),
            None => "required reference is null".to_string(),
        };
        report.push(Violation::on(
            ErrorKind::ReferenceNotFound,
            missing.edge.field,
            message,
        ));
    }
    for (edge, value) in entity.edges() {
        if value.is_none() {
            continue;
        }
        if let Some(parent) = parents.get(edge.field) {
            if parent.kind() != edge.parent {
                report.push(Violation::on(
                    ErrorKind::ReferenceNotFound,
                    edge.field,
                    format!("expected {}, resolved {}", edge.parent, parent.kind()),
                ));
            }
        }
    }
}

fn check_dotted_child(
    report: &mut ValidationReport,
    id: &EntityId,
    parent: &EntityId,
    tag: &str,
    number: u64,
    number_field: &'static str,
) {
    let (Ok(own), Ok(parent_path)) = (id.hierarchical(), parent.hierarchical()) else {
        report.push(Violation::new(
            ErrorKind::InvalidIdentifier,
            format!("'{id}' or '{parent}' is not a dotted identifier"),
        ));
        return;
    };
    if own.parent().as_ref() != Some(&parent_path) {
        report.push(Violation::new(
            ErrorKind::PrefixMismatch,
            format!("'{id}' is not directly under '{parent}'"),
        ));
    }
    if own.trailing_sequence(tag) != Some(number) {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            number_field,
            format!("{number} does not match '{id}'"),
        ));
    }
}

fn expect_same(
    report: &mut ValidationReport,
    field: &'static str,
    actual: &EntityId,
    expected: &EntityId,
    source: &str,
) {
    if actual != expected {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            field,
            format!("'{actual}' differs from the {source} '{expected}'"),
        ));
    }
}

fn check_block(block: &Block, report: &mut ValidationReport) {
    check_dotted_child(
        report,
        &block.block_id,
        &block.specimen_id,
        BLOCK_TAG,
        block.block_number,
        "block_number",
    );
}

fn check_cutting_session(
    session: &CuttingSession,
    parents: &ParentChain,
    report: &mut ValidationReport,
) {
    check_dotted_child(
        report,
        &session.cutting_session_id,
        &session.block_id,
        CUTTING_SESSION_TAG,
        session.session_number,
        "session_number",
    );
    if let Some(block) = parents.get("block_id").and_then(Entity::as_block) {
        expect_same(
            report,
            "specimen_id",
            &session.specimen_id,
            &block.specimen_id,
            "block's specimen",
        );
    }
}

fn check_section(section: &Section, parents: &ParentChain, report: &mut ValidationReport) {
    let expected = section_id(&section.media_id, section.section_number);
    if section.section_id != expected {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            "section_id",
            format!("expected '{expected}'"),
        ));
    }
    if let Some(session) = parents
        .get("cutting_session_id")
        .and_then(Entity::as_cutting_session)
    {
        expect_same(
            report,
            "specimen_id",
            &section.specimen_id,
            &session.specimen_id,
            "cutting session's specimen",
        );
        expect_same(
            report,
            "block_id",
            &section.block_id,
            &session.block_id,
            "cutting session's block",
        );
    }
}

fn check_roi_under_parent(
    roi: &Roi,
    id: &temdb_model::HierarchicalId,
    parent: &Roi,
    report: &mut ValidationReport,
) {
    match parent.hierarchy_level.checked_add(1) {
        Some(expected) if roi.hierarchy_level == expected => {}
        Some(expected) => report.push(Violation::on(
            ErrorKind::LevelMismatch,
            "hierarchy_level",
            format!(
                "expected {expected} under level {} parent, got {}",
                parent.hierarchy_level, roi.hierarchy_level
            ),
        )),
        None => report.push(Violation::on(
            ErrorKind::LevelMismatch,
            "hierarchy_level",
            format!("parent '{}' has no representable child level", parent.roi_id),
        )),
    }
    if id.parent().map(|p| p.to_entity_id()).as_ref() != Some(&parent.roi_id) {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            "roi_id",
            format!("'{}' is not directly under '{}'", roi.roi_id, parent.roi_id),
        ));
    }
    expect_same(report, "section_id", &roi.section_id, &parent.section_id, "parent's section");
    expect_same(
        report,
        "specimen_id",
        &roi.specimen_id,
        &parent.specimen_id,
        "parent's specimen",
    );
    expect_same(report, "block_id", &roi.block_id, &parent.block_id, "parent's block");
    expect_same(
        report,
        "substrate_media_id",
        &roi.substrate_media_id,
        &parent.substrate_media_id,
        "parent's medium",
    );
}

fn check_roi_under_section(
    roi: &Roi,
    id: &temdb_model::HierarchicalId,
    section_entity: &Entity,
    report: &mut ValidationReport,
) {
    let Some(section) = section_entity.as_section() else {
        return;
    };
    match roi_prefix(section_entity) {
        Ok(prefix) => {
            if id.parent().as_ref() != Some(&prefix) {
                report.push(Violation::on(
                    ErrorKind::PrefixMismatch,
                    "roi_id",
                    format!("'{}' is not directly under '{prefix}'", roi.roi_id),
                ));
            }
        }
        Err(e) => report.push(Violation::on(
            ErrorKind::InvalidIdentifier,
            "section_id",
            e.to_string(),
        )),
    }
    expect_same(
        report,
        "specimen_id",
        &roi.specimen_id,
        &section.specimen_id,
        "section's specimen",
    );
    expect_same(report, "block_id", &roi.block_id, &section.block_id, "section's block");
    expect_same(
        report,
        "substrate_media_id",
        &roi.substrate_media_id,
        &section.media_id,
        "section's medium",
    );
    if roi.section_number != section.section_number {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            "section_number",
            format!(
                "{} differs from the section's {}",
                roi.section_number, section.section_number
            ),
        ));
    }
}

fn check_task(task: &AcquisitionTask, parents: &ParentChain, report: &mut ValidationReport) {
    if let Some(roi) = parents.get("roi_id").and_then(Entity::as_roi) {
        expect_same(report, "block_id", &task.block_id, &roi.block_id, "ROI's block");
        expect_same(
            report,
            "specimen_id",
            &task.specimen_id,
            &roi.specimen_id,
            "ROI's specimen",
        );
    }
    if let Some(block) = parents.get("block_id").and_then(Entity::as_block) {
        expect_same(
            report,
            "specimen_id",
            &task.specimen_id,
            &block.specimen_id,
            "block's specimen",
        );
    }
    for violation in lifecycle::task_record_violations(task) {
        report.push(violation);
    }
}

fn check_lens_correction(acq: &Acquisition, parents: &ParentChain, report: &mut ValidationReport) {
    const FIELD: &str = "lens_correction_acquisition_id";
    let Some(correction_id) = &acq.lens_correction_acquisition_id else {
        return;
    };
    if acq.lens_correction {
        report.push(Violation::on(
            ErrorKind::InvalidLensCorrection,
            FIELD,
            "a lens-correction run cannot itself be corrected",
        ));
        return;
    }
    if let Some(correction) = parents.get(FIELD).and_then(Entity::as_acquisition) {
        if !correction.lens_correction {
            report.push(Violation::on(
                ErrorKind::InvalidLensCorrection,
                FIELD,
                format!("'{correction_id}' is not a lens-correction run"),
            ));
        }
    }
}

fn check_tile(tile: &Tile, report: &mut ValidationReport) {
    let expected = tile_id(&tile.acquisition_id, tile.tile_number);
    if tile.tile_id != expected {
        report.push(Violation::on(
            ErrorKind::PrefixMismatch,
            "tile_id",
            format!("expected '{expected}'"),
        ));
    }
}

fn check_unique_sequence(entity: &Entity, siblings: &[Entity], report: &mut ValidationReport) {
    let (Some(scope), Some(n)) = (entity.scope(), entity.sequence_number()) else {
        return;
    };
    for sibling in siblings {
        if sibling.id() != entity.id()
            && sibling.sequence_number() == Some(n)
            && sibling.scope().as_ref() == Some(&scope)
        {
            report.push(Violation::new(
                ErrorKind::DuplicateSequenceNumber,
                format!("{scope}: sequence {n} already held by '{}'", sibling.id()),
            ));
        }
    }
}
