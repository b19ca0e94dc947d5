//! Delete coordination over the dependency graph
//!
//! Deleting a record that other records point at is either rejected or
//! cascaded. A cascade first plans the full dependent closure as a directed
//! graph (edges run from a dependent to the record it references), orders it
//! topologically so every dependent is removed before its parent, then
//! deletes step by step. The walk is not atomic; re-running it after a
//! partial failure skips what is already gone.
//!
//! A rejecting delete only ever removes the target itself. Dependents that
//! appear between the check and the delete are left alone and reported.

use crate::error::{ErrorKind, IntegrityError, Result, Violation};
use crate::lifecycle::Lifecycle;
use crate::resolver::Resolver;
use crate::validator::check_sibling_sequences;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use temdb_model::{Entity, EntityId, EntityKind, ScopeKey};
use temdb_store::DocumentStore;
use tracing::{debug, info, warn};

/// What to do with dependents of a delete target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    /// Refuse if anything depends on the target
    #[default]
    Reject,
    /// Delete the whole dependent closure
    Cascade,
}

/// A `(kind, id)` pair naming one record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Kind of the record
    pub kind: EntityKind,
    /// Identifier of the record
    pub id: EntityId,
}

impl EntityRef {
    /// Create a reference
    #[must_use]
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

impl From<&Entity> for EntityRef {
    fn from(entity: &Entity) -> Self {
        Self::new(entity.kind(), entity.id().clone())
    }
}

/// Ordered delete plan for one root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletePlan {
    /// Records to delete, dependents first; the root is last
    pub steps: Vec<EntityRef>,
    /// Dependents of the root (whole closure) counted by kind
    pub dependents: BTreeMap<EntityKind, usize>,
    /// Sibling scopes that lose members and outlive the cascade
    pub scopes: Vec<ScopeKey>,
    /// Successor slot each planned acquisition holds, by acquisition
    #[serde(skip)]
    successor_slots: HashMap<EntityId, EntityId>,
}

impl DeletePlan {
    /// Check if nothing is to be deleted (root absent)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn push(&mut self, step: EntityRef, entity: &Entity, parent_planned: bool) {
        if let Some(scope) = entity.scope() {
            if !parent_planned && !self.scopes.contains(&scope) {
                self.scopes.push(scope);
            }
        }
        if let Some(target) = entity
            .as_acquisition()
            .and_then(|a| a.replaces_acquisition_id.clone())
        {
            self.successor_slots.insert(step.id.clone(), target);
        }
        self.steps.push(step);
    }

    /// Total number of dependents
    #[must_use]
    pub fn dependent_count(&self) -> usize {
        self.dependents.values().sum()
    }
}

/// Outcome of a delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    /// Records removed by this call, in order
    pub deleted: Vec<EntityRef>,
    /// Planned records that were already gone
    pub skipped: Vec<EntityRef>,
    /// Sibling-scope findings after the delete; informational only
    pub findings: Vec<Violation>,
}

/// Plans and executes deletes
#[derive(Clone)]
pub struct Cascade {
    store: Arc<dyn DocumentStore>,
    resolver: Resolver,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade").finish_non_exhaustive()
    }
}

impl Cascade {
    /// Create a coordinator
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, resolver: Resolver, lifecycle: Lifecycle) -> Self {
        Self {
            store,
            resolver,
            lifecycle,
        }
    }

    /// Records that reference `kind`/`id` directly, counted by kind
    ///
    /// # Errors
    /// Store errors only.
    pub async fn direct_dependents(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<BTreeMap<EntityKind, usize>> {
        let mut counts = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for edge in kind.dependents() {
            for stored in self
                .store
                .find_by_reference(edge.child, edge.field, Some(id))
                .await?
            {
                // A child ROI points at both its section and its parent ROI
                if seen.insert(EntityRef::from(&stored.entity)) {
                    *counts.entry(edge.child).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    /// Plan a cascading delete of `kind`/`id` without deleting anything
    ///
    /// # Errors
    /// [`IntegrityError::CycleDetected`] if the dependent closure is cyclic,
    /// or a store error.
    pub async fn plan_delete(&self, kind: EntityKind, id: &EntityId) -> Result<DeletePlan> {
        let Some(root) = self.store.get(kind, id).await? else {
            return Ok(DeletePlan::default());
        };

        let root_ref = EntityRef::from(&root.entity);
        let mut graph: DiGraph<EntityRef, &'static str> = DiGraph::new();
        let mut index: HashMap<EntityRef, NodeIndex> = HashMap::new();
        let mut records: HashMap<EntityRef, Entity> = HashMap::new();
        let mut queue = VecDeque::new();

        let root_ix = graph.add_node(root_ref.clone());
        index.insert(root_ref.clone(), root_ix);
        records.insert(root_ref.clone(), root.entity);
        queue.push_back(root_ref.clone());

        while let Some(parent) = queue.pop_front() {
            let parent_ix = index[&parent];
            for edge in parent.kind.dependents() {
                let children = self
                    .store
                    .find_by_reference(edge.child, edge.field, Some(&parent.id))
                    .await?;
                for stored in children {
                    let child = EntityRef::from(&stored.entity);
                    let child_ix = match index.get(&child) {
                        Some(&ix) => ix,
                        None => {
                            let ix = graph.add_node(child.clone());
                            index.insert(child.clone(), ix);
                            records.insert(child.clone(), stored.entity);
                            queue.push_back(child);
                            ix
                        }
                    };
                    graph.update_edge(child_ix, parent_ix, edge.field);
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node = &graph[cycle.node_id()];
            warn!(root = %root_ref, at = %node, "cyclic delete plan");
            IntegrityError::CycleDetected {
                kind: root_ref.kind,
                id: root_ref.id.clone(),
            }
        })?;

        let mut plan = DeletePlan::default();
        for ix in order {
            let step = graph[ix].clone();
            let Some(entity) = records.get(&step) else {
                continue;
            };
            if step != root_ref {
                *plan.dependents.entry(step.kind).or_insert(0) += 1;
            }
            let parent_planned = entity
                .scope()
                .and_then(|scope| scope_parent(&scope))
                .is_some_and(|parent| index.contains_key(&parent));
            plan.push(step, entity, parent_planned);
        }

        debug!(
            root = %root_ref,
            steps = plan.steps.len(),
            scopes = plan.scopes.len(),
            "delete planned"
        );
        Ok(plan)
    }

    /// Delete `kind`/`id` according to `mode`
    ///
    /// Deleting an absent root is a no-op returning an empty report. In
    /// [`CascadeMode::Reject`] only the root is removed; dependents written
    /// concurrently with the delete survive and are listed in the report's
    /// findings.
    ///
    /// # Errors
    /// [`IntegrityError::HasDependents`] in [`CascadeMode::Reject`] when
    /// anything references the target, [`IntegrityError::CycleDetected`]
    /// for a cyclic plan, or a store error.
    pub async fn cascade_delete(
        &self,
        kind: EntityKind,
        id: &EntityId,
        mode: CascadeMode,
    ) -> Result<CascadeReport> {
        let plan = match mode {
            CascadeMode::Reject => {
                let dependents = self.direct_dependents(kind, id).await?;
                if !dependents.is_empty() {
                    return Err(IntegrityError::HasDependents {
                        kind,
                        id: id.clone(),
                        dependents,
                    });
                }
                self.plan_root(kind, id).await?
            }
            CascadeMode::Cascade => self.plan_delete(kind, id).await?,
        };
        if plan.is_empty() {
            self.resolver.invalidate(kind, id).await;
            debug!(%kind, %id, "delete target already absent");
            return Ok(CascadeReport::default());
        }

        let mut report = self.execute(plan).await?;
        if mode == CascadeMode::Reject {
            report.findings.extend(self.orphans_of(kind, id).await?);
        }
        Ok(report)
    }

    /// Single-step plan removing only the root
    async fn plan_root(&self, kind: EntityKind, id: &EntityId) -> Result<DeletePlan> {
        let mut plan = DeletePlan::default();
        if let Some(root) = self.store.get(kind, id).await? {
            plan.push(EntityRef::from(&root.entity), &root.entity, false);
        }
        Ok(plan)
    }

    async fn execute(&self, plan: DeletePlan) -> Result<CascadeReport> {
        let mut report = CascadeReport::default();
        for step in plan.steps {
            let removed = self.store.delete(step.kind, &step.id).await?;
            self.resolver.invalidate(step.kind, &step.id).await;
            if let Some(target) = plan.successor_slots.get(&step.id) {
                self.lifecycle.release_successor_slot(target).await?;
            }
            if removed {
                debug!(entity = %step, "deleted");
                report.deleted.push(step);
            } else {
                report.skipped.push(step);
            }
        }

        for scope in &plan.scopes {
            let siblings = self.siblings(scope).await?;
            for finding in check_sibling_sequences(&siblings) {
                warn!(%scope, %finding, "sibling scope inconsistent after delete");
                report.findings.push(finding);
            }
        }

        info!(
            deleted = report.deleted.len(),
            skipped = report.skipped.len(),
            findings = report.findings.len(),
            "cascade complete"
        );
        Ok(report)
    }

    /// Records still pointing at a deleted `kind`/`id`
    async fn orphans_of(&self, kind: EntityKind, id: &EntityId) -> Result<Vec<Violation>> {
        let mut orphans = Vec::new();
        for edge in kind.dependents() {
            for stored in self
                .store
                .find_by_reference(edge.child, edge.field, Some(id))
                .await?
            {
                let orphan = EntityRef::from(&stored.entity);
                warn!(%orphan, deleted = %id, "dependent written during delete");
                orphans.push(Violation::on(
                    ErrorKind::ReferenceNotFound,
                    edge.field,
                    format!("{orphan} references deleted {kind} '{id}'"),
                ));
            }
        }
        Ok(orphans)
    }

    /// Current members of a sibling scope
    ///
    /// # Errors
    /// Store errors only.
    pub async fn siblings(&self, scope: &ScopeKey) -> Result<Vec<Entity>> {
        let stored = match (scope.field(), scope.parent()) {
            (Some(field), Some(parent)) => {
                self.store
                    .find_by_reference(scope.kind(), field, Some(parent))
                    .await?
            }
            _ => self.store.list(scope.kind()).await?,
        };
        let members: Vec<Entity> = stored.into_iter().map(|s| s.entity).collect();
        // Child ROIs share `section_id` with top-level ROIs of their section
        Ok(members
            .into_iter()
            .filter(|e| e.scope().as_ref() == Some(scope))
            .collect())
    }
}

fn scope_parent(scope: &ScopeKey) -> Option<EntityRef> {
    let field = scope.field()?;
    let parent = scope.parent()?;
    scope
        .kind()
        .references()
        .find(|edge| edge.field == field)
        .map(|edge| EntityRef::new(edge.parent, parent.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::LifecycleConfig;
    use chrono::{DateTime, Utc};
    use temdb_model::{Block, Metadata, Roi, Specimen};
    use temdb_store::MemoryStore;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn specimen(id: &str) -> Entity {
        Entity::Specimen(Specimen {
            specimen_id: EntityId::new(id),
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        })
    }

    fn block(specimen: &str, n: u64) -> Entity {
        Entity::Block(Block {
            block_id: EntityId::new(format!("{specimen}.BLK{n:03}")),
            specimen_id: EntityId::new(specimen),
            block_number: n,
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        })
    }

    fn roi(id: &str, parent: Option<&str>) -> Entity {
        Entity::Roi(Roi {
            roi_id: EntityId::new(id),
            section_id: EntityId::new("SUB001_S0001"),
            parent_roi_id: parent.map(EntityId::new),
            specimen_id: EntityId::new("SPEC001"),
            block_id: EntityId::new("SPEC001.BLK001"),
            substrate_media_id: EntityId::new("SUB001"),
            section_number: 1,
            roi_number: 1,
            hierarchy_level: 1,
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        })
    }

    fn cascade() -> (Arc<MemoryStore>, Cascade) {
        let store = Arc::new(MemoryStore::new());
        let resolver = Resolver::new(store.clone(), 100);
        let lifecycle = Lifecycle::new(
            store.clone(),
            resolver.clone(),
            Arc::new(SystemClock),
            LifecycleConfig::default(),
        );
        (store.clone(), Cascade::new(store, resolver, lifecycle))
    }

    #[tokio::test]
    async fn reject_counts_direct_dependents() {
        let (store, cascade) = cascade();
        store.insert(specimen("SPEC001")).await.unwrap();
        store.insert(block("SPEC001", 1)).await.unwrap();
        store.insert(block("SPEC001", 2)).await.unwrap();

        let err = cascade
            .cascade_delete(EntityKind::Specimen, &EntityId::new("SPEC001"), CascadeMode::Reject)
            .await
            .unwrap_err();
        match err {
            IntegrityError::HasDependents { dependents, .. } => {
                assert_eq!(dependents.get(&EntityKind::Block), Some(&2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn leaf_delete_in_reject_mode() {
        let (store, cascade) = cascade();
        store.insert(specimen("SPEC001")).await.unwrap();
        store.insert(block("SPEC001", 1)).await.unwrap();

        let report = cascade
            .cascade_delete(
                EntityKind::Block,
                &EntityId::new("SPEC001.BLK001"),
                CascadeMode::Reject,
            )
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn plan_orders_dependents_first() {
        let (store, cascade) = cascade();
        store.insert(specimen("SPEC001")).await.unwrap();
        store.insert(block("SPEC001", 1)).await.unwrap();

        let plan = cascade
            .plan_delete(EntityKind::Specimen, &EntityId::new("SPEC001"))
            .await
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].kind, EntityKind::Block);
        assert_eq!(plan.steps[1].kind, EntityKind::Specimen);
        assert_eq!(plan.dependent_count(), 1);
        assert_eq!(plan.scopes, vec![ScopeKey::global(EntityKind::Specimen)]);
    }

    #[tokio::test]
    async fn child_roi_counted_once() {
        let (store, cascade) = cascade();
        let top = "SPEC001.BLK001.SEC001.SUB001.ROI001";
        store.insert(roi(top, None)).await.unwrap();
        store
            .insert(roi(&format!("{top}.ROI001"), Some(top)))
            .await
            .unwrap();

        let counts = cascade
            .direct_dependents(EntityKind::Roi, &EntityId::new(top))
            .await
            .unwrap();
        assert_eq!(counts.get(&EntityKind::Roi), Some(&1));
    }

    #[tokio::test]
    async fn roi_cycle_is_rejected() {
        let (store, cascade) = cascade();
        store.insert(roi("A", Some("B"))).await.unwrap();
        store.insert(roi("B", Some("A"))).await.unwrap();

        let err = cascade
            .plan_delete(EntityKind::Roi, &EntityId::new("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrityError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn absent_root_is_noop() {
        let (_, cascade) = cascade();
        let report = cascade
            .cascade_delete(
                EntityKind::Specimen,
                &EntityId::new("SPEC404"),
                CascadeMode::Cascade,
            )
            .await
            .unwrap();
        assert_eq!(report, CascadeReport::default());
    }
}
