//! Reference resolution with a bounded cache
//!
//! Foreign keys are resolved on demand. Positive results are cached by
//! `(kind, id)` in a size-bounded [`moka`] cache with no TTL; every write
//! path invalidates the identifiers it touches, so a cached handle is stale
//! only between another process's write and our next invalidation.

use crate::error::{IntegrityError, Result};
use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use temdb_model::{Entity, EntityId, EntityKind, ReferenceEdge};
use temdb_store::{DocumentStore, StoredEntity};
use tracing::trace;

/// Shared handle on a resolved record
pub type EntityHandle = Arc<StoredEntity>;

type CacheKey = (EntityKind, EntityId);

/// A reference that did not resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingReference {
    /// The edge
    pub edge: &'static ReferenceEdge,
    /// Stored value; `None` if a required field is null
    pub id: Option<EntityId>,
}

/// Resolved parents of one candidate, keyed by reference field
#[derive(Debug, Clone, Default)]
pub struct ParentChain {
    resolved: HashMap<&'static str, EntityHandle>,
    missing: Vec<MissingReference>,
}

impl ParentChain {
    /// Empty chain (root kinds)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resolved parent
    #[must_use]
    pub fn with(mut self, field: &'static str, parent: EntityHandle) -> Self {
        self.resolved.insert(field, parent);
        self
    }

    /// Record a reference that did not resolve
    #[must_use]
    pub fn with_missing(mut self, edge: &'static ReferenceEdge, id: Option<EntityId>) -> Self {
        self.missing.push(MissingReference { edge, id });
        self
    }

    /// Parent behind `field`
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Entity> {
        self.resolved.get(field).map(|h| &h.entity)
    }

    /// Handle behind `field`
    #[must_use]
    pub fn handle(&self, field: &str) -> Option<&EntityHandle> {
        self.resolved.get(field)
    }

    /// References that failed to resolve
    #[must_use]
    pub fn missing(&self) -> &[MissingReference] {
        &self.missing
    }

    /// Check that every reference resolved
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Why a link walk stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEnd {
    /// Reached a record whose link is null
    Root,
    /// A link pointed at an absent record
    Missing(EntityId),
    /// A link pointed back at an identifier already walked
    Repeated(EntityId),
    /// The hop bound was reached
    DepthExceeded,
}

/// Records reached by following one self-referential link, nearest first
#[derive(Debug, Clone)]
pub struct Ancestry {
    /// Visited records
    pub chain: Vec<EntityHandle>,
    /// Termination reason
    pub end: WalkEnd,
}

impl Ancestry {
    /// Walk of a record whose link is null
    #[must_use]
    pub fn root() -> Self {
        Self {
            chain: Vec::new(),
            end: WalkEnd::Root,
        }
    }

    /// Check if `id` was visited
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.chain.iter().any(|h| h.id() == id)
    }
}

impl Default for Ancestry {
    fn default() -> Self {
        Self::root()
    }
}

/// Target of one reference field on a best-effort read
#[derive(Debug, Clone)]
pub enum ReferenceTarget {
    /// Optional field is null
    Null,
    /// Field resolved
    Resolved(EntityHandle),
    /// Field points at an absent record
    Missing(EntityId),
}

/// One materialized reference field
#[derive(Debug, Clone)]
pub struct MaterializedReference {
    /// The edge
    pub edge: &'static ReferenceEdge,
    /// What it points at
    pub target: ReferenceTarget,
}

/// Resolves stored foreign keys into handles
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn DocumentStore>,
    cache: Cache<CacheKey, EntityHandle>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Create a resolver caching at most `capacity` records
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, capacity: u64) -> Self {
        Self {
            store,
            cache: Cache::new(capacity),
        }
    }

    /// Resolve or fail with `ReferenceNotFound`
    ///
    /// # Errors
    /// [`IntegrityError::ReferenceNotFound`] if absent, or a store error.
    pub async fn resolve(&self, kind: EntityKind, id: &EntityId) -> Result<EntityHandle> {
        self.try_resolve(kind, id)
            .await?
            .ok_or_else(|| IntegrityError::ReferenceNotFound {
                kind,
                id: id.clone(),
            })
    }

    /// Resolve, returning `None` if absent
    ///
    /// # Errors
    /// Store errors only.
    pub async fn try_resolve(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<EntityHandle>> {
        let key = (kind, id.clone());
        if let Some(hit) = self.cache.get(&key).await {
            trace!(%kind, %id, "resolver cache hit");
            return Ok(Some(hit));
        }

        let Some(stored) = self.store.get(kind, id).await? else {
            return Ok(None);
        };
        let handle = Arc::new(stored);
        self.cache.insert(key, Arc::clone(&handle)).await;
        Ok(Some(handle))
    }

    /// Resolve many identifiers of one kind; absent ones are omitted
    ///
    /// Cache misses are fetched with a single batched read.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn resolve_many(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, EntityHandle>> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        let mut seen = HashSet::with_capacity(ids.len());

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            match self.cache.get(&(kind, id.clone())).await {
                Some(hit) => {
                    found.insert(id.clone(), hit);
                }
                None => misses.push(id.clone()),
            }
        }

        if !misses.is_empty() {
            for (id, stored) in self.store.get_many(kind, &misses).await? {
                let handle = Arc::new(stored);
                self.cache.insert((kind, id.clone()), Arc::clone(&handle)).await;
                found.insert(id, handle);
            }
        }

        Ok(found)
    }

    /// Read through to the store and refresh the cache
    ///
    /// # Errors
    /// Store errors only.
    pub async fn fetch_fresh(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredEntity>> {
        let key = (kind, id.clone());
        match self.store.get(kind, id).await? {
            Some(stored) => {
                self.cache.insert(key, Arc::new(stored.clone())).await;
                Ok(Some(stored))
            }
            None => {
                self.cache.invalidate(&key).await;
                Ok(None)
            }
        }
    }

    /// Resolve every reference edge of a candidate
    ///
    /// Unresolved references are recorded rather than returned as errors;
    /// the validator decides which of them are violations.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn resolve_parents(&self, entity: &Entity) -> Result<ParentChain> {
        let mut chain = ParentChain::new();
        for (edge, value) in entity.edges() {
            match value {
                Some(id) => match self.try_resolve(edge.parent, id).await? {
                    Some(handle) => {
                        chain.resolved.insert(edge.field, handle);
                    }
                    None => chain.missing.push(MissingReference {
                        edge,
                        id: Some(id.clone()),
                    }),
                },
                None if edge.required => {
                    chain.missing.push(MissingReference { edge, id: None });
                }
                None => {}
            }
        }
        Ok(chain)
    }

    /// Follow `field` links of `kind` starting at `start`
    ///
    /// Stops at a null link, an absent record, a repeated identifier, or
    /// after `max_depth + 1` hops.
    ///
    /// # Errors
    /// Store errors only.
    pub async fn walk_links(
        &self,
        kind: EntityKind,
        field: &'static str,
        start: &EntityId,
        max_depth: usize,
    ) -> Result<Ancestry> {
        let mut chain: Vec<EntityHandle> = Vec::new();
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut next = Some(start.clone());

        while let Some(id) = next.take() {
            if chain.len() > max_depth {
                return Ok(Ancestry {
                    chain,
                    end: WalkEnd::DepthExceeded,
                });
            }
            if !visited.insert(id.clone()) {
                return Ok(Ancestry {
                    chain,
                    end: WalkEnd::Repeated(id),
                });
            }
            let Some(handle) = self.try_resolve(kind, &id).await? else {
                return Ok(Ancestry {
                    chain,
                    end: WalkEnd::Missing(id),
                });
            };
            next = handle.entity.reference(field).cloned();
            chain.push(handle);
        }

        Ok(Ancestry {
            chain,
            end: WalkEnd::Root,
        })
    }

    /// Ancestors of an ROI whose parent is `parent_roi_id`, nearest first
    ///
    /// # Errors
    /// Store errors only.
    pub async fn roi_ancestry(
        &self,
        parent_roi_id: Option<&EntityId>,
        max_depth: usize,
    ) -> Result<Ancestry> {
        match parent_roi_id {
            Some(parent) => {
                self.walk_links(EntityKind::Roi, "parent_roi_id", parent, max_depth)
                    .await
            }
            None => Ok(Ancestry::root()),
        }
    }

    /// Acquisitions replaced by one that replaces `target`, nearest first
    ///
    /// # Errors
    /// Store errors only.
    pub async fn replacement_chain(
        &self,
        target: Option<&EntityId>,
        max_depth: usize,
    ) -> Result<Ancestry> {
        match target {
            Some(target) => {
                self.walk_links(
                    EntityKind::Acquisition,
                    "replaces_acquisition_id",
                    target,
                    max_depth,
                )
                .await
            }
            None => Ok(Ancestry::root()),
        }
    }

    /// Best-effort view of every reference of `entity`
    ///
    /// # Errors
    /// Store errors only; absent parents become [`ReferenceTarget::Missing`].
    pub async fn materialize(&self, entity: &Entity) -> Result<Vec<MaterializedReference>> {
        let mut references = Vec::new();
        for (edge, value) in entity.edges() {
            let target = match value {
                None => ReferenceTarget::Null,
                Some(id) => match self.try_resolve(edge.parent, id).await? {
                    Some(handle) => ReferenceTarget::Resolved(handle),
                    None => ReferenceTarget::Missing(id.clone()),
                },
            };
            references.push(MaterializedReference { edge, target });
        }
        Ok(references)
    }

    /// Drop one cached record
    pub async fn invalidate(&self, kind: EntityKind, id: &EntityId) {
        self.cache.invalidate(&(kind, id.clone())).await;
    }

    /// Drop every cached record
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Number of cached records after pending maintenance
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use temdb_model::{Metadata, Roi, Specimen};
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

    fn setup() -> (Arc<MemoryStore>, Resolver) {
        let store = Arc::new(MemoryStore::new());
        let resolver = Resolver::new(store.clone(), 100);
        (store, resolver)
    }

    #[tokio::test]
    async fn resolve_missing_is_reference_not_found() {
        let (_, resolver) = setup();
        let err = resolver
            .resolve(EntityKind::Specimen, &EntityId::new("SPEC404"))
            .await
            .unwrap_err();
        assert!(matches!(err, IntegrityError::ReferenceNotFound { .. }));
    }

    #[tokio::test]
    async fn cached_until_invalidated() {
        let (store, resolver) = setup();
        store.insert(specimen("SPEC001")).await.unwrap();
        let id = EntityId::new("SPEC001");

        assert!(resolver.try_resolve(EntityKind::Specimen, &id).await.unwrap().is_some());
        store.delete(EntityKind::Specimen, &id).await.unwrap();

        // Stale until invalidated
        assert!(resolver.try_resolve(EntityKind::Specimen, &id).await.unwrap().is_some());
        resolver.invalidate(EntityKind::Specimen, &id).await;
        assert!(resolver.try_resolve(EntityKind::Specimen, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_many_dedupes_and_omits_missing() {
        let (store, resolver) = setup();
        store.insert(specimen("SPEC001")).await.unwrap();
        store.insert(specimen("SPEC002")).await.unwrap();
        resolver
            .resolve(EntityKind::Specimen, &EntityId::new("SPEC001"))
            .await
            .unwrap();

        let ids = [
            EntityId::new("SPEC001"),
            EntityId::new("SPEC002"),
            EntityId::new("SPEC002"),
            EntityId::new("SPEC003"),
        ];
        let found = resolver.resolve_many(EntityKind::Specimen, &ids).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(resolver.entry_count().await, 2);
    }

    #[tokio::test]
    async fn fetch_fresh_bypasses_cache() {
        let (store, resolver) = setup();
        store.insert(specimen("SPEC001")).await.unwrap();
        let id = EntityId::new("SPEC001");
        resolver.resolve(EntityKind::Specimen, &id).await.unwrap();
        store.delete(EntityKind::Specimen, &id).await.unwrap();

        assert!(resolver.fetch_fresh(EntityKind::Specimen, &id).await.unwrap().is_none());
        assert!(resolver.try_resolve(EntityKind::Specimen, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn walk_detects_repeated_link() {
        let (store, resolver) = setup();
        store.insert(roi("A", Some("B"))).await.unwrap();
        store.insert(roi("B", Some("A"))).await.unwrap();

        let ancestry = resolver
            .roi_ancestry(Some(&EntityId::new("A")), 32)
            .await
            .unwrap();
        assert_eq!(ancestry.chain.len(), 2);
        assert_eq!(ancestry.end, WalkEnd::Repeated(EntityId::new("A")));
    }

    #[tokio::test]
    async fn walk_stops_at_depth_bound() {
        let (store, resolver) = setup();
        store.insert(roi("R0", None)).await.unwrap();
        for i in 1..=5 {
            store
                .insert(roi(&format!("R{i}"), Some(&format!("R{}", i - 1))))
                .await
                .unwrap();
        }

        let full = resolver.roi_ancestry(Some(&EntityId::new("R5")), 32).await.unwrap();
        assert_eq!(full.chain.len(), 6);
        assert_eq!(full.end, WalkEnd::Root);

        let bounded = resolver.roi_ancestry(Some(&EntityId::new("R5")), 2).await.unwrap();
        assert_eq!(bounded.chain.len(), 3);
        assert_eq!(bounded.end, WalkEnd::DepthExceeded);
    }

    #[tokio::test]
    async fn parents_record_missing_references() {
        let (store, resolver) = setup();
        store.insert(roi("P", None)).await.unwrap();
        let child = roi("C", Some("P"));

        let chain = resolver.resolve_parents(&child).await.unwrap();
        assert!(chain.get("parent_roi_id").is_some());
        assert_eq!(chain.missing().len(), 1);
        assert_eq!(chain.missing()[0].edge.field, "section_id");

        let refs = resolver.materialize(&child).await.unwrap();
        assert!(refs
            .iter()
            .any(|r| matches!(r.target, ReferenceTarget::Missing(_))));
    }
}
