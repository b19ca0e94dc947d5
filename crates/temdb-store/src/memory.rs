//! In-memory document store
//!
//! Records live in a [`DashMap`] keyed by `(kind, id)`. A reverse index keyed
//! by `(kind, field, parent id)` answers child listings without a scan.
//! Counter compare-and-swap holds the counter's shard lock for the whole
//! read-compare-write, so it is atomic across tasks.

use crate::error::StoreError;
use crate::store::{DocumentStore, Revision, StoredEntity};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use temdb_model::{Entity, EntityId, EntityKind, ScopeKey};
use tracing::trace;

type RecordKey = (EntityKind, EntityId);
type ReferenceKey = (EntityKind, &'static str, EntityId);

/// Thread-safe in-memory [`DocumentStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<RecordKey, StoredEntity>,
    by_reference: DashMap<ReferenceKey, HashSet<EntityId>>,
    counters: DashMap<ScopeKey, u64>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of all kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records of one kind
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.records.iter().filter(|r| r.key().0 == kind).count()
    }

    fn index(&self, entity: &Entity) {
        for (edge, value) in entity.edges() {
            if let Some(parent) = value {
                self.by_reference
                    .entry((edge.child, edge.field, parent.clone()))
                    .or_default()
                    .insert(entity.id().clone());
            }
        }
    }

    fn unindex(&self, entity: &Entity) {
        for (edge, value) in entity.edges() {
            if let Some(parent) = value {
                let key = (edge.child, edge.field, parent.clone());
                let emptied = self
                    .by_reference
                    .get_mut(&key)
                    .map(|mut ids| {
                        ids.remove(entity.id());
                        ids.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    self.by_reference.remove_if(&key, |_, ids| ids.is_empty());
                }
            }
        }
    }

    fn scan(&self, kind: EntityKind, predicate: impl Fn(&Entity) -> bool) -> Vec<StoredEntity> {
        let mut found: Vec<StoredEntity> = self
            .records
            .iter()
            .filter(|r| r.key().0 == kind && predicate(&r.value().entity))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredEntity>, StoreError> {
        Ok(self
            .records
            .get(&(kind, id.clone()))
            .map(|r| r.value().clone()))
    }

    async fn get_many(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, StoredEntity>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.records
                    .get(&(kind, id.clone()))
                    .map(|r| (id.clone(), r.value().clone()))
            })
            .collect())
    }

    async fn insert(&self, entity: Entity) -> Result<Revision, StoreError> {
        let key = (entity.kind(), entity.id().clone());
        match self.records.entry(key) {
            Entry::Occupied(occupied) => Err(StoreError::DuplicateKey {
                kind: occupied.key().0,
                id: occupied.key().1.clone(),
            }),
            Entry::Vacant(vacant) => {
                self.index(&entity);
                trace!(kind = %entity.kind(), id = %entity.id(), "insert");
                vacant.insert(StoredEntity {
                    entity,
                    revision: Revision::INITIAL,
                });
                Ok(Revision::INITIAL)
            }
        }
    }

    async fn update(&self, entity: Entity, expected: Revision) -> Result<Revision, StoreError> {
        let kind = entity.kind();
        let id = entity.id().clone();
        let Some(mut current) = self.records.get_mut(&(kind, id.clone())) else {
            return Err(StoreError::NotFound { kind, id });
        };
        if current.revision != expected {
            return Err(StoreError::RevisionConflict {
                kind,
                id,
                expected: expected.0,
                actual: current.revision.0,
            });
        }
        self.unindex(&current.entity);
        self.index(&entity);
        let revision = current.revision.next();
        *current = StoredEntity { entity, revision };
        trace!(%kind, %id, %revision, "update");
        Ok(revision)
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError> {
        match self.records.remove(&(kind, id.clone())) {
            Some((_, stored)) => {
                self.unindex(&stored.entity);
                trace!(%kind, %id, "delete");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_by_reference(
        &self,
        kind: EntityKind,
        field: &str,
        value: Option<&EntityId>,
    ) -> Result<Vec<StoredEntity>, StoreError> {
        let indexed = kind.references().find(|edge| edge.field == field);
        let (Some(edge), Some(parent)) = (indexed, value) else {
            return Ok(self.scan(kind, |e| e.reference(field) == value));
        };

        let ids: Vec<EntityId> = self
            .by_reference
            .get(&(kind, edge.field, parent.clone()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut found: Vec<StoredEntity> = ids
            .iter()
            .filter_map(|id| self.records.get(&(kind, id.clone())).map(|r| r.value().clone()))
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(found)
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        Ok(self.scan(kind, |_| true))
    }

    async fn read_counter(&self, scope: &ScopeKey) -> Result<u64, StoreError> {
        Ok(self.counters.get(scope).map_or(0, |v| *v))
    }

    async fn compare_and_swap_counter(
        &self,
        scope: &ScopeKey,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError> {
        let swapped = match self.counters.entry(scope.clone()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() == expected {
                    occupied.insert(new);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected == 0 {
                    vacant.insert(new);
                    true
                } else {
                    false
                }
            }
        };
        trace!(%scope, expected, new, swapped, "counter cas");
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use temdb_model::{Block, Metadata, Specimen};

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

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = MemoryStore::new();
        assert_eq!(store.insert(specimen("SPEC001")).await.unwrap(), Revision::INITIAL);
        let err = store.insert(specimen("SPEC001")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_is_compare_and_swap() {
        let store = MemoryStore::new();
        store.insert(specimen("SPEC001")).await.unwrap();

        let next = store
            .update(specimen("SPEC001"), Revision::INITIAL)
            .await
            .unwrap();
        assert_eq!(next, Revision(2));

        let stale = store.update(specimen("SPEC001"), Revision::INITIAL).await;
        assert!(matches!(
            stale,
            Err(StoreError::RevisionConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));

        let missing = store.update(specimen("SPEC404"), Revision::INITIAL).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.insert(specimen("SPEC001")).await.unwrap();
        let id = EntityId::new("SPEC001");
        assert!(store.delete(EntityKind::Specimen, &id).await.unwrap());
        assert!(!store.delete(EntityKind::Specimen, &id).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn find_by_reference_uses_index() {
        let store = MemoryStore::new();
        store.insert(specimen("SPEC001")).await.unwrap();
        store.insert(block("SPEC001", 2)).await.unwrap();
        store.insert(block("SPEC001", 1)).await.unwrap();
        store.insert(block("SPEC002", 1)).await.unwrap();

        let parent = EntityId::new("SPEC001");
        let children = store
            .find_by_reference(EntityKind::Block, "specimen_id", Some(&parent))
            .await
            .unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.id().as_str()).collect();
        assert_eq!(ids, ["SPEC001.BLK001", "SPEC001.BLK002"]);

        store
            .delete(EntityKind::Block, &EntityId::new("SPEC001.BLK001"))
            .await
            .unwrap();
        let children = store
            .find_by_reference(EntityKind::Block, "specimen_id", Some(&parent))
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(store.count(EntityKind::Block), 2);
    }

    #[tokio::test]
    async fn get_many_omits_missing() {
        let store = MemoryStore::new();
        store.insert(specimen("SPEC001")).await.unwrap();
        let ids = [EntityId::new("SPEC001"), EntityId::new("SPEC002")];
        let found = store.get_many(EntityKind::Specimen, &ids).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("SPEC001"));
    }

    #[tokio::test]
    async fn counter_cas_from_zero() {
        let store = MemoryStore::new();
        let scope = ScopeKey::global(EntityKind::Specimen);
        assert_eq!(store.read_counter(&scope).await.unwrap(), 0);
        assert!(!store.compare_and_swap_counter(&scope, 3, 4).await.unwrap());
        assert!(store.compare_and_swap_counter(&scope, 0, 1).await.unwrap());
        assert!(!store.compare_and_swap_counter(&scope, 0, 1).await.unwrap());
        assert_eq!(store.read_counter(&scope).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_counter_increments_are_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let scope = ScopeKey::global(EntityKind::Substrate);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let scope = scope.clone();
                tokio::spawn(async move {
                    let mut won = Vec::new();
                    while won.len() < 25 {
                        let current = store.read_counter(&scope).await.unwrap();
                        if store
                            .compare_and_swap_counter(&scope, current, current + 1)
                            .await
                            .unwrap()
                        {
                            won.push(current + 1);
                        }
                    }
                    won
                })
            })
            .collect();

        let mut all: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flat_map(Result::unwrap)
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());
    }
}
