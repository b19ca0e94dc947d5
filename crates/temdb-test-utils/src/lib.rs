//! Testing utilities for the temdb workspace
//!
//! Shared engine constructors, a seeded pipeline, a deterministic clock and
//! a store wrapper that loses compare-and-swap races on demand.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use temdb_integrity::{Clock, IntegrityConfig, IntegrityEngine, NewTask};
use temdb_model::{Entity, EntityId, EntityKind, Metadata, ScopeKey};
use temdb_store::{DocumentStore, MemoryStore, Revision, StoreError, StoredEntity};

/// Fixed start time for deterministic clocks
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Move the clock anywhere, including backwards
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(epoch())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Record written into the inner store when a reference lookup runs
#[derive(Debug)]
struct Planted {
    kind: EntityKind,
    field: &'static str,
    remaining: u64,
    entity: Entity,
}

/// [`MemoryStore`] that loses every `n`th counter swap or revision update
///
/// A lost swap returns `false` and a lost update returns
/// `RevisionConflict`, in both cases without touching the inner store, the
/// same as if another writer had won the race. It can also fail counter
/// releases or inserts of one kind with a backend error, and write a record
/// behind the caller's back in the middle of a reference lookup.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    lose_swap_every: u64,
    lose_update_every: u64,
    swaps: AtomicU64,
    updates: AtomicU64,
    lost: AtomicU64,
    failing_releases: AtomicU64,
    failing_inserts: Mutex<Option<(EntityKind, u64)>>,
    planted: Mutex<Option<Planted>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn losing_swaps(mut self, every: u64) -> Self {
        self.lose_swap_every = every;
        self
    }

    pub fn losing_updates(mut self, every: u64) -> Self {
        self.lose_update_every = every;
        self
    }

    /// Fail the next `count` counter swaps that lower a value
    pub fn failing_releases(self, count: u64) -> Self {
        self.failing_releases.store(count, Ordering::SeqCst);
        self
    }

    /// Let `after` inserts of `kind` through, then fail the next one
    pub fn failing_insert(self, kind: EntityKind, after: u64) -> Self {
        *self.failing_inserts.lock() = Some((kind, after));
        self
    }

    /// Insert `entity` during the `nth` lookup of `kind` by `field`
    pub fn planting(self, kind: EntityKind, field: &'static str, nth: u64, entity: Entity) -> Self {
        *self.planted.lock() = Some(Planted {
            kind,
            field,
            remaining: nth,
            entity,
        });
        self
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Number of swaps and updates lost so far
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert_fails(&self, kind: EntityKind) -> bool {
        let mut guard = self.failing_inserts.lock();
        match guard.as_mut() {
            Some((target, after)) if *target == kind => {
                if *after == 0 {
                    *guard = None;
                    true
                } else {
                    *after -= 1;
                    false
                }
            }
            _ => false,
        }
    }

    fn take_planted(&self, kind: EntityKind, field: &str) -> Option<Entity> {
        let mut guard = self.planted.lock();
        let planted = guard.as_mut()?;
        if planted.kind != kind || planted.field != field {
            return None;
        }
        planted.remaining = planted.remaining.saturating_sub(1);
        if planted.remaining > 0 {
            return None;
        }
        guard.take().map(|p| p.entity)
    }

    fn should_lose(&self, calls: &AtomicU64, every: u64) -> bool {
        if every == 0 {
            return false;
        }
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let lose = n % every == 0;
        if lose {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
        lose
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<Option<StoredEntity>, StoreError> {
        self.inner.get(kind, id).await
    }

    async fn get_many(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, StoredEntity>, StoreError> {
        self.inner.get_many(kind, ids).await
    }

    async fn insert(&self, entity: Entity) -> Result<Revision, StoreError> {
        if self.insert_fails(entity.kind()) {
            return Err(StoreError::Backend("write timed out".into()));
        }
        self.inner.insert(entity).await
    }

    async fn update(&self, entity: Entity, expected: Revision) -> Result<Revision, StoreError> {
        if self.should_lose(&self.updates, self.lose_update_every) {
            return Err(StoreError::RevisionConflict {
                kind: entity.kind(),
                id: entity.id().clone(),
                expected: expected.0,
                actual: expected.0 + 1,
            });
        }
        self.inner.update(entity, expected).await
    }

    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError> {
        self.inner.delete(kind, id).await
    }

    async fn find_by_reference(
        &self,
        kind: EntityKind,
        field: &str,
        value: Option<&EntityId>,
    ) -> Result<Vec<StoredEntity>, StoreError> {
        if let Some(entity) = self.take_planted(kind, field) {
            self.inner.insert(entity).await?;
        }
        self.inner.find_by_reference(kind, field, value).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError> {
        self.inner.list(kind).await
    }

    async fn read_counter(&self, scope: &ScopeKey) -> Result<u64, StoreError> {
        self.inner.read_counter(scope).await
    }

    async fn compare_and_swap_counter(
        &self,
        scope: &ScopeKey,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError> {
        if new < expected && Self::take_failure(&self.failing_releases) {
            return Err(StoreError::Backend("connection reset".into()));
        }
        if self.should_lose(&self.swaps, self.lose_swap_every) {
            return Ok(false);
        }
        self.inner
            .compare_and_swap_counter(scope, expected, new)
            .await
    }
}

/// Config with no backoff sleeps, for fast tests
pub fn test_config() -> IntegrityConfig {
    IntegrityConfig::default().with_backoff(0, 0)
}

pub fn memory_engine() -> IntegrityEngine {
    engine_over(Arc::new(MemoryStore::new()))
}

pub fn engine_over(store: Arc<dyn DocumentStore>) -> IntegrityEngine {
    IntegrityEngine::new(store, test_config()).unwrap()
}

/// Engine over a fresh store driven by `clock`
pub fn engine_with_clock(clock: Arc<ManualClock>) -> IntegrityEngine {
    IntegrityEngine::with_clock(Arc::new(MemoryStore::new()), test_config(), clock).unwrap()
}

/// One record of each kind down to a task, all numbered 001
#[derive(Debug, Clone)]
pub struct SeededPipeline {
    pub specimen: EntityId,
    pub block: EntityId,
    pub cutting_session: EntityId,
    pub substrate: EntityId,
    pub section: EntityId,
    pub roi: EntityId,
    pub task: EntityId,
}

impl SeededPipeline {
    pub fn new_task(&self) -> NewTask {
        NewTask::new(self.specimen.clone(), self.block.clone(), self.roi.clone())
    }
}

/// Create specimen → block → session → substrate → section → ROI → task
pub async fn seed_pipeline(engine: &IntegrityEngine) -> SeededPipeline {
    let specimen = engine.create_specimen(Metadata::new()).await.unwrap();
    let block = engine
        .create_block(specimen.id(), Metadata::new())
        .await
        .unwrap();
    let session = engine
        .create_cutting_session(block.id(), Metadata::new())
        .await
        .unwrap();
    let substrate = engine
        .create_substrate(None, Some("tape".into()), Metadata::new())
        .await
        .unwrap();
    let section = engine
        .create_section(session.id(), substrate.id(), Metadata::new())
        .await
        .unwrap();
    let roi = engine
        .create_roi(section.id(), None, Metadata::new())
        .await
        .unwrap();
    let task = engine
        .create_task(NewTask::new(
            specimen.id().clone(),
            block.id().clone(),
            roi.id().clone(),
        ))
        .await
        .unwrap();

    SeededPipeline {
        specimen: specimen.id().clone(),
        block: block.id().clone(),
        cutting_session: session.id().clone(),
        substrate: substrate.id().clone(),
        section: section.id().clone(),
        roi: roi.id().clone(),
        task: task.id().clone(),
    }
}
