//! Identifier allocation
//!
//! Sequence numbers come from one store counter per [`ScopeKey`]. The only
//! serialization is the store's compare-and-swap: read the counter, try to
//! swap it to `current + n`, and on a lost race back off (exponential with
//! jitter, capped) and read again. Numbers are never handed out twice and
//! never reused, even after the entity holding them is deleted.

use crate::config::AllocationConfig;
use crate::error::{IntegrityError, Result};
use crate::resolver::ParentChain;
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use temdb_model::{
    is_valid_segment, section_id, tile_id, Entity, EntityId, EntityKind, HierarchicalId,
    IdError, ScopeKey, ACQUISITION_TOKEN_PREFIX, BLOCK_TAG, CUTTING_SESSION_TAG, ROI_TAG,
    SECTION_TAG, SPECIMEN_TAG, SUBSTRATE_TAG, TASK_TOKEN_PREFIX,
};
use temdb_store::DocumentStore;
use tracing::{debug, warn};

/// A freshly minted identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The identifier
    pub id: EntityId,
    /// Sequence number within `scope`; `None` for token identifiers
    pub sequence: Option<u64>,
    /// Counter scope; `None` for token identifiers
    pub scope: Option<ScopeKey>,
}

impl Allocation {
    fn token(prefix: &str) -> Self {
        Self {
            id: EntityId::mint_token(prefix),
            sequence: None,
            scope: None,
        }
    }
}

/// Mints hierarchical identifiers from per-scope counters
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn DocumentStore>,
    config: AllocationConfig,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Create an allocator over `store`'s counters
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: AllocationConfig) -> Self {
        Self { store, config }
    }

    /// Mint an identifier for a new `kind` under `parents`
    ///
    /// `parents` must hold the records the identifier is derived from:
    ///
    /// | Kind | Fields |
    /// |---|---|
    /// | Block | `specimen_id` |
    /// | CuttingSession | `block_id` |
    /// | Section | `cutting_session_id`, `media_id` |
    /// | ROI | `section_id`, plus `parent_roi_id` for child ROIs |
    /// | Tile | `acquisition_id` |
    ///
    /// # Errors
    /// [`IntegrityError::ParentNotResolved`] if a required parent is absent,
    /// [`IntegrityError::AllocationConflict`] once the retry budget is spent.
    pub async fn allocate(&self, kind: EntityKind, parents: &ParentChain) -> Result<Allocation> {
        match kind {
            EntityKind::Specimen => {
                let scope = ScopeKey::global(kind);
                let n = self.next_sequence(&scope).await?;
                Ok(sequenced(
                    HierarchicalId::root(SPECIMEN_TAG, n).to_entity_id(),
                    scope,
                    n,
                ))
            }
            EntityKind::Substrate => {
                let scope = ScopeKey::global(kind);
                let n = self.next_sequence(&scope).await?;
                Ok(sequenced(
                    HierarchicalId::root(SUBSTRATE_TAG, n).to_entity_id(),
                    scope,
                    n,
                ))
            }
            EntityKind::Block => {
                let specimen = require(kind, parents, "specimen_id")?;
                self.dotted(kind, "specimen_id", specimen.id(), BLOCK_TAG)
                    .await
            }
            EntityKind::CuttingSession => {
                let block = require(kind, parents, "block_id")?;
                self.dotted(kind, "block_id", block.id(), CUTTING_SESSION_TAG)
                    .await
            }
            EntityKind::Section => {
                let session = require(kind, parents, "cutting_session_id")?;
                let substrate = require(kind, parents, "media_id")?;
                let scope =
                    ScopeKey::under(kind, "cutting_session_id", session.id().clone());
                let n = self.next_sequence(&scope).await?;
                Ok(sequenced(section_id(substrate.id(), n), scope, n))
            }
            EntityKind::Roi => match parents.get("parent_roi_id") {
                Some(parent) => {
                    self.dotted(kind, "parent_roi_id", parent.id(), ROI_TAG)
                        .await
                }
                None => {
                    let section = require(kind, parents, "section_id")?;
                    let prefix = roi_prefix(section)?;
                    let scope = ScopeKey::under(kind, "section_id", section.id().clone());
                    let n = self.next_sequence(&scope).await?;
                    Ok(sequenced(
                        prefix.child_sequence(ROI_TAG, n).to_entity_id(),
                        scope,
                        n,
                    ))
                }
            },
            EntityKind::Tile => {
                let acquisition = require(kind, parents, "acquisition_id")?;
                let scope =
                    ScopeKey::under(kind, "acquisition_id", acquisition.id().clone());
                let n = self.next_sequence(&scope).await?;
                Ok(sequenced(tile_id(acquisition.id(), n), scope, n))
            }
            EntityKind::AcquisitionTask => Ok(Allocation::token(TASK_TOKEN_PREFIX)),
            EntityKind::Acquisition => Ok(Allocation::token(ACQUISITION_TOKEN_PREFIX)),
        }
    }

    async fn dotted(
        &self,
        kind: EntityKind,
        field: &'static str,
        parent: &EntityId,
        tag: &str,
    ) -> Result<Allocation> {
        let prefix = parent.hierarchical()?;
        let scope = ScopeKey::under(kind, field, parent.clone());
        let n = self.next_sequence(&scope).await?;
        Ok(sequenced(prefix.child_sequence(tag, n).to_entity_id(), scope, n))
    }

    /// Claim the next number in `scope`
    ///
    /// # Errors
    /// [`IntegrityError::AllocationConflict`] once the retry budget is spent.
    pub async fn next_sequence(&self, scope: &ScopeKey) -> Result<u64> {
        Ok(*self.reserve(scope, 1).await?.start())
    }

    /// Claim `count` consecutive numbers in `scope` with one swap
    ///
    /// # Errors
    /// [`IntegrityError::AllocationConflict`] once the retry budget is spent.
    pub async fn reserve(&self, scope: &ScopeKey, count: u64) -> Result<RangeInclusive<u64>> {
        let count = count.max(1);
        for attempt in 0..self.config.max_attempts {
            let current = self.store.read_counter(scope).await?;
            let next = current.saturating_add(count);
            if self
                .store
                .compare_and_swap_counter(scope, current, next)
                .await?
            {
                return Ok(current + 1..=next);
            }
            debug!(%scope, attempt, "counter race lost, retrying");
            self.pause(attempt).await;
        }

        warn!(%scope, attempts = self.config.max_attempts, "allocation conflict");
        Err(IntegrityError::AllocationConflict {
            scope: scope.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Raise the counter of `scope` to at least `sequence`
    ///
    /// Used after importing caller-numbered entities so later allocations
    /// skip past them. A counter already at or beyond `sequence` is left
    /// alone.
    ///
    /// # Errors
    /// [`IntegrityError::AllocationConflict`] once the retry budget is spent.
    pub async fn advance_to(&self, scope: &ScopeKey, sequence: u64) -> Result<()> {
        for attempt in 0..self.config.max_attempts {
            let current = self.store.read_counter(scope).await?;
            if current >= sequence {
                return Ok(());
            }
            if self
                .store
                .compare_and_swap_counter(scope, current, sequence)
                .await?
            {
                debug!(%scope, from = current, to = sequence, "counter advanced");
                return Ok(());
            }
            self.pause(attempt).await;
        }

        Err(IntegrityError::AllocationConflict {
            scope: scope.to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Current counter value of `scope` (the last number handed out)
    ///
    /// # Errors
    /// Store errors only.
    pub async fn current(&self, scope: &ScopeKey) -> Result<u64> {
        Ok(self.store.read_counter(scope).await?)
    }

    async fn pause(&self, attempt: u32) {
        let delay = self.config.backoff(attempt);
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        let half = half_millis(delay);
        let jitter = rand::thread_rng().gen_range(0..=half);
        tokio::time::sleep(Duration::from_millis(half + jitter)).await;
    }
}

/// Half of `delay` in whole milliseconds, saturating for huge delays
fn half_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / 2
}

fn sequenced(id: EntityId, scope: ScopeKey, sequence: u64) -> Allocation {
    Allocation {
        id,
        sequence: Some(sequence),
        scope: Some(scope),
    }
}

fn require<'a>(
    kind: EntityKind,
    parents: &'a ParentChain,
    field: &'static str,
) -> Result<&'a Entity> {
    parents
        .get(field)
        .ok_or(IntegrityError::ParentNotResolved { kind, field })
}

/// Dotted path a top-level ROI of `section` is allocated under:
/// `{specimen}.{block segment}.SEC{section_number}.{media_id}`
///
/// # Errors
/// [`IntegrityError::ParentNotResolved`] if `section` is not a section,
/// [`IntegrityError::InvalidIdentifier`] if its ids are not dotted paths.
pub fn roi_prefix(section: &Entity) -> Result<HierarchicalId> {
    let section = section
        .as_section()
        .ok_or(IntegrityError::ParentNotResolved {
            kind: EntityKind::Roi,
            field: "section_id",
        })?;
    let block = section.block_id.hierarchical()?;
    if !is_valid_segment(section.media_id.as_str()) {
        return Err(IdError::InvalidSegment(section.media_id.to_string()).into());
    }
    Ok(block
        .child_sequence(SECTION_TAG, section.section_number)
        .child(section.media_id.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntegrityConfig;
    use chrono::{DateTime, Utc};
    use std::collections::HashSet;
    use temdb_model::{Metadata, Section, Specimen};
    use temdb_store::{MemoryStore, Revision, StoredEntity};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn huge_backoff_saturates_instead_of_wrapping() {
        assert_eq!(half_millis(Duration::from_millis(10)), 5);
        let half = half_millis(Duration::MAX);
        assert_eq!(half, u64::MAX / 2);
        assert!(half.checked_add(half).is_some());
    }

    fn handle(entity: Entity) -> Arc<StoredEntity> {
        Arc::new(StoredEntity {
            entity,
            revision: Revision::INITIAL,
        })
    }

    fn allocator() -> (Arc<MemoryStore>, Allocator) {
        let store = Arc::new(MemoryStore::new());
        let allocator = Allocator::new(store.clone(), IntegrityConfig::default().allocation);
        (store, allocator)
    }

    fn specimen(id: &str) -> Entity {
        Entity::Specimen(Specimen {
            specimen_id: EntityId::new(id),
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        })
    }

    fn section() -> Entity {
        Entity::Section(Section {
            section_id: EntityId::new("SUB001_S0001"),
            cutting_session_id: EntityId::new("SPEC001.BLK001.CUT001"),
            media_id: EntityId::new("SUB001"),
            specimen_id: EntityId::new("SPEC001"),
            block_id: EntityId::new("SPEC001.BLK001"),
            section_number: 1,
            metadata: Metadata::new(),
            created_at: now(),
            updated_at: now(),
        })
    }

    #[tokio::test]
    async fn specimens_are_numbered_globally() {
        let (_, allocator) = allocator();
        let a = allocator
            .allocate(EntityKind::Specimen, &ParentChain::new())
            .await
            .unwrap();
        let b = allocator
            .allocate(EntityKind::Specimen, &ParentChain::new())
            .await
            .unwrap();
        assert_eq!(a.id.as_str(), "SPEC001");
        assert_eq!(b.id.as_str(), "SPEC002");
        assert_eq!(b.sequence, Some(2));
    }

    #[tokio::test]
    async fn block_requires_specimen() {
        let (_, allocator) = allocator();
        let err = allocator
            .allocate(EntityKind::Block, &ParentChain::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IntegrityError::ParentNotResolved {
                field: "specimen_id",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn blocks_are_scoped_per_specimen() {
        let (_, allocator) = allocator();
        let one = ParentChain::new().with("specimen_id", handle(specimen("SPEC001")));
        let two = ParentChain::new().with("specimen_id", handle(specimen("SPEC002")));

        let a = allocator.allocate(EntityKind::Block, &one).await.unwrap();
        let b = allocator.allocate(EntityKind::Block, &one).await.unwrap();
        let c = allocator.allocate(EntityKind::Block, &two).await.unwrap();
        assert_eq!(a.id.as_str(), "SPEC001.BLK001");
        assert_eq!(b.id.as_str(), "SPEC001.BLK002");
        assert_eq!(c.id.as_str(), "SPEC002.BLK001");
    }

    #[tokio::test]
    async fn top_level_roi_prefix_comes_from_section() {
        let (_, allocator) = allocator();
        let parents = ParentChain::new().with("section_id", handle(section()));
        let first = allocator.allocate(EntityKind::Roi, &parents).await.unwrap();
        let second = allocator.allocate(EntityKind::Roi, &parents).await.unwrap();
        assert_eq!(first.id.as_str(), "SPEC001.BLK001.SEC001.SUB001.ROI001");
        assert_eq!(second.id.as_str(), "SPEC001.BLK001.SEC001.SUB001.ROI002");
    }

    #[tokio::test]
    async fn tokens_for_tasks_and_acquisitions() {
        let (_, allocator) = allocator();
        let task = allocator
            .allocate(EntityKind::AcquisitionTask, &ParentChain::new())
            .await
            .unwrap();
        assert!(task.id.as_str().starts_with("TASK_"));
        assert!(task.scope.is_none());
    }

    #[tokio::test]
    async fn reserve_is_contiguous() {
        let (_, allocator) = allocator();
        let scope = ScopeKey::under(EntityKind::Tile, "acquisition_id", EntityId::new("ACQ_1"));
        assert_eq!(allocator.next_sequence(&scope).await.unwrap(), 1);
        assert_eq!(allocator.reserve(&scope, 4).await.unwrap(), 2..=5);
        assert_eq!(allocator.next_sequence(&scope).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn advance_never_lowers() {
        let (_, allocator) = allocator();
        let scope = ScopeKey::global(EntityKind::Specimen);
        allocator.advance_to(&scope, 7).await.unwrap();
        allocator.advance_to(&scope, 3).await.unwrap();
        assert_eq!(allocator.current(&scope).await.unwrap(), 7);
        assert_eq!(allocator.next_sequence(&scope).await.unwrap(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_yields_distinct_numbers() {
        let store = Arc::new(MemoryStore::new());
        let config = IntegrityConfig::default()
            .with_allocation_attempts(1_000)
            .with_backoff(0, 1)
            .allocation;
        let allocator = Allocator::new(store, config);
        let scope = ScopeKey::global(EntityKind::Specimen);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let allocator = allocator.clone();
                let scope = scope.clone();
                tokio::spawn(async move { allocator.next_sequence(&scope).await.unwrap() })
            })
            .collect();

        let mut seen = HashSet::new();
        for task in tasks {
            assert!(seen.insert(task.await.unwrap()));
        }
        assert_eq!(seen, (1..=16).collect());
    }
}
