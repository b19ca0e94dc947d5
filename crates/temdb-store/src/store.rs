//! The persistence interface consumed by the integrity engine

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use temdb_model::{Entity, EntityId, EntityKind, ScopeKey};

/// Opaque storage revision, bumped on every update
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// Revision assigned on insert
    pub const INITIAL: Self = Self(1);

    /// Following revision
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A record as read from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// The record
    pub entity: Entity,
    /// Revision to pass back to [`DocumentStore::update`]
    pub revision: Revision,
}

impl StoredEntity {
    /// Kind of the record
    #[inline]
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.entity.kind()
    }

    /// Identifier of the record
    #[inline]
    #[must_use]
    pub fn id(&self) -> &EntityId {
        self.entity.id()
    }
}

/// Schemaless document store shared by concurrent writers
///
/// Point reads and writes are keyed by `(kind, id)`. Counters are the only
/// cross-request serialization primitive and must be atomic across
/// processes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read
    async fn get(&self, kind: EntityKind, id: &EntityId)
        -> Result<Option<StoredEntity>, StoreError>;

    /// Batched read; absent identifiers are omitted from the result
    async fn get_many(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> Result<HashMap<EntityId, StoredEntity>, StoreError>;

    /// Insert a new record
    ///
    /// # Errors
    /// [`StoreError::DuplicateKey`] if the identifier exists.
    async fn insert(&self, entity: Entity) -> Result<Revision, StoreError>;

    /// Replace a record if its revision is still `expected`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] or [`StoreError::RevisionConflict`].
    async fn update(&self, entity: Entity, expected: Revision) -> Result<Revision, StoreError>;

    /// Delete a record; `false` if it was already absent
    async fn delete(&self, kind: EntityKind, id: &EntityId) -> Result<bool, StoreError>;

    /// Records of `kind` whose reference `field` equals `value`
    ///
    /// `None` matches records where the field is null.
    async fn find_by_reference(
        &self,
        kind: EntityKind,
        field: &str,
        value: Option<&EntityId>,
    ) -> Result<Vec<StoredEntity>, StoreError>;

    /// Every record of `kind`
    async fn list(&self, kind: EntityKind) -> Result<Vec<StoredEntity>, StoreError>;

    /// Current value of a counter (0 if never written)
    async fn read_counter(&self, scope: &ScopeKey) -> Result<u64, StoreError>;

    /// Set a counter to `new` if it currently equals `expected`
    ///
    /// Returns `false` when the swap was lost to another writer.
    async fn compare_and_swap_counter(
        &self,
        scope: &ScopeKey,
        expected: u64,
        new: u64,
    ) -> Result<bool, StoreError>;
}
