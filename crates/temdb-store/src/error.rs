//! Store errors

use temdb_model::{EntityId, EntityKind};
use thiserror::Error;

/// Errors reported by a [`DocumentStore`](crate::DocumentStore)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Insert of an identifier that already exists
    #[error("{kind} '{id}' already exists")]
    DuplicateKey {
        /// Entity kind
        kind: EntityKind,
        /// Identifier
        id: EntityId,
    },

    /// Update of an identifier that does not exist
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind
        kind: EntityKind,
        /// Identifier
        id: EntityId,
    },

    /// Compare-and-swap on revision lost
    #[error("{kind} '{id}' revision conflict: expected {expected}, found {actual}")]
    RevisionConflict {
        /// Entity kind
        kind: EntityKind,
        /// Identifier
        id: EntityId,
        /// Revision the caller read
        expected: u64,
        /// Revision currently stored
        actual: u64,
    },

    /// Driver or backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if a fresh read and retry may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RevisionConflict { .. })
    }
}
