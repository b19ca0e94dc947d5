//! Error types for the integrity engine
//!
//! Every failure maps onto an [`ErrorKind`] so the API layer can translate
//! it without matching on variants. Validation failures carry the full list
//! of [`Violation`]s and report the kind of the first one.

use crate::config::ConfigError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use temdb_model::{AcquisitionPhase, EntityId, EntityKind, IdError};
use temdb_store::StoreError;

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A parent needed for allocation was missing
    ParentNotResolved,
    /// A referenced record does not exist
    ReferenceNotFound,
    /// Sequence allocation lost too many races
    AllocationConflict,
    /// A reference chain loops back on itself
    CycleDetected,
    /// An ROI level disagrees with its parent
    LevelMismatch,
    /// An identifier does not extend its parent's
    PrefixMismatch,
    /// Two siblings share a sequence number
    DuplicateSequenceNumber,
    /// A lifecycle event is not allowed in the current state
    IllegalTransition,
    /// A failure was recorded without a message
    MissingErrorMessage,
    /// A replacement targets an unfinished acquisition
    ReplacementTargetActive,
    /// A replaced acquisition already has a successor
    ReplacementConflict,
    /// A lens-correction link points at the wrong kind of run
    InvalidLensCorrection,
    /// A rejecting delete found dependents
    HasDependents,
    /// A caller-supplied identifier is already used
    IdentifierTaken,
    /// An identifier is malformed
    InvalidIdentifier,
    /// A revision-checked update lost too many races
    ConcurrentModification,
    /// The backing store failed
    Store,
    /// Configuration is invalid
    Config,
}

impl ErrorKind {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParentNotResolved => "parent_not_resolved",
            Self::ReferenceNotFound => "reference_not_found",
            Self::AllocationConflict => "allocation_conflict",
            Self::CycleDetected => "cycle_detected",
            Self::LevelMismatch => "level_mismatch",
            Self::PrefixMismatch => "prefix_mismatch",
            Self::DuplicateSequenceNumber => "duplicate_sequence_number",
            Self::IllegalTransition => "illegal_transition",
            Self::MissingErrorMessage => "missing_error_message",
            Self::ReplacementTargetActive => "replacement_target_active",
            Self::ReplacementConflict => "replacement_conflict",
            Self::InvalidLensCorrection => "invalid_lens_correction",
            Self::HasDependents => "has_dependents",
            Self::IdentifierTaken => "identifier_taken",
            Self::InvalidIdentifier => "invalid_identifier",
            Self::ConcurrentModification => "concurrent_modification",
            Self::Store => "store",
            Self::Config => "config",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed structural check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Category
    pub kind: ErrorKind,
    /// Field the check concerns, if any
    pub field: Option<&'static str>,
    /// Human readable detail
    pub message: String,
}

impl Violation {
    /// Create a violation not tied to a field
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            message: message.into(),
        }
    }

    /// Create a violation on a field
    #[must_use]
    pub fn on(kind: ErrorKind, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field),
            message: message.into(),
        }
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.field {
            Some(field) => write!(f, "{}: {field}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Main integrity error type
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// A parent needed to derive an identifier was not supplied
    #[error("cannot allocate {kind}: parent '{field}' not resolved")]
    ParentNotResolved {
        /// Kind being allocated
        kind: EntityKind,
        /// Missing reference field
        field: &'static str,
    },

    /// Referenced entity does not exist
    #[error("{kind} '{id}' not found")]
    ReferenceNotFound {
        /// Expected kind
        kind: EntityKind,
        /// Identifier looked up
        id: EntityId,
    },

    /// Counter compare-and-swap kept losing
    #[error("allocation in scope {scope} lost {attempts} consecutive races")]
    AllocationConflict {
        /// Counter scope
        scope: String,
        /// Attempts made
        attempts: u32,
    },

    /// One or more structural checks failed
    #[error("{kind} '{id}' failed validation: {}", join_violations(.violations))]
    Validation {
        /// Kind of the candidate
        kind: EntityKind,
        /// Candidate identifier
        id: EntityId,
        /// Every failed check
        violations: Vec<Violation>,
    },

    /// Cascade plan contains a cycle
    #[error("dependency cycle through {kind} '{id}'")]
    CycleDetected {
        /// Kind of the cascade root
        kind: EntityKind,
        /// Cascade root
        id: EntityId,
    },

    /// Event not allowed in the current state
    #[error("{kind} '{id}': cannot apply {event} in state {state}")]
    IllegalTransition {
        /// Entity kind
        kind: EntityKind,
        /// Entity identifier
        id: EntityId,
        /// Current state
        state: String,
        /// Rejected event
        event: String,
    },

    /// `failed` requires an error message
    #[error("task '{id}': failing requires a non-empty error message")]
    MissingErrorMessage {
        /// Task identifier
        id: EntityId,
    },

    /// Replacement target has not finished imaging
    #[error("acquisition '{target}' is still {phase}; only finished acquisitions can be replaced")]
    ReplacementTargetActive {
        /// Acquisition to be replaced
        target: EntityId,
        /// Its current phase
        phase: AcquisitionPhase,
    },

    /// Replacement target already has a successor
    #[error("acquisition '{target}' already has an active successor")]
    ReplacementConflict {
        /// Acquisition to be replaced
        target: EntityId,
    },

    /// Delete rejected because dependents exist
    #[error("{kind} '{id}' has dependents: {}", format_counts(.dependents))]
    HasDependents {
        /// Kind of the delete target
        kind: EntityKind,
        /// Delete target
        id: EntityId,
        /// Dependent count per kind
        dependents: BTreeMap<EntityKind, usize>,
    },

    /// Caller-supplied identifier already exists
    #[error("{kind} '{id}' already exists")]
    IdentifierTaken {
        /// Entity kind
        kind: EntityKind,
        /// Identifier
        id: EntityId,
    },

    /// Malformed identifier
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdError),

    /// Revision compare-and-swap kept losing
    #[error("{kind} '{id}' modified concurrently {attempts} times")]
    ConcurrentModification {
        /// Entity kind
        kind: EntityKind,
        /// Entity identifier
        id: EntityId,
        /// Attempts made
        attempts: u32,
    },

    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IntegrityError {
    /// Map onto the taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ParentNotResolved { .. } => ErrorKind::ParentNotResolved,
            Self::ReferenceNotFound { .. } => ErrorKind::ReferenceNotFound,
            Self::AllocationConflict { .. } => ErrorKind::AllocationConflict,
            Self::Validation { violations, .. } => violations
                .first()
                .map_or(ErrorKind::InvalidIdentifier, |v| v.kind),
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::MissingErrorMessage { .. } => ErrorKind::MissingErrorMessage,
            Self::ReplacementTargetActive { .. } => ErrorKind::ReplacementTargetActive,
            Self::ReplacementConflict { .. } => ErrorKind::ReplacementConflict,
            Self::HasDependents { .. } => ErrorKind::HasDependents,
            Self::IdentifierTaken { .. } => ErrorKind::IdentifierTaken,
            Self::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AllocationConflict { .. } | Self::ConcurrentModification { .. } => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Violations of a validation failure; empty for other errors
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation { violations, .. } => violations,
            _ => &[],
        }
    }

    /// Check if any violation (or the error itself) has `kind`
    #[must_use]
    pub fn involves(&self, kind: ErrorKind) -> bool {
        self.kind() == kind || self.violations().iter().any(|v| v.kind == kind)
    }
}

/// Result type for integrity operations
pub type Result<T, E = IntegrityError> = std::result::Result<T, E>;

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_counts(counts: &BTreeMap<EntityKind, usize>) -> String {
    counts
        .iter()
        .map(|(kind, n)| format!("{n} {kind}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_kind_is_first_violation() {
        let err = IntegrityError::Validation {
            kind: EntityKind::Roi,
            id: EntityId::new("SPEC001.BLK001.SEC001.SUB001.ROI001.ROI001"),
            violations: vec![
                Violation::on(ErrorKind::LevelMismatch, "hierarchy_level", "expected 2, got 1"),
                Violation::new(ErrorKind::PrefixMismatch, "bad prefix"),
            ],
        };
        assert_eq!(err.kind(), ErrorKind::LevelMismatch);
        assert!(err.involves(ErrorKind::PrefixMismatch));
        assert!(!err.involves(ErrorKind::CycleDetected));
        assert!(err.to_string().contains("level_mismatch: hierarchy_level: expected 2, got 1"));
    }

    #[test]
    fn retryable_errors() {
        let conflict = IntegrityError::AllocationConflict {
            scope: "block/specimen_id=SPEC001".into(),
            attempts: 8,
        };
        assert!(conflict.is_retryable());

        let taken = IntegrityError::IdentifierTaken {
            kind: EntityKind::Specimen,
            id: EntityId::new("SPEC001"),
        };
        assert!(!taken.is_retryable());
        assert_eq!(taken.kind(), ErrorKind::IdentifierTaken);

        let store = IntegrityError::from(StoreError::RevisionConflict {
            kind: EntityKind::AcquisitionTask,
            id: EntityId::new("TASK_1"),
            expected: 1,
            actual: 2,
        });
        assert!(store.is_retryable());
        assert_eq!(store.kind(), ErrorKind::Store);
    }

    #[test]
    fn dependents_are_listed_by_kind() {
        let mut dependents = BTreeMap::new();
        dependents.insert(EntityKind::Block, 2);
        dependents.insert(EntityKind::AcquisitionTask, 1);
        let err = IntegrityError::HasDependents {
            kind: EntityKind::Specimen,
            id: EntityId::new("SPEC001"),
            dependents,
        };
        assert_eq!(
            err.to_string(),
            "specimen 'SPEC001' has dependents: 2 block, 1 acquisition_task"
        );
    }
}
