//! Sibling scopes
//!
//! A scope groups the entities whose sequence numbers must be unique and
//! monotonic: every block of one specimen, every child of one ROI, and so on.
//! The same key names the scope's counter in the store.

use crate::id::EntityId;
use crate::kind::EntityKind;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Scope of a per-parent sequence counter
///
/// `field` and `parent` are both `None` for global scopes (specimens,
/// allocated substrates). Otherwise the scope's members are the entities of
/// `kind` whose `field` equals `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScopeKey {
    kind: EntityKind,
    field: Option<&'static str>,
    parent: Option<EntityId>,
}

impl ScopeKey {
    /// Global scope of a root kind
    #[inline]
    #[must_use]
    pub fn global(kind: EntityKind) -> Self {
        Self {
            kind,
            field: None,
            parent: None,
        }
    }

    /// Scope of every `kind` whose `field` equals `parent`
    #[inline]
    #[must_use]
    pub fn under(kind: EntityKind, field: &'static str, parent: EntityId) -> Self {
        Self {
            kind,
            field: Some(field),
            parent: Some(parent),
        }
    }

    /// Successor slot of a replaced acquisition
    ///
    /// Its counter is 0 while the target has no successor and 1 once a
    /// replacing acquisition holds the slot.
    #[must_use]
    pub fn successor_slot(target: EntityId) -> Self {
        Self::under(EntityKind::Acquisition, "replaces_acquisition_id", target)
    }

    /// Kind of the scope's members
    #[inline]
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Reference field shared by the members
    #[inline]
    #[must_use]
    pub fn field(&self) -> Option<&'static str> {
        self.field
    }

    /// Parent identifier shared by the members
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<&EntityId> {
        self.parent.as_ref()
    }

    /// Check if this is a global scope
    #[inline]
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.parent.is_none()
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.field, &self.parent) {
            (Some(field), Some(parent)) => write!(f, "{}/{field}={parent}", self.kind),
            _ => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(ScopeKey::global(EntityKind::Specimen).to_string(), "specimen");
        let key = ScopeKey::under(EntityKind::Block, "specimen_id", EntityId::new("SPEC001"));
        assert_eq!(key.to_string(), "block/specimen_id=SPEC001");
    }

    #[test]
    fn top_level_and_child_roi_scopes_differ() {
        let top = ScopeKey::under(EntityKind::Roi, "section_id", EntityId::new("SUB001_S0001"));
        let child = ScopeKey::under(
            EntityKind::Roi,
            "parent_roi_id",
            EntityId::new("SPEC001.BLK001.SEC001.SUB001.ROI001"),
        );
        assert_ne!(top, child);
        assert!(!top.is_global());
    }
}
