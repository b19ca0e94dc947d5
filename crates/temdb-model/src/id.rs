//! Entity identifiers
//!
//! Provides [`EntityId`], the stored key of every entity, and
//! [`HierarchicalId`], the dotted composite form used by kinds whose
//! identifiers encode their ancestor chain (`SPEC001.BLK002.CUT001`).

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use ulid::Ulid;

/// Zero-padding width of dotted sequence segments (`SPEC001`)
pub const SEQUENCE_WIDTH: usize = 3;

/// Zero-padding width of the number in a section id (`SUB001_S0001`)
pub const SECTION_NUMBER_WIDTH: usize = 4;

/// Zero-padding width of the number in a tile id (`ACQ_..._T000001`)
pub const TILE_NUMBER_WIDTH: usize = 6;

const SECTION_MARKER: &str = "_S";
const TILE_MARKER: &str = "_T";

/// Stored key of an entity
///
/// Human readable and stable for the life of the entity. For hierarchical
/// kinds the string is a dotted path; see [`EntityId::hierarchical`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an identifier without checking it
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse a caller-supplied identifier
    ///
    /// # Errors
    /// Returns [`IdError::Empty`] for an empty string and
    /// [`IdError::InvalidSegment`] if it contains whitespace.
    pub fn parse(id: &str) -> Result<Self, IdError> {
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidSegment(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    /// Borrow as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret as a dotted hierarchical identifier
    ///
    /// # Errors
    /// Returns an error if any segment is empty or has invalid characters.
    pub fn hierarchical(&self) -> Result<HierarchicalId, IdError> {
        self.0.parse()
    }

    /// Mint an opaque, globally unique token (`TASK_01J...`)
    #[must_use]
    pub fn mint_token(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Ulid::new()))
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<HierarchicalId> for EntityId {
    fn from(value: HierarchicalId) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Dotted composite identifier
///
/// Each segment is either a sequence segment (`TAG` + decimal number, e.g.
/// `BLK002`) or a named segment such as a caller-supplied media id. The
/// prefix of a child's identifier is exactly its parent's identifier.
///
/// # Examples
/// - `["SPEC001"]` → `SPEC001`
/// - `["SPEC001", "BLK002", "SEC001", "SUB001", "ROI003"]` →
///   `SPEC001.BLK002.SEC001.SUB001.ROI003`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HierarchicalId(Vec<String>);

impl HierarchicalId {
    /// Create from already validated segments
    #[inline]
    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Identifier consisting of a single sequence segment
    #[inline]
    #[must_use]
    pub fn root(tag: &str, number: u64) -> Self {
        Self(vec![format_sequence(tag, number)])
    }

    /// Get path segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no segments
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identifier with the last segment removed
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Last segment
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Append a segment, returning the new identifier
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.0.push(segment.into());
        next
    }

    /// Append a zero-padded sequence segment (`ROI` + 2 → `ROI002`)
    #[must_use]
    pub fn child_sequence(&self, tag: &str, number: u64) -> Self {
        self.child(format_sequence(tag, number))
    }

    /// Check if this identifier is a prefix of another (or equal to it)
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.0.len() <= other.0.len() && self.0 == other.0[..self.0.len()]
    }

    /// Check if this identifier is a strict ancestor of another
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        self.0.len() < other.0.len() && self.is_prefix_of(other)
    }

    /// Segments of `self` below `ancestor`
    ///
    /// # Errors
    /// Returns [`IdError::NotDescendant`] if `ancestor` is not a prefix.
    pub fn relative_to(&self, ancestor: &Self) -> Result<Self, IdError> {
        if !ancestor.is_prefix_of(self) {
            return Err(IdError::NotDescendant {
                id: self.to_string(),
                ancestor: ancestor.to_string(),
            });
        }
        Ok(Self(self.0[ancestor.0.len()..].to_vec()))
    }

    /// Sequence number of the last segment, if it carries `tag`
    #[must_use]
    pub fn trailing_sequence(&self, tag: &str) -> Option<u64> {
        self.last()
            .and_then(SequenceSegment::parse)
            .filter(|seg| seg.tag == tag)
            .map(|seg| seg.number)
    }

    /// Count of segments carrying `tag` (ROI depth is the count of `ROI`)
    #[must_use]
    pub fn count_tag(&self, tag: &str) -> usize {
        self.0
            .iter()
            .filter_map(|s| SequenceSegment::parse(s))
            .filter(|seg| seg.tag == tag)
            .count()
    }

    /// Convert into a stored key
    #[inline]
    #[must_use]
    pub fn to_entity_id(&self) -> EntityId {
        EntityId(self.to_string())
    }
}

impl Display for HierarchicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for HierarchicalId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let segments: Vec<String> = s
            .split('.')
            .map(|seg| {
                if seg.is_empty() {
                    Err(IdError::EmptySegment(s.to_string()))
                } else if !is_valid_segment(seg) {
                    Err(IdError::InvalidSegment(seg.to_string()))
                } else {
                    Ok(seg.to_string())
                }
            })
            .collect::<Result<_, _>>()?;

        Ok(Self(segments))
    }
}

/// A `TAG` + number segment such as `BLK002`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSegment {
    /// Uppercase tag (`SPEC`, `BLK`, `ROI`, ...)
    pub tag: String,
    /// Sequence number (1-based)
    pub number: u64,
}

impl SequenceSegment {
    /// Parse `TAG` + digits; `None` for named segments
    #[must_use]
    pub fn parse(segment: &str) -> Option<Self> {
        let split = segment.find(|c: char| c.is_ascii_digit())?;
        let (tag, digits) = segment.split_at(split);
        if tag.is_empty()
            || !tag.chars().all(|c| c.is_ascii_uppercase())
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }
        let number = digits.parse().ok()?;
        Some(Self {
            tag: tag.to_string(),
            number,
        })
    }
}

impl Display for SequenceSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&format_sequence(&self.tag, self.number))
    }
}

/// Render a sequence segment with the standard padding
#[inline]
#[must_use]
pub fn format_sequence(tag: &str, number: u64) -> String {
    format!("{tag}{number:0SEQUENCE_WIDTH$}")
}

/// Check that a segment is non-empty ASCII alphanumeric or underscore
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Section identifier: `<media_id>_S<number:04>`
#[must_use]
pub fn section_id(media_id: &EntityId, section_number: u64) -> EntityId {
    EntityId(format!(
        "{media_id}{SECTION_MARKER}{section_number:0SECTION_NUMBER_WIDTH$}"
    ))
}

/// Split a section identifier into media id and section number
#[must_use]
pub fn parse_section_id(id: &EntityId) -> Option<(&str, u64)> {
    split_numbered(id.as_str(), SECTION_MARKER)
}

/// Tile identifier: `<acquisition_id>_T<number:06>`
#[must_use]
pub fn tile_id(acquisition_id: &EntityId, number: u64) -> EntityId {
    EntityId(format!(
        "{acquisition_id}{TILE_MARKER}{number:0TILE_NUMBER_WIDTH$}"
    ))
}

/// Split a tile identifier into acquisition id and tile number
#[must_use]
pub fn parse_tile_id(id: &EntityId) -> Option<(&str, u64)> {
    split_numbered(id.as_str(), TILE_MARKER)
}

fn split_numbered<'a>(id: &'a str, marker: &str) -> Option<(&'a str, u64)> {
    let (head, digits) = id.rsplit_once(marker)?;
    if head.is_empty() || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|n| (head, n))
}

/// Identifier errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Empty identifier
    #[error("identifier is empty")]
    Empty,

    /// Empty segment in a dotted identifier
    #[error("identifier '{0}' contains an empty segment")]
    EmptySegment(String),

    /// Invalid segment characters
    #[error("invalid segment: {0} (must be ASCII alphanumeric or underscore)")]
    InvalidSegment(String),

    /// Not a descendant identifier
    #[error("identifier '{id}' is not a descendant of '{ancestor}'")]
    NotDescendant {
        /// Candidate identifier
        id: String,
        /// Expected ancestor
        ancestor: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_dotted_identifier() {
        let id: HierarchicalId = "SPEC001.BLK002.CUT001".parse().unwrap();
        assert_eq!(id.segments(), &["SPEC001", "BLK002", "CUT001"]);
        assert_eq!(id.to_string(), "SPEC001.BLK002.CUT001");
    }

    #[test]
    fn parse_rejects_empty_segment() {
        let result: Result<HierarchicalId, _> = "SPEC001..BLK001".parse();
        assert!(matches!(result, Err(IdError::EmptySegment(_))));
    }

    #[test]
    fn parse_rejects_invalid_characters() {
        let result: Result<HierarchicalId, _> = "SPEC001.BLK-1".parse();
        assert!(matches!(result, Err(IdError::InvalidSegment(_))));
    }

    #[test]
    fn child_sequence_is_zero_padded() {
        let block = HierarchicalId::root("SPEC", 1).child_sequence("BLK", 2);
        assert_eq!(block.to_string(), "SPEC001.BLK002");

        let wide = block.child_sequence("CUT", 1234);
        assert_eq!(wide.last(), Some("CUT1234"));
    }

    #[test]
    fn prefix_and_ancestor() {
        let block: HierarchicalId = "SPEC001.BLK001".parse().unwrap();
        let session: HierarchicalId = "SPEC001.BLK001.CUT003".parse().unwrap();
        let other: HierarchicalId = "SPEC002.BLK001.CUT003".parse().unwrap();

        assert!(block.is_prefix_of(&session));
        assert!(block.is_ancestor_of(&session));
        assert!(!block.is_prefix_of(&other));
        assert!(!session.is_ancestor_of(&session));
    }

    #[test]
    fn relative_to_requires_prefix() {
        let roi: HierarchicalId = "SPEC001.BLK001.SEC001.SUB001.ROI001".parse().unwrap();
        let section_path: HierarchicalId = "SPEC001.BLK001.SEC001.SUB001".parse().unwrap();
        assert_eq!(roi.relative_to(&section_path).unwrap().to_string(), "ROI001");

        let wrong: HierarchicalId = "SPEC009".parse().unwrap();
        assert!(matches!(
            roi.relative_to(&wrong),
            Err(IdError::NotDescendant { .. })
        ));
    }

    #[test]
    fn trailing_sequence_checks_tag() {
        let roi: HierarchicalId = "SPEC001.BLK001.SEC001.SUB001.ROI007".parse().unwrap();
        assert_eq!(roi.trailing_sequence("ROI"), Some(7));
        assert_eq!(roi.trailing_sequence("BLK"), None);
        assert_eq!(roi.count_tag("ROI"), 1);
    }

    #[test]
    fn sequence_segment_parse() {
        assert_eq!(
            SequenceSegment::parse("ROI0042"),
            Some(SequenceSegment {
                tag: "ROI".into(),
                number: 42
            })
        );
        assert_eq!(SequenceSegment::parse("TAPE_A"), None);
        assert_eq!(SequenceSegment::parse("001"), None);
        assert_eq!(SequenceSegment::parse("roi1"), None);
    }

    #[test]
    fn section_id_round_trip() {
        let id = section_id(&EntityId::new("SUB001"), 12);
        assert_eq!(id.as_str(), "SUB001_S0012");
        assert_eq!(parse_section_id(&id), Some(("SUB001", 12)));
        assert_eq!(parse_section_id(&EntityId::new("SUB001")), None);
    }

    #[test]
    fn tile_id_uses_last_marker() {
        let acquisition = EntityId::new("ACQ_X_T9");
        let id = tile_id(&acquisition, 3);
        assert_eq!(id.as_str(), "ACQ_X_T9_T000003");
        assert_eq!(parse_tile_id(&id), Some(("ACQ_X_T9", 3)));
    }

    #[test]
    fn minted_tokens_are_unique() {
        let a = EntityId::mint_token("TASK");
        let b = EntityId::mint_token("TASK");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("TASK_"));
    }

    #[test]
    fn entity_id_parse_rejects_whitespace() {
        assert!(matches!(EntityId::parse(""), Err(IdError::Empty)));
        assert!(EntityId::parse("TASK 1").is_err());
        assert!(EntityId::parse("TASK_1").is_ok());
    }
}
