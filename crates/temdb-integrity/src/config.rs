//! Engine configuration
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration of the integrity engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Resolver cache
    pub cache: CacheConfig,
    /// Identifier allocation
    pub allocation: AllocationConfig,
    /// Hierarchy validation
    pub hierarchy: HierarchyConfig,
    /// Lifecycle transitions
    pub lifecycle: LifecycleConfig,
}

impl IntegrityConfig {
    /// Parse from a TOML string and validate
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and validate
    ///
    /// # Errors
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns [`ConfigError::Serialize`] if rendering fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be positive"));
        }
        if self.allocation.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "allocation.max_attempts",
                "must be positive",
            ));
        }
        if self.allocation.base_backoff_ms > self.allocation.max_backoff_ms {
            return Err(ConfigError::invalid(
                "allocation.base_backoff_ms",
                "must not exceed allocation.max_backoff_ms",
            ));
        }
        if self.hierarchy.max_roi_depth == 0 {
            return Err(ConfigError::invalid(
                "hierarchy.max_roi_depth",
                "must be positive",
            ));
        }
        if self.lifecycle.max_update_attempts == 0 {
            return Err(ConfigError::invalid(
                "lifecycle.max_update_attempts",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Set resolver cache capacity
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache.capacity = capacity;
        self
    }

    /// Set allocation retry budget
    #[must_use]
    pub fn with_allocation_attempts(mut self, attempts: u32) -> Self {
        self.allocation.max_attempts = attempts;
        self
    }

    /// Set allocation backoff bounds
    #[must_use]
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.allocation.base_backoff_ms = base_ms;
        self.allocation.max_backoff_ms = max_ms;
        self
    }

    /// Set ROI ancestry depth bound
    #[must_use]
    pub fn with_max_roi_depth(mut self, depth: usize) -> Self {
        self.hierarchy.max_roi_depth = depth;
        self
    }

    /// Set lifecycle compare-and-swap budget
    #[must_use]
    pub fn with_update_attempts(mut self, attempts: u32) -> Self {
        self.lifecycle.max_update_attempts = attempts;
        self
    }
}

/// Resolver cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resolved entities held
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Counter retry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Counter compare-and-swap attempts before `AllocationConflict`
    pub max_attempts: u32,
    /// First backoff delay
    pub base_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
}

impl AllocationConfig {
    /// Delay before retry number `attempt` (0-based), before jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 2,
            max_backoff_ms: 100,
        }
    }
}

/// Limits on reference walks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Hops walked up `parent_roi_id` (and replacement) links before the
    /// walk is treated as cyclic
    pub max_roi_depth: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self { max_roi_depth: 32 }
    }
}

/// Retry budget of status changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Revision compare-and-swap attempts before `ConcurrentModification`
    pub max_update_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_update_attempts: 8,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        /// Path that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed TOML
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML rendering failed
    #[error("cannot render config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Value out of range
    #[error("invalid config value {key}: {reason}")]
    Invalid {
        /// Dotted key
        key: &'static str,
        /// What is wrong
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: &'static str) -> Self {
        Self::Invalid { key, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_is_default() {
        let config = IntegrityConfig::from_toml_str("").unwrap();
        assert_eq!(config, IntegrityConfig::default());
        assert_eq!(config.hierarchy.max_roi_depth, 32);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = IntegrityConfig::from_toml_str(
            r#"
            [allocation]
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.allocation.max_attempts, 3);
        assert_eq!(config.allocation.max_backoff_ms, 100);
        assert_eq!(config.cache.capacity, 10_000);
    }

    #[test]
    fn rejects_inverted_backoff() {
        let err = IntegrityConfig::default()
            .with_backoff(50, 10)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "allocation.base_backoff_ms",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = IntegrityConfig::from_toml_str("[cache]\ncapacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("cache.capacity"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = IntegrityConfig::from_toml_str("[cache\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let allocation = AllocationConfig::default();
        assert_eq!(allocation.backoff(0), Duration::from_millis(2));
        assert_eq!(allocation.backoff(3), Duration::from_millis(16));
        assert_eq!(allocation.backoff(10), Duration::from_millis(100));
        assert_eq!(allocation.backoff(63), Duration::from_millis(100));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[lifecycle]\nmax_update_attempts = 2").unwrap();
        let config = IntegrityConfig::load(file.path()).unwrap();
        assert_eq!(config.lifecycle.max_update_attempts, 2);

        let missing = IntegrityConfig::load(file.path().with_extension("absent"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn rendered_config_round_trips() {
        let config = IntegrityConfig::default().with_cache_capacity(64);
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(IntegrityConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
