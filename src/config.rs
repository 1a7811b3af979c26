//! Plan cache configuration.
//!
//! Options can be built in code or read from the `[plan_cache]` table of a
//! TOML file:
//!
//! ```toml
//! [plan_cache]
//! enabled = true
//! max_entries = 512
//! criteria_plan_cache = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of cached plans.
pub const DEFAULT_MAX_ENTRIES: usize = 2048;

/// Plan cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlanCacheOptions {
    /// Whether plans are cached at all.
    pub enabled: bool,
    /// Maximum number of cached plans; least recently used plans are evicted.
    pub max_entries: usize,
    /// Whether queries built directly as statement trees are cacheable.
    /// Queries created from text are cacheable regardless.
    pub criteria_plan_cache: bool,
}

impl Default for PlanCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            criteria_plan_cache: false,
        }
    }
}

impl PlanCacheOptions {
    /// No caching; every execution resolves its plan afresh.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Caching with at most `max_entries` plans.
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Also caches plans of tree-built queries.
    pub fn with_criteria_plan_cache(mut self, enabled: bool) -> Self {
        self.criteria_plan_cache = enabled;
        self
    }

    /// Parses the `[plan_cache]` table of a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        raw.plan_cache.validate()?;
        Ok(raw.plan_cache)
    }

    /// Reads options from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        raw.plan_cache.validate()?;
        Ok(raw.plan_cache)
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_entries",
                reason: "must be positive while the cache is enabled",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    plan_cache: PlanCacheOptions,
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read plan config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not valid TOML or has mistyped fields.
    #[error("failed to parse plan config{}: {source}", location(.path))]
    Parse {
        /// File path, when parsed from a file.
        path: Option<PathBuf>,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// A setting is out of range.
    #[error("invalid plan config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

fn location(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_table_uses_defaults() {
        let options = PlanCacheOptions::from_toml_str("").expect("parse");
        assert_eq!(options, PlanCacheOptions::default());
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let options =
            PlanCacheOptions::from_toml_str("[plan_cache]\nmax_entries = 16\n").expect("parse");
        assert_eq!(options, PlanCacheOptions::bounded(16));
    }

    #[test]
    fn zero_entries_is_rejected_only_when_enabled() {
        let err = PlanCacheOptions::from_toml_str("[plan_cache]\nmax_entries = 0\n")
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { field: "max_entries", .. }));

        let disabled = PlanCacheOptions::from_toml_str(
            "[plan_cache]\nenabled = false\nmax_entries = 0\n",
        )
        .expect("parse");
        assert!(!disabled.enabled);
    }

    #[test]
    fn load_reads_file_and_reports_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[plan_cache]\ncriteria_plan_cache = true").expect("write");
        let options = PlanCacheOptions::load(file.path()).expect("load");
        assert!(options.criteria_plan_cache);

        let mut broken = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(broken, "[plan_cache]\nenabled = \"yes\"").expect("write");
        let err = PlanCacheOptions::load(broken.path()).expect_err("mistyped");
        assert!(err.to_string().contains(&broken.path().display().to_string()));
    }
}
