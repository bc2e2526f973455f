//! Configuration for the flow configuration store
//!
//! Every setting is an explicit value on [`StorageConfig`], built in code,
//! read from a JSON file, or lifted out of a key/value property map. The
//! archive directory can also be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{FlowStoreError, Result};

/// Property key selecting the archive directory
pub const CONFIGURATION_ARCHIVE_DIR_KEY: &str = "flow.configuration.archive.dir";
/// Property key selecting the primary document path
pub const CONFIGURATION_FILE_KEY: &str = "flow.configuration.file";
/// Property key limiting how many archive entries are kept
pub const CONFIGURATION_ARCHIVE_MAX_COUNT_KEY: &str = "flow.configuration.archive.max.count";
/// Environment variable overriding the archive directory
pub const ARCHIVE_DIR_ENV: &str = "FLOWSTORE_ARCHIVE_DIR";

/// Default number of rename attempts when committing a save
pub const DEFAULT_RENAME_ATTEMPTS: usize = 5;
/// Default initial wait between rename attempts, in milliseconds
pub const DEFAULT_RENAME_BACKOFF_MS: u64 = 20;

/// Retry settings for the commit rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenamePolicy {
    /// Total rename attempts before the save fails
    pub max_attempts: usize,
    /// First backoff interval, doubled on each retry
    pub initial_backoff_ms: u64,
}

impl RenamePolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl Default for RenamePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RENAME_ATTEMPTS,
            initial_backoff_ms: DEFAULT_RENAME_BACKOFF_MS,
        }
    }
}

/// Configuration structure for the flow configuration store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the primary (gzip compressed) flow document
    pub flow_path: PathBuf,
    /// Archive directory; `None` or empty means `<flow dir>/archive`
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    /// Gzip level (0-9); `None` uses the flate2 default
    #[serde(default)]
    pub compression_level: Option<u32>,
    /// Keep at most this many archive entries after each archiving save
    #[serde(default)]
    pub archive_max_count: Option<usize>,
    /// Commit rename retry settings
    #[serde(default)]
    pub rename: RenamePolicy,
}

impl StorageConfig {
    /// Create a configuration with defaults for the given flow path
    pub fn new(flow_path: impl Into<PathBuf>) -> Self {
        Self {
            flow_path: flow_path.into(),
            archive_dir: None,
            compression_level: None,
            archive_max_count: None,
            rename: RenamePolicy::default(),
        }
    }

    /// Set the archive directory override
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Set the archive retention limit
    pub fn with_archive_max_count(mut self, max_count: usize) -> Self {
        self.archive_max_count = Some(max_count);
        self
    }

    /// Set the gzip compression level
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Set the rename retry policy
    pub fn with_rename_policy(mut self, rename: RenamePolicy) -> Self {
        self.rename = rename;
        self
    }

    /// Read a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FlowStoreError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: StorageConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a key/value property map
    ///
    /// Recognizes [`CONFIGURATION_FILE_KEY`], [`CONFIGURATION_ARCHIVE_DIR_KEY`]
    /// and [`CONFIGURATION_ARCHIVE_MAX_COUNT_KEY`]. Empty values count as unset.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let non_empty = |key: &str| {
            properties
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let flow_path = non_empty(CONFIGURATION_FILE_KEY).ok_or_else(|| {
            FlowStoreError::config(format!("Missing property {CONFIGURATION_FILE_KEY}"))
        })?;

        let mut config = StorageConfig::new(flow_path);
        config.archive_dir = non_empty(CONFIGURATION_ARCHIVE_DIR_KEY).map(PathBuf::from);

        if let Some(raw) = non_empty(CONFIGURATION_ARCHIVE_MAX_COUNT_KEY) {
            let max_count = raw.parse::<usize>().map_err(|e| {
                FlowStoreError::config(format!(
                    "Invalid {CONFIGURATION_ARCHIVE_MAX_COUNT_KEY} '{raw}': {e}"
                ))
            })?;
            config.archive_max_count = Some(max_count);
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(ARCHIVE_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.archive_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    /// The archive directory override, treating an empty path as unset
    pub fn effective_archive_dir(&self) -> Option<&Path> {
        self.archive_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.flow_path.as_os_str().is_empty() {
            return Err(FlowStoreError::config("flow path must not be empty"));
        }
        if self.flow_path.file_name().is_none() {
            return Err(FlowStoreError::config(format!(
                "flow path {} does not name a file",
                self.flow_path.display()
            )));
        }
        if self.rename.max_attempts == 0 {
            return Err(FlowStoreError::config(
                "rename.max_attempts must be at least 1",
            ));
        }
        if self.archive_max_count == Some(0) {
            return Err(FlowStoreError::config(
                "archive_max_count must be at least 1 (leave it unset to keep every entry)",
            ));
        }
        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(FlowStoreError::config(format!(
                    "compression level {level} is outside 0-9"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_new_config_defaults() {
        let config = StorageConfig::new("/conf/flow.xml.gz");
        assert_eq!(config.flow_path, PathBuf::from("/conf/flow.xml.gz"));
        assert!(config.archive_dir.is_none());
        assert_eq!(config.rename.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_archive_dir_is_unset() {
        let config = StorageConfig::new("/conf/flow.xml.gz").with_archive_dir("");
        assert!(config.effective_archive_dir().is_none());

        let config = StorageConfig::new("/conf/flow.xml.gz").with_archive_dir("/backup");
        assert_eq!(config.effective_archive_dir(), Some(Path::new("/backup")));
    }

    #[test]
    fn test_from_properties() {
        let config = StorageConfig::from_properties(&props(&[
            (CONFIGURATION_FILE_KEY, "/conf/flow.xml.gz"),
            (CONFIGURATION_ARCHIVE_DIR_KEY, "/conf/history"),
            (CONFIGURATION_ARCHIVE_MAX_COUNT_KEY, "10"),
        ]))
        .unwrap();

        assert_eq!(config.archive_dir, Some(PathBuf::from("/conf/history")));
        assert_eq!(config.archive_max_count, Some(10));
    }

    #[test]
    fn test_from_properties_blank_archive_dir() {
        let config = StorageConfig::from_properties(&props(&[
            (CONFIGURATION_FILE_KEY, "/conf/flow.xml.gz"),
            (CONFIGURATION_ARCHIVE_DIR_KEY, "  "),
        ]))
        .unwrap();

        assert!(config.archive_dir.is_none());
    }

    #[test]
    fn test_from_properties_missing_flow_path() {
        let result = StorageConfig::from_properties(&props(&[]));
        assert!(result
            .unwrap_err()
            .to_string()
            .contains(CONFIGURATION_FILE_KEY));
    }

    #[test]
    fn test_from_properties_bad_max_count() {
        let result = StorageConfig::from_properties(&props(&[
            (CONFIGURATION_FILE_KEY, "/conf/flow.xml.gz"),
            (CONFIGURATION_ARCHIVE_MAX_COUNT_KEY, "many"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_json_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("flowstore.json");
        std::fs::write(
            &path,
            r#"{"flow_path": "/conf/flow.xml.gz", "compression_level": 9, "rename": {"max_attempts": 3}}"#,
        )
        .unwrap();

        let config = StorageConfig::from_json_file(&path).unwrap();
        assert_eq!(config.compression_level, Some(9));
        assert_eq!(config.rename.max_attempts, 3);
        assert_eq!(config.rename.initial_backoff_ms, DEFAULT_RENAME_BACKOFF_MS);
    }

    #[test]
    fn test_env_override_ignores_blank_value() {
        // Only this test touches the variable
        std::env::set_var(ARCHIVE_DIR_ENV, "   ");
        let config = StorageConfig::new("/conf/flow.xml.gz")
            .with_archive_dir("/conf/history")
            .apply_env_overrides();
        assert_eq!(config.archive_dir, Some(PathBuf::from("/conf/history")));

        std::env::set_var(ARCHIVE_DIR_ENV, "/mnt/archive");
        let config = StorageConfig::new("/conf/flow.xml.gz").apply_env_overrides();
        std::env::remove_var(ARCHIVE_DIR_ENV);
        assert_eq!(config.archive_dir, Some(PathBuf::from("/mnt/archive")));
    }

    #[test]
    fn test_validate() {
        let mut config = StorageConfig::new("/conf/flow.xml.gz");
        config.rename.max_attempts = 0;
        assert!(config.validate().is_err());

        let config = StorageConfig::new("/conf/flow.xml.gz").with_compression_level(12);
        assert!(config.validate().is_err());

        let config = StorageConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_archive_retention_is_rejected() {
        let config = StorageConfig::new("/conf/flow.xml.gz").with_archive_max_count(0);
        assert!(matches!(config.validate(), Err(FlowStoreError::Config(_))));

        let result = StorageConfig::from_properties(&props(&[
            (CONFIGURATION_FILE_KEY, "/conf/flow.xml.gz"),
            (CONFIGURATION_ARCHIVE_MAX_COUNT_KEY, "0"),
        ]));
        assert!(result.is_err());

        let config = StorageConfig::new("/conf/flow.xml.gz").with_archive_max_count(1);
        assert!(config.validate().is_ok());
    }
}
