//! Engine configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `STEPLOCK_*` environment variables. The merged result is validated once
//! and passed by reference everywhere else.

use crate::error::{EngineError, Result};
use chrono::format::{Item, StrftimeItems};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default `strftime` format for batch uids, e.g. `2026-10-16_09-30-00`
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Default lock directory, relative to the working directory
pub const DEFAULT_LOCK_DIR: &str = ".steplock/locks";

pub const ENV_LOCK_DIR: &str = "STEPLOCK_LOCK_DIR";
pub const ENV_LOG_LEVEL: &str = "STEPLOCK_LOG_LEVEL";
pub const ENV_RECORDING: &str = "STEPLOCK_RECORDING";
pub const ENV_TIMESTAMP_FORMAT: &str = "STEPLOCK_TIMESTAMP_FORMAT";

/// Configuration for a run of the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding one JSON file per execution lock
    pub lock_dir: PathBuf,
    /// `strftime` format used to build batch uids
    pub timestamp_format: String,
    /// Whether the evidence sink should record the whole run
    pub recording_enabled: bool,
    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// 2 adds log targets, 3 and above add thread ids and line numbers
    pub verbosity: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            recording_enabled: false,
            log_level: "info".to_string(),
            verbosity: 0,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not an error: defaults are used instead. A relative
    /// `lock_dir` inside the file is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            debug!("Loading engine config from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            let mut config = Self::from_toml_str(&content)?;
            if config.lock_dir.is_relative() {
                if let Some(parent) = path.parent() {
                    config.lock_dir = parent.join(&config.lock_dir);
                }
            }
            config
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Load the per-user configuration file, if one exists
    pub fn load_global() -> Result<Self> {
        let path = Self::global_path()?;
        Self::load(&path)
    }

    /// Location of the per-user configuration file
    pub fn global_path() -> Result<PathBuf> {
        ProjectDirs::from("com", "steplock", "steplock")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| EngineError::config("Could not determine home directory"))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn with_lock_dir(mut self, lock_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    pub fn with_recording(mut self, enabled: bool) -> Self {
        self.recording_enabled = enabled;
        self
    }

    /// Apply `STEPLOCK_*` overrides from the process environment
    pub fn merge_env_vars(&mut self) {
        self.merge_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup function.
    ///
    /// Unparseable boolean values are ignored rather than treated as errors.
    pub fn merge_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_LOCK_DIR) {
            self.lock_dir = PathBuf::from(dir);
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }

        if let Some(recording) = lookup(ENV_RECORDING) {
            if let Ok(value) = recording.parse::<bool>() {
                self.recording_enabled = value;
            }
        }

        if let Some(format) = lookup(ENV_TIMESTAMP_FORMAT) {
            self.timestamp_format = format;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_dir.as_os_str().is_empty() {
            return Err(EngineError::config("lock_dir must not be empty"));
        }

        if self.timestamp_format.is_empty() {
            return Err(EngineError::config("timestamp_format must not be empty"));
        }

        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(EngineError::config(format!(
                "invalid timestamp_format '{}'",
                self.timestamp_format
            )));
        }

        // Batch uids become part of lock file names.
        if self.timestamp_format.contains('/') {
            return Err(EngineError::config(
                "timestamp_format must not produce path separators",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_dir, PathBuf::from(DEFAULT_LOCK_DIR));
        assert_eq!(config.timestamp_format, DEFAULT_TIMESTAMP_FORMAT);
        assert!(!config.recording_enabled);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_env_overrides() {
        let mut config = EngineConfig::default();
        config.merge_env_with(lookup_from(&[
            (ENV_LOCK_DIR, "/var/locks"),
            (ENV_LOG_LEVEL, "debug"),
            (ENV_RECORDING, "true"),
            (ENV_TIMESTAMP_FORMAT, "%Y%m%d%H%M%S"),
        ]));

        assert_eq!(config.lock_dir, PathBuf::from("/var/locks"));
        assert_eq!(config.log_level, "debug");
        assert!(config.recording_enabled);
        assert_eq!(config.timestamp_format, "%Y%m%d%H%M%S");
    }

    #[test]
    fn test_merge_env_ignores_bad_bool() {
        let mut config = EngineConfig::default().with_recording(true);
        config.merge_env_with(lookup_from(&[(ENV_RECORDING, "sometimes")]));
        assert!(config.recording_enabled);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = EngineConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.timestamp_format, DEFAULT_TIMESTAMP_FORMAT);
    }

    #[test]
    fn test_load_resolves_relative_lock_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("steplock.toml");
        std::fs::write(
            &path,
            "lock_dir = \"locks\"\nrecording_enabled = true\nverbosity = 2\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        // STEPLOCK_LOCK_DIR may be set in the environment running the tests.
        if std::env::var(ENV_LOCK_DIR).is_err() {
            assert_eq!(config.lock_dir, temp_dir.path().join("locks"));
        }
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.log_level, std::env::var(ENV_LOG_LEVEL).unwrap_or("info".into()));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = EngineConfig::from_toml_str("verbosity = \"loud\"").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_format() {
        let mut config = EngineConfig::default();
        config.timestamp_format = "%Y-%".to_string();
        assert!(config.validate().is_err());

        config.timestamp_format = "%Y/%m".to_string();
        assert!(config.validate().is_err());

        config.timestamp_format = String::new();
        assert!(config.validate().is_err());
    }
}
