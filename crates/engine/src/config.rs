//! Engine configuration model and IO helpers.
//!
//! The file is YAML (or JSON, which YAML accepts) and every section is optional:
//!
//! ```yaml
//! patterns:
//!   directory: ./patterns
//! breaker:
//!   failure_threshold: 5
//!   open_duration_secs: 60
//!   reopen: { policy: exponential, factor: 2.0, max_secs: 600 }
//! server:
//!   bind_address: 127.0.0.1:8080
//!   run_timeout_secs: 30
//!   cancel_grace_secs: 5
//! snapshot:
//!   snapshot_id: PP_2024-06-28
//!   ledger_id: LEDGER_abc123
//!   as_of: 2024-06-28
//!   status: fresh
//! ```

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{NaiveDate, Utc};
use dirs_next::{config_dir, home_dir};
use meridian_types::{SnapshotState, SnapshotStatus};
use serde::{Deserialize, Serialize};

use crate::{
    error::EngineError,
    runtime::{BreakerConfig, ReopenPolicy},
};

/// Environment variable that overrides the default configuration path.
pub const CONFIG_PATH_ENV: &str = "MERIDIAN_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub patterns: PatternsSection,
    pub breaker: BreakerSection,
    pub server: ServerSection,
    pub snapshot: SnapshotSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternsSection {
    pub directory: PathBuf,
}

impl Default for PatternsSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("patterns"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
    pub reopen: ReopenPolicy,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            open_duration_secs: defaults.open_duration.as_secs(),
            reopen: defaults.reopen,
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_secs(self.open_duration_secs),
            reopen: self.reopen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_address: String,
    pub run_timeout_secs: u64,
    /// How long a cancelled run may take to wind down before the request gives up on it.
    pub cancel_grace_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            run_timeout_secs: 30,
            cancel_grace_secs: 5,
        }
    }
}

impl ServerSection {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Initial snapshot served by the bundled static status source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub snapshot_id: String,
    pub ledger_id: String,
    /// Valuation date; today (UTC) when omitted.
    pub as_of: Option<NaiveDate>,
    pub status: SnapshotStatus,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            snapshot_id: "PP_LOCAL".to_string(),
            ledger_id: "LEDGER_LOCAL".to_string(),
            as_of: None,
            status: SnapshotStatus::Fresh,
        }
    }
}

impl SnapshotSection {
    pub fn to_state(&self) -> SnapshotState {
        SnapshotState {
            snapshot_id: self.snapshot_id.clone(),
            ledger_id: self.ledger_id.clone(),
            as_of: self.as_of.unwrap_or_else(|| Utc::now().date_naive()),
            status: self.status,
            estimated_ready_at: None,
            error: None,
        }
    }
}

impl EngineConfig {
    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.breaker.failure_threshold == 0 {
            return Err(EngineError::config("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.open_duration_secs == 0 {
            return Err(EngineError::config("breaker.open_duration_secs must be greater than 0"));
        }
        if let ReopenPolicy::Exponential { factor, .. } = self.breaker.reopen
            && !(factor.is_finite() && factor >= 1.0)
        {
            return Err(EngineError::config("breaker.reopen.factor must be a finite number >= 1.0"));
        }
        if self.server.run_timeout_secs == 0 {
            return Err(EngineError::config("server.run_timeout_secs must be greater than 0"));
        }
        if self.server.bind_address.trim().is_empty() {
            return Err(EngineError::config("server.bind_address cannot be empty"));
        }
        if self.snapshot.snapshot_id.trim().is_empty() || self.snapshot.ledger_id.trim().is_empty() {
            return Err(EngineError::config("snapshot.snapshot_id and snapshot.ledger_id are required"));
        }
        Ok(())
    }

    /// Resolves `patterns.directory` relative to the directory holding the configuration file.
    pub fn resolve_relative_paths(&mut self, config_path: &Path) {
        if self.patterns.directory.is_relative()
            && let Some(parent) = config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            self.patterns.directory = parent.join(&self.patterns.directory);
        }
    }
}

/// Returns the default path for the engine configuration file.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meridian")
        .join("engine.yaml")
}

/// Loads configuration from `path` when given, otherwise from the default path.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => load_config_from_path(path),
        None => load_config_from_path(&default_config_path()),
    }
}

/// Loads and validates configuration from a specific path. A missing file yields defaults.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<EngineConfig> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let mut config: EngineConfig = if content.trim().is_empty() {
        EngineConfig::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    config.resolve_relative_paths(path);
    config.validate()?;
    Ok(config)
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().map(|home| home.join(rest)).unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_honors_environment_override() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("/etc/meridian/custom.yaml"), || {
            assert_eq!(default_config_path(), PathBuf::from("/etc/meridian/custom.yaml"));
        });
    }

    #[test]
    fn blank_environment_override_falls_back_to_config_dir() {
        temp_env::with_var(CONFIG_PATH_ENV, Some("  "), || {
            assert!(default_config_path().ends_with("meridian/engine.yaml"));
        });
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from_path(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.breaker.to_breaker_config(), BreakerConfig::default());
    }

    #[test]
    fn partial_file_merges_with_defaults_and_resolves_pattern_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        fs::write(
            &path,
            r#"
patterns:
  directory: defs
breaker:
  failure_threshold: 3
  reopen: { policy: exponential, factor: 2.0, max_secs: 600 }
snapshot:
  snapshot_id: PP_2024-06-28
  ledger_id: LEDGER_abc123
  as_of: 2024-06-28
  status: warming
"#,
        )
        .expect("write config");

        let config = load_config_from_path(&path).expect("config");
        assert_eq!(config.patterns.directory, dir.path().join("defs"));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.open_duration_secs, 60);
        assert_eq!(
            config.breaker.reopen,
            ReopenPolicy::Exponential {
                factor: 2.0,
                max_secs: 600
            }
        );
        assert_eq!(config.server.run_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.cancel_grace(), Duration::from_secs(5));

        let state = config.snapshot.to_state();
        assert_eq!(state.status, SnapshotStatus::Warming);
        assert_eq!(state.as_of, NaiveDate::from_ymd_opt(2024, 6, 28).expect("date"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "breaker:\n  failure_threshold: 0\n").expect("write config");

        let error = load_config_from_path(&path).expect_err("invalid threshold");
        assert!(error.to_string().contains("failure_threshold"));
    }
}
