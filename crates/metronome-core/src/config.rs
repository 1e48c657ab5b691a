//! Metronome configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MetronomeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetronomeConfig {
    /// Path to the SQLite job database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Tuning knobs for the scheduling core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on a single fire-loop sleep. The loop re-evaluates
    /// deadlines at least this often, which bounds the damage of a
    /// backward wall-clock adjustment.
    #[serde(default = "default_max_sleep_secs")]
    pub max_sleep_secs: u64,
    /// How often the background reconciler scans for unprojected jobs.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Cap on the per-job reconciliation backoff.
    #[serde(default = "default_reconcile_max_backoff_secs")]
    pub reconcile_max_backoff_secs: u64,
    /// How long shutdown waits for in-flight handlers to finish.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// How many job events the in-memory history ring retains.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

fn default_db_path() -> PathBuf {
    MetronomeConfig::data_dir().join("jobs.db")
}
fn default_max_sleep_secs() -> u64 { 60 }
fn default_reconcile_interval_secs() -> u64 { 30 }
fn default_reconcile_max_backoff_secs() -> u64 { 900 }
fn default_drain_timeout_secs() -> u64 { 30 }
fn default_event_history() -> usize { 100 }

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep_secs: default_max_sleep_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_max_backoff_secs: default_reconcile_max_backoff_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            event_history: default_event_history(),
        }
    }
}

impl MetronomeConfig {
    /// Load config from the default path (~/.metronome/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetronomeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MetronomeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MetronomeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// Base data directory (~/.metronome).
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".metronome")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MetronomeConfig::default();
        assert_eq!(config.scheduler.max_sleep_secs, 60);
        assert_eq!(config.scheduler.event_history, 100);
        assert!(config.db_path.ends_with("jobs.db"));
    }

    #[test]
    fn test_partial_toml() {
        let config: MetronomeConfig =
            toml::from_str("db_path = \"/tmp/test.db\"\n[scheduler]\nmax_sleep_secs = 5\n")
                .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.scheduler.max_sleep_secs, 5);
        // Unspecified fields fall back to defaults
        assert_eq!(config.scheduler.drain_timeout_secs, 30);
    }

    #[test]
    fn test_roundtrip() {
        let config = MetronomeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: MetronomeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.scheduler.reconcile_interval_secs, config.scheduler.reconcile_interval_secs);
    }
}
