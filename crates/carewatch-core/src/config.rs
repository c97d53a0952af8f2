//! CareWatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CareError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CareConfig {
    /// Catalog file with the task definitions. `None` = built-in catalog.
    #[serde(default)]
    pub catalog_path: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for CareConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl CareConfig {
    /// Load config from the default path (~/.carewatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CareError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CareError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        tracing::info!("config loaded from {}", path.display());
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CareError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        tracing::info!("config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.workers == 0 {
            return Err(CareError::Config("scheduler.workers must be at least 1".into()));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(CareError::Config(
                "scheduler.poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.scheduler.max_run_secs == 0 {
            return Err(CareError::Config("scheduler.max_run_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CareWatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".carewatch")
    }

    /// Catalog path with `~` expanded.
    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog_path.as_deref().map(expand_path)
    }
}

/// Task registry storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How long a writer waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.carewatch/tasks.db".into() }
fn default_busy_timeout_ms() -> u64 { 5000 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        expand_path(&self.db_path)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Executor loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Invocations running longer than this are failed and cancelled.
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,
    /// Extra time past `max_run_secs` before a claim left by a dead process is taken over.
    #[serde(default = "default_claim_grace_secs")]
    pub claim_grace_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_poll_interval_secs() -> u64 { 15 }
fn default_max_run_secs() -> u64 { 300 }
fn default_claim_grace_secs() -> u64 { 60 }
fn default_workers() -> usize { 2 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_run_secs: default_max_run_secs(),
            claim_grace_secs: default_claim_grace_secs(),
            workers: default_workers(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    /// Age after which a `running` claim is treated as abandoned.
    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.max_run_secs + self.claim_grace_secs)
    }
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}
