use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_token_secs() -> u64 {
    86_400
}

fn default_admission_delay_secs() -> u64 {
    600
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_retention_days() -> u64 {
    30
}

fn default_cleanup_time() -> String {
    "03:30".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Membership duration (seconds) for tokens issued without an explicit duration.
    #[serde(default = "default_token_secs")]
    pub default_token_secs: u64,

    /// Delay (seconds) between a free-access request and its admission.
    #[serde(default = "default_admission_delay_secs")]
    pub admission_delay_secs: u64,

    #[serde(default = "default_sweep_secs")]
    pub membership_sweep_secs: u64,

    #[serde(default = "default_sweep_secs")]
    pub queue_sweep_secs: u64,

    /// Processed admission requests and stale tokens older than this are
    /// cleaned up by the daily job.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// UTC time of day ("HH:MM") at which the daily cleanup runs.
    #[serde(default = "default_cleanup_time")]
    pub cleanup_time_utc: String,

    /// Redeeming a token while already active extends the membership from
    /// `max(now, current expiry)` instead of failing with an error.
    #[serde(default = "default_true")]
    pub stack_renewals: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_token_secs: default_token_secs(),
            admission_delay_secs: default_admission_delay_secs(),
            membership_sweep_secs: default_sweep_secs(),
            queue_sweep_secs: default_sweep_secs(),
            retention_days: default_retention_days(),
            cleanup_time_utc: default_cleanup_time(),
            stack_renewals: default_true(),
        }
    }
}

impl EngineConfig {
    pub fn default_token_duration(&self) -> time::Duration {
        time::Duration::seconds(self.default_token_secs as i64)
    }

    pub fn admission_delay(&self) -> time::Duration {
        time::Duration::seconds(self.admission_delay_secs as i64)
    }

    pub fn retention(&self) -> time::Duration {
        time::Duration::days(self.retention_days as i64)
    }

    pub fn membership_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.membership_sweep_secs)
    }

    pub fn queue_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.queue_sweep_secs)
    }
}

/// Configuration source read at each operation or sweep tick, so operator
/// changes take effect without a restart.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Result<EngineConfig>;
}

/// Reads the config file on every call. A missing file yields defaults.
#[derive(Clone, Debug)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the given config, creating parent directories as needed.
    pub fn write(&self, cfg: &EngineConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("create config parent directories")?;
        }
        let bytes = serde_json::to_vec_pretty(cfg).context("serialize config")?;
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, &bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

impl ConfigProvider for FileConfigProvider {
    fn current(&self) -> Result<EngineConfig> {
        if !self.path.exists() {
            return Ok(EngineConfig::default());
        }
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("read config {}", self.path.display()))?;
        let cfg: EngineConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse config {}", self.path.display()))?;
        Ok(cfg)
    }
}

/// In-memory provider for tests and embedding; `set` swaps the config the
/// same way an operator edit to the file would.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    current: Mutex<EngineConfig>,
}

impl MemoryConfig {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            current: Mutex::new(cfg),
        }
    }

    pub fn set(&self, cfg: EngineConfig) {
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cfg;
    }
}

impl ConfigProvider for MemoryConfig {
    fn current(&self) -> Result<EngineConfig> {
        Ok(self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
