use super::{ClassifierConfig, CountersConfig, SimConfig};
use crate::model::{BundleInfo, DAY_SECS};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

const MIN_CACHE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub storage: StorageKind,

    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Crash-recovery copy of the primary database.
    #[serde(default = "default_backup_database_path")]
    pub backup_database_path: String,

    #[serde(default = "default_cache_interval_secs")]
    pub cache_interval_secs: u64,

    #[serde(default = "default_write_interval_secs")]
    pub write_interval_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Pending bytes a table must reach before a scheduled write flushes it.
    #[serde(default = "default_flush_threshold_bytes")]
    pub flush_threshold_bytes: u64,

    #[serde(default)]
    pub enable_shared_traffic: bool,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub counters: CountersConfig,

    #[serde(default)]
    pub sims: Vec<SimConfig>,

    /// Bundle listing served by the static bundle source.
    #[serde(default)]
    pub bundles: Vec<BundleInfo>,

    #[serde(default = "default_api_addr")]
    pub api_addr: String,

    /// Bearer token granting the stats capability on the admin API.
    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default)]
    pub console_port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_database_path() -> String {
    "data/netstats.db".to_string()
}

fn default_backup_database_path() -> String {
    "data/netstats_backup.db".to_string()
}

fn default_cache_interval_secs() -> u64 {
    30 * 60
}

fn default_write_interval_secs() -> u64 {
    60 * 60
}

fn default_retention_days() -> u64 {
    180
}

fn default_flush_threshold_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_api_addr() -> String {
    "127.0.0.1:8190".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "netstats.log".to_string()
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            storage: StorageKind::default(),
            database_path: default_database_path(),
            backup_database_path: default_backup_database_path(),
            cache_interval_secs: default_cache_interval_secs(),
            write_interval_secs: default_write_interval_secs(),
            retention_days: default_retention_days(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            enable_shared_traffic: false,
            classifier: ClassifierConfig::default(),
            counters: CountersConfig::default(),
            sims: Vec::new(),
            bundles: Vec::new(),
            api_addr: default_api_addr(),
            api_token: None,
            console_port: None,
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
        }
    }
}

impl fmt::Debug for StatsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsConfig")
            .field("storage", &self.storage)
            .field("database_path", &self.database_path)
            .field("backup_database_path", &self.backup_database_path)
            .field("cache_interval_secs", &self.cache_interval_secs)
            .field("write_interval_secs", &self.write_interval_secs)
            .field("retention_days", &self.retention_days)
            .field("flush_threshold_bytes", &self.flush_threshold_bytes)
            .field("enable_shared_traffic", &self.enable_shared_traffic)
            .field("classifier", &self.classifier)
            .field("counters", &self.counters)
            .field("sims", &self.sims)
            .field("bundles", &self.bundles.len())
            .field("api_addr", &self.api_addr)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("console_port", &self.console_port)
            .field("log_level", &self.log_level)
            .field("log_dir", &self.log_dir)
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl StatsConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: StatsConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Clamps intervals into usable bounds and rejects contradictory paths.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.cache_interval_secs = Self::clamp_cache_interval(self.cache_interval_secs);
        self.write_interval_secs = self.write_interval_secs.max(self.cache_interval_secs);
        self.retention_days = self.retention_days.max(1);

        if self.storage == StorageKind::Sqlite && self.database_path == self.backup_database_path {
            bail!(
                "backup_database_path must differ from database_path ({})",
                self.database_path
            );
        }
        for sim in &self.sims {
            if !(1..=31).contains(&sim.begin_day) {
                bail!("sim {} has begin_day {} outside 1..=31", sim.sim_id, sim.begin_day);
            }
        }
        Ok(())
    }

    /// The shortest cache interval accepted from config or at runtime.
    pub fn clamp_cache_interval(secs: u64) -> u64 {
        secs.max(MIN_CACHE_INTERVAL_SECS)
    }

    pub fn cache_interval(&self) -> Duration {
        Duration::from_secs(self.cache_interval_secs)
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_secs(self.write_interval_secs)
    }

    pub fn retention_secs(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_SECS)
    }
}
