//! QueueConfig - 運用パラメータ
//!
//! lease の猶予や fetch の待ち時間はプロトコルを定義する値ではなく
//! チューニング定数なので、すべて設定で変えられるようにします。
//! TOML ファイル + `TANKOBON_*` 環境変数で上書き。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where upscale-lane tasks execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// The local upscale loop consumes the upscale lane.
    #[default]
    Local,
    /// Remote workers pull the upscale lane through the coordinator.
    Distributed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub execution_mode: ExecutionMode,
    /// A lease without a heartbeat for this long is dead.
    pub lease_grace_secs: u64,
    /// Extra time granted on fetch to absorb network latency.
    pub lease_skew_secs: u64,
    pub reap_interval_secs: u64,
    /// Upper bound on how long a remote `fetch` blocks.
    pub fetch_timeout_secs: u64,
    pub progress_debounce_ms: u64,
    /// How long a local loop waits on its lanes before re-checking shutdown.
    pub poll_interval_ms: u64,
    /// Completed records kept by the retention sweep.
    pub retention_count: usize,
    pub cleanup_interval_secs: u64,
    /// Optimistic-concurrency retries inside a single claim.
    pub claim_attempts: u32,
    /// Scratch root for repair bundles.
    pub work_dir: PathBuf,
    /// JSON store file; in-memory store when absent.
    pub store_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Local,
            lease_grace_secs: 60,
            lease_skew_secs: 5,
            reap_interval_secs: 10,
            fetch_timeout_secs: 30,
            progress_debounce_ms: 250,
            poll_interval_ms: 1000,
            retention_count: 100,
            cleanup_interval_secs: 3600,
            claim_attempts: 3,
            work_dir: std::env::temp_dir().join("tankobon"),
            store_path: None,
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override fields from `TANKOBON_*` variables resolved by `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("TANKOBON_EXECUTION_MODE") {
            self.execution_mode = match v.as_str() {
                "local" => ExecutionMode::Local,
                "distributed" => ExecutionMode::Distributed,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "TANKOBON_EXECUTION_MODE".into(),
                        value: v,
                    });
                }
            };
        }
        if let Some(v) = lookup("TANKOBON_LEASE_GRACE_SECS") {
            self.lease_grace_secs = parse("TANKOBON_LEASE_GRACE_SECS", v)?;
        }
        if let Some(v) = lookup("TANKOBON_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = parse("TANKOBON_FETCH_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("TANKOBON_RETENTION_COUNT") {
            self.retention_count = parse("TANKOBON_RETENTION_COUNT", v)?;
        }
        if let Some(v) = lookup("TANKOBON_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TANKOBON_STORE_PATH") {
            self.store_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }

    pub fn lease_skew(&self) -> Duration {
        Duration::from_secs(self.lease_skew_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn progress_debounce(&self) -> Duration {
        Duration::from_millis(self.progress_debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
