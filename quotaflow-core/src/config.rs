// quotaflow-core: configuration

use crate::error::LimiterError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub ttl: TtlSection,
    pub debounce: DebounceSection,
    pub batch: BatchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlSection {
    /// Alarm cadence, seconds. Default 30.
    pub analytics_secs: u64,
    /// DB reconciliation cadence, seconds. Default 86400 (24h).
    pub sync_usage_secs: u64,
    /// Placeholder revalidation TTL, seconds. Default 300.
    pub placeholder_revalidation_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceSection {
    pub debounce_delay_ms: u64,
    pub max_flush_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    pub batch_size: usize,
    pub hash_cache_capacity: usize,
}

pub const ALARM_MIN_SECS: u64 = 5;
pub const ALARM_MAX_SECS: u64 = 1_800;

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            server: ServerSection {
                bind_address: "127.0.0.1:7700".to_string(),
            },
            storage: StorageSection {
                data_dir: "./data/shards".to_string(),
            },
            ttl: TtlSection {
                analytics_secs: 30,
                sync_usage_secs: 86_400,
                placeholder_revalidation_secs: 300,
            },
            debounce: DebounceSection {
                debounce_delay_ms: 2_000,
                max_flush_interval_ms: 5_000,
            },
            batch: BatchSection {
                batch_size: 500,
                hash_cache_capacity: 1_000,
            },
        }
    }
}

impl LimiterConfig {
    pub fn from_file(path: &str) -> Result<Self, LimiterError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LimiterError::Config(format!("failed to read config file {path}: {e}")))?;
        toml::from_str(&content).map_err(|e| LimiterError::Config(format!("failed to parse config file: {e}")))
    }

    /// Dev/preview presets shorten the placeholder TTL and DB reconciliation
    /// cadence so local iteration doesn't wait on production-sized windows.
    pub fn for_environment(env: Environment) -> Self {
        let mut config = Self::default();
        match env {
            Environment::Dev => {
                config.ttl.placeholder_revalidation_secs = 10;
                config.ttl.sync_usage_secs = 60;
            }
            Environment::Preview => {
                config.ttl.placeholder_revalidation_secs = 30;
            }
            Environment::Production => {}
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Preview,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}
