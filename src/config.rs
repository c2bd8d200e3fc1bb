//! Configuration file support for the Clotho engine.
//!
//! Loads optional `clotho.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClothoConfig {
    pub store: StoreConfig,
    pub engine: EngineConfig,
}

/// Per-table LRU cache capacities. Zero disables the cache.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheSizes {
    pub events: usize,
    pub headers: usize,
    pub blocks: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        CacheSizes {
            events: 512,
            headers: 2048,
            blocks: 256,
        }
    }
}

/// Store and flush-pool configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub cache_sizes: CacheSizes,
    /// Seconds between forced pool flushes.
    pub flush_interval_secs: u64,
    /// Buffered bytes above which the pool flushes regardless of time.
    pub flush_size_threshold: usize,
    /// Retry budget for transient KV failures before escalating to fatal.
    pub kv_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            cache_sizes: CacheSizes::default(),
            flush_interval_secs: constants::FLUSH_INTERVAL_SECS,
            flush_size_threshold: constants::FLUSH_SIZE_THRESHOLD,
            kv_retries: 3,
        }
    }
}

impl StoreConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Config for tests and tools: tiny caches, immediate flush threshold.
    pub fn lite() -> Self {
        StoreConfig {
            cache_sizes: CacheSizes {
                events: 64,
                headers: 256,
                blocks: 32,
            },
            ..StoreConfig::default()
        }
    }
}

/// Consensus engine configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Blocks per epoch before the validator set is refreshed.
    pub epoch_length: u64,
    /// Maximum parents accepted per event.
    pub max_parents: usize,
    /// Whether forked events are persisted (and demoted) or rejected.
    pub fork_tolerance: bool,
    /// Supermajority ratio; quorum is strictly above num/den of total stake.
    pub supermajority_num: u64,
    pub supermajority_den: u64,
    /// Gas power granted to each validator at the start of an epoch.
    pub gas_power_startup: u64,
    /// Total gas power regenerated per second, split by stake share.
    pub gas_power_per_second: u64,
    /// Ceiling on accumulated per-validator gas power.
    pub gas_power_max: u64,
    /// Seconds between validator score checkpoints.
    pub score_checkpoint_interval_secs: u64,
    /// Deadline for application callbacks in milliseconds. Expiry is
    /// advisory except for block application, where it is fatal.
    pub callback_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            epoch_length: constants::EPOCH_LENGTH_BLOCKS,
            max_parents: constants::MAX_PARENTS,
            fork_tolerance: true,
            supermajority_num: constants::SUPERMAJORITY_NUM,
            supermajority_den: constants::SUPERMAJORITY_DEN,
            gas_power_startup: constants::GAS_POWER_STARTUP,
            gas_power_per_second: constants::GAS_POWER_PER_SECOND,
            gas_power_max: constants::GAS_POWER_MAX,
            score_checkpoint_interval_secs: constants::SCORE_CHECKPOINT_INTERVAL_SECS,
            callback_deadline_ms: constants::CALLBACK_DEADLINE_MS,
        }
    }
}

impl EngineConfig {
    pub fn callback_deadline(&self) -> Duration {
        Duration::from_millis(self.callback_deadline_ms)
    }

    pub fn score_checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.score_checkpoint_interval_secs)
    }
}

impl ClothoConfig {
    /// Load configuration from `clotho.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("clotho.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        let config = ClothoConfig::default();
        assert_eq!(config.engine.max_parents, constants::MAX_PARENTS);
        assert_eq!(config.engine.supermajority_num, 2);
        assert_eq!(config.engine.supermajority_den, 3);
        assert!(config.engine.fork_tolerance);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[store]
flush_interval_secs = 60
flush_size_threshold = 1048576

[store.cache_sizes]
events = 16

[engine]
epoch_length = 10
max_parents = 8
fork_tolerance = false
"#;
        let config: ClothoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store.flush_interval_secs, 60);
        assert_eq!(config.store.flush_size_threshold, 1048576);
        assert_eq!(config.store.cache_sizes.events, 16);
        assert_eq!(config.engine.epoch_length, 10);
        assert_eq!(config.engine.max_parents, 8);
        assert!(!config.engine.fork_tolerance);
    }

    #[test]
    fn missing_config_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClothoConfig::load(dir.path());
        assert_eq!(config.engine.epoch_length, constants::EPOCH_LENGTH_BLOCKS);
    }
}
