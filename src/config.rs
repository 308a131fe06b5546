//! Configuration loading.
//!
//! Mirrors a `config.toml` + process-wide [`OnceCell`] pattern,
//! but deserialises into a typed [`IndexerConfig`] instead of handing out the
//! raw [`config::Config`] map (§7).

use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::{IndexerError, Result};

static GLOBAL_CONFIG: OnceCell<IndexerConfig> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_cache_max_entries() -> usize {
    500
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

/// Top-level runtime configuration for the dispatch pipeline and store cache.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Maximum blocks fetched per batch; also sets the height queue and task
    /// runner capacities (`batch_size * 3`), per §6.
    pub batch_size: usize,

    /// When true, wrap `fetch_blocks_batches` with timing instrumentation.
    #[serde(default)]
    pub profiler: bool,

    /// Whether entities are stored with block-range versioning ("historical
    /// mode") or as a single upserted row per id.
    #[serde(default)]
    pub historical: bool,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Flush when total flushable record count across all cached models
    /// exceeds this threshold.
    pub flush_record_threshold: usize,

    /// Flush at least every N processed blocks, regardless of record count.
    #[serde(default)]
    pub flush_block_interval: Option<u64>,

    pub database: DatabaseConfig,
}

impl IndexerConfig {
    /// Capacity shared by the height queue (C1) and the ordered task runner
    /// (C2), per §4.9.
    pub fn pipeline_capacity(&self) -> usize {
        self.batch_size * 3
    }
}

/// Load configuration from `config.toml` plus `INDEXER_*` environment
/// overrides.
pub fn load_config() -> Result<IndexerConfig> {
    let raw = config::Config::builder()
        .add_source(config::File::with_name("config.toml").required(false))
        .add_source(config::Environment::with_prefix("INDEXER").separator("__"))
        .build()
        .map_err(|e| IndexerError::Config(e.to_string()))?;

    raw.try_deserialize()
        .map_err(|e| IndexerError::Config(e.to_string()))
}

/// Initialise the process-wide config singleton. Call once at startup.
pub fn init_global_config(config: IndexerConfig) -> Result<()> {
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| IndexerError::Config("global config already initialized".into()))
}

/// Fetch the process-wide config singleton.
///
/// # Panics
/// Panics if [`init_global_config`] has not been called yet - this is a
/// startup-ordering programmer error, not a runtime condition.
pub fn get_global_config() -> &'static IndexerConfig {
    GLOBAL_CONFIG
        .get()
        .expect("config not initialized - call init_global_config() first")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_capacity_is_three_times_batch_size() {
        let cfg = IndexerConfig {
            batch_size: 10,
            profiler: false,
            historical: true,
            cache: CacheConfig::default(),
            flush_record_threshold: 1000,
            flush_block_interval: None,
            database: DatabaseConfig {
                url: "postgres://localhost/test".into(),
                max_connections: 5,
            },
        };
        assert_eq!(cfg.pipeline_capacity(), 30);
    }
}
