//! Engine configuration

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Longest lifetime any cache entry may be given (ten years)
pub const MAX_CACHE_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

/// Which result cache backend the engine builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Caching disabled
    None,
    /// Process-local bounded LRU
    Lru,
    /// Shared keyed blob store
    Blob,
    /// Collection inside the node store
    Store,
}

/// Configuration for the query engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Above this many sub-nodes a 1-level child query goes to the search index
    pub search_index_threshold: u64,
    /// Maximum hits returned by one search index call
    pub max_search_hits: usize,
    /// Maximum graph depth; bounds recursive path enumeration
    pub max_depth: usize,
    /// Time to live of cached stage results (in seconds)
    pub cache_ttl_secs: u64,
    pub cache_backend: CacheBackend,
    /// Capacity of the in-process LRU cache
    pub lru_capacity: usize,
    /// Blob cache values above this size are gzip-compressed
    pub blob_compress_over_bytes: usize,
    /// Maximum queries running concurrently in the query service
    pub max_concurrent_queries: usize,
    /// Default log level for `init_logging` (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            search_index_threshold: 10_001,
            max_search_hits: 10_000,
            max_depth: 100,
            cache_ttl_secs: 3600 * 24,
            cache_backend: CacheBackend::Lru,
            lru_capacity: 1_000_000,
            blob_compress_over_bytes: 4096,
            max_concurrent_queries: (num_cpus::get() * 2).clamp(2, 64),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(QueryError::Config("max_depth must be positive".to_string()));
        }
        if self.max_search_hits == 0 {
            return Err(QueryError::Config("max_search_hits must be positive".to_string()));
        }
        if self.cache_backend == CacheBackend::Lru && self.lru_capacity == 0 {
            return Err(QueryError::Config("lru_capacity must be positive".to_string()));
        }
        if self.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(QueryError::Config(format!(
                "cache_ttl_secs must not exceed {}",
                MAX_CACHE_TTL_SECS
            )));
        }
        if self.max_concurrent_queries == 0 {
            return Err(QueryError::Config(
                "max_concurrent_queries must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn tracing_level(&self) -> tracing::Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Install a global fmt subscriber at the configured level.
///
/// Returns false when a subscriber was already installed.
pub fn init_logging(config: &EngineConfig) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_target(true)
        .try_init()
        .is_ok()
}
