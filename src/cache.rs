//! Result cache backends
//!
//! Every backend stores whole [`StageResult`]s under the deterministic stage
//! key. Writes are idempotent puts and the last writer wins, so a cache can
//! be shared by concurrent queries without external locking.

use crate::config::{CacheBackend, EngineConfig, MAX_CACHE_TTL_SECS};
use crate::error::{QueryError, Result};
use crate::result::StageResult;
use crate::storage::{StorageEngine, StoreResultCache};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use lru::LruCache;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StageResult>>;

    fn put(&self, key: &str, result: &StageResult, ttl_secs: u64) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Extend the lifetime of an entry; false if absent
    fn touch_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    fn approximate_count(&self) -> Result<u64>;

    fn name(&self) -> &'static str;
}

/// Build the backend selected by the configuration.
///
/// The `store` backend needs an open storage engine.
pub fn build_cache(
    config: &EngineConfig,
    storage: Option<Arc<StorageEngine>>,
) -> Result<Arc<dyn ResultCache>> {
    let cache: Arc<dyn ResultCache> = match config.cache_backend {
        CacheBackend::None => Arc::new(NoCache),
        CacheBackend::Lru => Arc::new(LruResultCache::new(config.lru_capacity)),
        CacheBackend::Blob => Arc::new(BlobResultCache::new(config.blob_compress_over_bytes)),
        CacheBackend::Store => {
            let storage = storage.ok_or_else(|| {
                QueryError::Config("store cache backend requires a storage engine".to_string())
            })?;
            Arc::new(StoreResultCache::new(storage))
        }
    };
    Ok(cache)
}

/// Caching disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ResultCache for NoCache {
    fn get(&self, _key: &str) -> Result<Option<StageResult>> {
        Ok(None)
    }

    fn put(&self, _key: &str, _result: &StageResult, _ttl_secs: u64) -> Result<()> {
        Ok(())
    }

    fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn touch_ttl(&self, _key: &str, _ttl_secs: u64) -> Result<bool> {
        Ok(false)
    }

    fn approximate_count(&self) -> Result<u64> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Expiry instant for an entry written at `now`
fn expiry(now: Instant, ttl_secs: u64) -> Instant {
    let ttl = Duration::from_secs(ttl_secs.min(MAX_CACHE_TTL_SECS));
    now.checked_add(ttl).unwrap_or(now)
}

struct LruEntry {
    result: StageResult,
    expires_at: Instant,
}

/// Process-local bounded cache with least-recently-used eviction
pub struct LruResultCache {
    entries: Mutex<LruCache<String, LruEntry>>,
}

impl LruResultCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        LruResultCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl ResultCache for LruResultCache {
    fn get(&self, key: &str) -> Result<Option<StageResult>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let fresh = entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.result.clone()));
        match fresh {
            Some(Some(result)) => Ok(Some(StageResult {
                loaded: true,
                ..result
            })),
            Some(None) => {
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, result: &StageResult, ttl_secs: u64) -> Result<()> {
        let entry = LruEntry {
            result: result.clone(),
            expires_at: expiry(Instant::now(), ttl_secs),
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .peek(key)
            .map_or(false, |e| e.expires_at > Instant::now()))
    }

    fn touch_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let now = Instant::now();
        match self.entries.lock().peek_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = expiry(now, ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sweeps expired entries before counting
    fn approximate_count(&self) -> Result<u64> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
        Ok(entries.len() as u64)
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

#[derive(Clone)]
struct Blob {
    bytes: Vec<u8>,
    compressed: bool,
    expires_at: Instant,
}

/// Shared keyed blob store
///
/// Keys are SHA-256 digests of the stage key, values are JSON documents,
/// gzip-compressed above a size threshold. Clones share the same store.
#[derive(Clone)]
pub struct BlobResultCache {
    blobs: Arc<DashMap<String, Blob>>,
    compress_over_bytes: usize,
}

impl BlobResultCache {
    pub fn new(compress_over_bytes: usize) -> Self {
        BlobResultCache {
            blobs: Arc::new(DashMap::new()),
            compress_over_bytes,
        }
    }

    /// Digest used as the blob key
    pub fn digest(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        format!("lineage:{:x}", hasher.finalize())
    }

    fn encode(&self, result: &StageResult) -> Result<(Vec<u8>, bool)> {
        let json = serde_json::to_vec(result)?;
        if json.len() <= self.compress_over_bytes {
            return Ok((json, false));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok((encoder.finish()?, true))
    }

    fn decode(blob: &Blob) -> Result<StageResult> {
        let mut result: StageResult = if blob.compressed {
            let mut json = Vec::new();
            GzDecoder::new(blob.bytes.as_slice()).read_to_end(&mut json)?;
            serde_json::from_slice(&json)?
        } else {
            serde_json::from_slice(&blob.bytes)?
        };
        result.loaded = true;
        Ok(result)
    }

    /// Stored size of an entry, for inspection
    pub fn stored_len(&self, key: &str) -> Option<(usize, bool)> {
        self.blobs
            .get(&Self::digest(key))
            .map(|b| (b.bytes.len(), b.compressed))
    }
}

impl ResultCache for BlobResultCache {
    fn get(&self, key: &str) -> Result<Option<StageResult>> {
        let digest = Self::digest(key);
        let blob = match self.blobs.get(&digest) {
            Some(blob) => blob.clone(),
            None => return Ok(None),
        };
        let now = Instant::now();
        if blob.expires_at <= now {
            // A fresh put may have replaced the entry since it was read
            self.blobs.remove_if(&digest, |_, b| b.expires_at <= now);
            return Ok(None);
        }
        Self::decode(&blob).map(Some)
    }

    fn put(&self, key: &str, result: &StageResult, ttl_secs: u64) -> Result<()> {
        let (bytes, compressed) = self.encode(result)?;
        self.blobs.insert(
            Self::digest(key),
            Blob {
                bytes,
                compressed,
                expires_at: expiry(Instant::now(), ttl_secs),
            },
        );
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .blobs
            .get(&Self::digest(key))
            .map_or(false, |b| b.expires_at > Instant::now()))
    }

    fn touch_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let now = Instant::now();
        match self.blobs.get_mut(&Self::digest(key)) {
            Some(mut blob) if blob.expires_at > now => {
                blob.expires_at = expiry(now, ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sweeps expired blobs before counting
    fn approximate_count(&self) -> Result<u64> {
        let now = Instant::now();
        self.blobs.retain(|_, b| b.expires_at > now);
        Ok(self.blobs.len() as u64)
    }

    fn name(&self) -> &'static str {
        "blob"
    }
}
