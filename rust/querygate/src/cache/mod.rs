//! Cache-aside result cache.
//!
//! `QueryCache` wraps a pluggable `CacheStore` (Redis or in-process) with key
//! derivation, a size/TTL policy and lookup metrics. Cache failures never
//! propagate: lookups degrade to misses and writes report `false`.

use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::CacheConfig;

pub mod key;
pub mod memory;
pub mod metrics;
pub mod redis;

pub use key::{query_cache_key, query_key_pattern, QUERY_KEY_PREFIX};
pub use memory::MemoryStore;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use self::redis::RedisStore;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("value of {size} bytes exceeds the {max} byte cache limit")]
    TooLarge { size: usize, max: usize },
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Key-value store primitives the cache layer needs.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), CacheError>;

    /// Deletes the given keys and returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, CacheError>;

    /// Lists keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError>;

    async fn flush_all(&self) -> Result<(), CacheError>;

    fn is_available(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_value_bytes: usize,
    pub compress_large_values: bool,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl_seconds: config.ttl_seconds,
            max_value_bytes: config.max_value_bytes,
            compress_large_values: config.compress_large_values,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub enabled: bool,
    pub available: bool,
}

#[derive(Debug, Clone)]
pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    settings: CacheSettings,
    metrics: Arc<CacheMetrics>,
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            store,
            settings,
            metrics,
        }
    }

    /// Picks the Redis store when a URL is configured, otherwise an in-process store.
    pub async fn from_config(config: &CacheConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn CacheStore> = match config.redis_url.as_deref() {
            Some(url) if config.enabled => Arc::new(RedisStore::connect(url).await?),
            _ => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(
            store,
            CacheSettings::from(config),
            Arc::new(CacheMetrics::new()),
        ))
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.settings.ttl_seconds
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Looks up and decodes a value. Undecodable entries count as errors and
    /// are deleted.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.settings.enabled {
            return None;
        }

        match self.store.get(key).await {
            Ok(Some(bytes)) => match decode::<T>(&bytes) {
                Ok(value) => {
                    self.metrics.record_hit();
                    debug!(key, "cache hit");
                    Some(value)
                }
                Err(err) => {
                    self.metrics.record_error();
                    warn!(key, error = %err, "discarding corrupted cache entry");
                    if let Err(err) = self.store.del(&[key.to_string()]).await {
                        warn!(key, error = %err, "failed to delete corrupted cache entry");
                    }
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_miss();
                debug!(key, "cache miss");
                None
            }
            Err(err) => {
                self.metrics.record_error();
                warn!(key, error = %err, "cache lookup failed");
                None
            }
        }
    }

    /// Stores a value with the given TTL. Returns `false` when the value was
    /// not cached (disabled, oversize or store failure).
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) -> bool {
        if !self.settings.enabled {
            return false;
        }

        let bytes = match encode(value, &self.settings) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key, error = %err, "value not cached");
                return false;
            }
        };

        match self.store.set_ex(key, &bytes, ttl_seconds).await {
            Ok(()) => {
                debug!(key, bytes = bytes.len(), ttl_seconds, "cached value");
                true
            }
            Err(err) => {
                warn!(key, error = %err, "cache write failed");
                false
            }
        }
    }

    /// Deletes every key matching the glob and returns how many were removed.
    pub async fn del_pattern(&self, pattern: &str) -> u64 {
        let keys = match self.store.keys(pattern).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(pattern, error = %err, "cache key listing failed");
                return 0;
            }
        };

        if keys.is_empty() {
            return 0;
        }

        match self.store.del(&keys).await {
            Ok(deleted) => {
                debug!(pattern, deleted, "invalidated cache entries");
                deleted
            }
            Err(err) => {
                warn!(pattern, error = %err, "cache invalidation failed");
                0
            }
        }
    }

    /// Drops every entry in the underlying store.
    pub async fn flush(&self) -> bool {
        match self.store.flush_all().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "cache flush failed");
                false
            }
        }
    }

    /// Miss-then-populate helper. Concurrent misses for one key may both run
    /// `supplier`; the last write wins.
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, ttl_seconds: u64, supplier: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let value = supplier().await?;
        self.set(key, &value, ttl_seconds).await;
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            metrics: self.metrics.snapshot(),
            enabled: self.settings.enabled,
            available: self.store.is_available(),
        }
    }
}

fn encode<T: Serialize>(value: &T, settings: &CacheSettings) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(value)?;
    if json.len() <= settings.max_value_bytes {
        return Ok(json);
    }

    if !settings.compress_large_values {
        return Err(CacheError::TooLarge {
            size: json.len(),
            max: settings.max_value_bytes,
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    if compressed.len() > settings.max_value_bytes {
        return Err(CacheError::TooLarge {
            size: compressed.len(),
            max: settings.max_value_bytes,
        });
    }
    Ok(compressed)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut json = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut json)?;
        return Ok(serde_json::from_slice(&json)?);
    }
    Ok(serde_json::from_slice(bytes)?)
}
