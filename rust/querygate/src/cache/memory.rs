use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{CacheError, CacheStore};

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

/// Writes between full sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 64;

/// In-process cache store used when no Redis URL is configured.
///
/// Expired entries are dropped on read, during key listing and by a full
/// sweep every `SWEEP_INTERVAL` writes. There is no size-based eviction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrites a raw value in place, keeping the current expiry.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str, data: &[u8]) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.data = data.to_vec();
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.data.clone()));
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            self.evict_expired();
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, CacheError> {
        let removed = keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.evict_expired();
        Ok(self
            .entries
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.entries.clear();
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// Redis-style glob with `*` and `?` wildcards.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = c;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}
