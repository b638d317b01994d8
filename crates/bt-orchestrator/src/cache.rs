//! Translation result cache
//!
//! Segments with identical (text, languages, model, context) are served
//! from memory instead of being dispatched again. Entries expire after a
//! TTL; when full, expired entries are dropped first and then the oldest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use bt_core::config::ResultCacheConfig;

/// Hashed identity of one translation request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(text: &str, from: &str, to: &str, model: &str, context: Option<u32>) -> Self {
        let mut hasher = Sha256::new();
        for part in [text, from, to, model] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        if let Some(context) = context {
            hasher.update(context.to_string().as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Entry {
    value: String,
    inserted: Instant,
}

/// Counters reported by [`ResultCache::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded, TTL-expiring map from request to translated text
pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ResultCacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    /// Whether the cache stores anything at all
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0 && !self.ttl.is_zero()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached translation, if present and not expired
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let mut entries = self.lock();
        let hit = match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Store a translation
    pub fn insert(&self, key: CacheKey, value: String) {
        if !self.is_enabled() {
            return;
        }
        let mut entries = self.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
