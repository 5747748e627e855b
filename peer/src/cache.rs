//! Fingerprinted result cache: LRU capacity plus TTL expiry on read.
//! Only successful task results are cached.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Stable 256-bit fingerprint over (program, entry point, canonical args).
pub fn fingerprint(program: &str, function: &str, args: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(program.as_bytes());
    hasher.update([0u8]);
    hasher.update(function.as_bytes());
    hasher.update([0u8]);
    // serde_json preserves array order, which is the canonical form here.
    hasher.update(serde_json::to_string(args).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Entry {
    result: Value,
    created_at: Instant,
}

pub struct ResultCache {
    inner: Mutex<Inner>,
    ttl: Duration,
}

struct Inner {
    entries: LruCache<String, Entry>,
    hits: u64,
    misses: u64,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner { entries: LruCache::new(capacity), hits: 0, misses: 0 }),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                let result = entry.result.clone();
                inner.hits += 1;
                tracing::debug!(key = &key[..8.min(key.len())], "cache hit");
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.pop(key);
        }
        inner.misses += 1;
        None
    }

    pub fn put(&self, key: String, result: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.put(key, Entry { result, created_at: Instant::now() });
    }

    pub fn stats(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        serde_json::json!({
            "size": inner.entries.len(),
            "capacity": inner.entries.cap().get(),
            "hits": inner.hits,
            "misses": inner.misses,
            "hit_rate": if total > 0 { inner.hits as f64 / total as f64 } else { 0.0 },
        })
    }
}
