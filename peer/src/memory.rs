//! In-peer key/value memory store.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// Concurrent key → JSON value mapping. Writes to the same key are
/// last-write-wins under the store lock.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    store: HashMap<String, Value>,
    operation_count: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { store: HashMap::new(), operation_count: 0 }),
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.store.insert(key.to_string(), value);
        inner.operation_count += 1;
        tracing::debug!(key, "memory set");
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().unwrap();
        inner.operation_count += 1;
        inner.store.get(key).cloned()
    }

    /// Returns true if the key existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.store.remove(key).is_some();
        if removed {
            inner.operation_count += 1;
            tracing::debug!(key, "memory delete");
        }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.store.keys().cloned().collect()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().unwrap().store.len()
    }

    pub fn stats(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        serde_json::json!({
            "key_count": inner.store.len(),
            "operation_count": inner.operation_count,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_overwrite() {
        let store = MemoryStore::new();
        store.set("k", json!("v"));
        assert_eq!(store.get("k"), Some(json!("v")));
        store.set("k", json!("v2"));
        assert_eq!(store.get("k"), Some(json!("v2")));
        assert_eq!(store.key_count(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.set("k", json!(1));
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn stats_track_operations() {
        let store = MemoryStore::new();
        store.set("a", json!(1));
        store.set("b", json!(2));
        store.get("a");
        let stats = store.stats();
        assert_eq!(stats["key_count"], 2);
        assert_eq!(stats["operation_count"], 3);
    }
}
