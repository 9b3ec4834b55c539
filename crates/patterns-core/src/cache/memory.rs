use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::{expiry, is_expired, CacheStore, CACHE_PREFIX};
use crate::clock::Clock;

struct Entry {
    value: Value,
    expires_at: Option<i64>,
}

/// Process-wide store. Per-key operations are atomic through dashmap shards.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now();
        let hit = self.entries.get(key).map(|e| {
            if is_expired(e.expires_at, now) {
                None
            } else {
                Some(e.value.clone())
            }
        })?;
        if hit.is_none() {
            self.entries
                .remove_if(key, |_, e| is_expired(e.expires_at, now));
        }
        hit
    }

    fn set(&self, key: &str, value: &Value, ttl_secs: u64) {
        let expires_at = expiry(self.clock.now(), ttl_secs);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// The map may be shared with non-catalog keys, so only our prefix goes.
    fn flush_group(&self) -> Option<usize> {
        Some(self.clear(CACHE_PREFIX))
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !is_expired(e.expires_at, now));
        before.saturating_sub(self.entries.len())
    }
}
