//! TTL key-value cache. Two backends: an in-process map (supports group
//! flush) and a directory of JSON documents with an explicit expiry field.
//! Expiry is checked when reading; `purge_expired` sweeps the rest.

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Namespace prefix for every key this crate writes.
pub const CACHE_PREFIX: &str = "pcat_";

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value`. `ttl_secs == 0` means no expiry.
    fn set(&self, key: &str, value: &Value, ttl_secs: u64);

    fn delete(&self, key: &str);

    /// Remove every key starting with `prefix`. Returns how many went.
    fn clear(&self, prefix: &str) -> usize;

    /// Drop the whole namespace in one operation, if the backend can.
    fn flush_group(&self) -> Option<usize> {
        None
    }

    /// Remove entries whose expiry has passed.
    fn purge_expired(&self) -> usize;
}

/// Clear everything in our namespace, best-effort count.
pub fn clear_all(store: &dyn CacheStore) -> usize {
    match store.flush_group() {
        Some(n) => n,
        None => store.clear(CACHE_PREFIX),
    }
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for a fully normalized request URL.
pub fn cache_key(url: &str) -> String {
    format!("{}{}", CACHE_PREFIX, sha256_hex(url))
}

/// Key for a named singleton entry (sync marker, deps status, ...).
pub fn named_key(name: &str) -> String {
    format!("{}{}", CACHE_PREFIX, name)
}

/// Expiry timestamp for a TTL, `None` when it never expires.
pub(crate) fn expiry(now: i64, ttl_secs: u64) -> Option<i64> {
    if ttl_secs == 0 {
        None
    } else {
        Some(now.saturating_add(ttl_secs as i64))
    }
}

pub(crate) fn is_expired(expires_at: Option<i64>, now: i64) -> bool {
    matches!(expires_at, Some(t) if now >= t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_fixed_length_and_prefixed() {
        let a = cache_key("https://x.test/api/patterns?page=1");
        let b = cache_key("https://x.test/api/patterns?page=2");
        assert!(a.starts_with(CACHE_PREFIX));
        assert_eq!(a.len(), CACHE_PREFIX.len() + 64);
        assert_ne!(a, b);
        assert_eq!(a, cache_key("https://x.test/api/patterns?page=1"));
    }

    #[test]
    fn zero_ttl_never_expires() {
        assert_eq!(expiry(100, 0), None);
        assert!(!is_expired(None, i64::MAX));
        assert!(is_expired(expiry(100, 10), 110));
        assert!(!is_expired(expiry(100, 10), 109));
    }
}
