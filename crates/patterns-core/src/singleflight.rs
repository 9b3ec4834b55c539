//! Per-key in-flight lock. Concurrent cache misses on one key run the fetch
//! once; the rest wait and then re-read the cache.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

#[derive(Default)]
pub struct SingleFlight {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn run<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let out = {
            let _held = slot.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        drop(slot);
        self.slots
            .remove_if(key, |_, s| Arc::strong_count(s) == 1);
        out
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}
