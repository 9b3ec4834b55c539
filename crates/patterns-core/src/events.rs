//! Minimal synchronous event bus used for settings changes and host
//! capability events. Listeners run on the emitting thread.

use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E> {
    listeners: Mutex<Vec<Listener<E>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        guard.push(Arc::new(f));
    }

    /// Deliver `event` to every listener. The listener list is snapshotted
    /// first so a listener may subscribe or emit without deadlocking.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        for l in snapshot {
            l(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|g| g.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }
}
