//! Shared state injected into every handler.

use std::sync::Arc;

use patterns_core::{Scheduler, Services};

use super::error::ApiError;

pub struct AppState {
    pub services: Arc<Services>,
    /// Absent when the server runs without background jobs (tests).
    pub scheduler: Option<Arc<Scheduler>>,
}

impl AppState {
    pub fn new(services: Arc<Services>, scheduler: Option<Arc<Scheduler>>) -> Arc<Self> {
        Arc::new(Self {
            services,
            scheduler,
        })
    }

    /// Run blocking core work off the async workers.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Services) -> T + Send + 'static,
        T: Send + 'static,
    {
        let services = Arc::clone(&self.services);
        Ok(tokio::task::spawn_blocking(move || f(&services)).await?)
    }
}
