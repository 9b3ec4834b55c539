//! Core library for patterns-proxy: cache store, resilient transport,
//! catalog client, dependency readiness, warmup, media sideload, favorites.
//! Used by the CLI binary and the local proxy server.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod deps;
pub mod error;
pub mod events;
pub mod favorites;
pub mod host;
pub mod media;
pub mod models;
pub mod params;
pub mod registration;
pub mod singleflight;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testkit;

use std::sync::Arc;

pub use cache::{clear_all, CacheStore, DiskStore, MemoryStore};
pub use client::ApiClient;
pub use clock::{Clock, SystemClock};
pub use config::{load_settings, save_setting, CacheBackend, Role, Settings, SettingsChange, SettingsHandle};
pub use deps::{DependencyResolver, EnsureAllReport, EnsureResult, StatusReport};
pub use error::{CoreError, FetchError, HostError, MediaError, StoreError};
pub use favorites::{FavoriteAction, FavoritesStore};
pub use host::{DirectoryHost, PluginHost};
pub use media::{DiskMediaLibrary, MediaLibrary, SideloadReport, Sideloader};
pub use models::{ConnectivityReport, Pattern, PatternQuery, PatternSummary, Term};
pub use registration::Registrations;
pub use sync::{ScheduleConfig, Scheduler, Warmer};
pub use transport::{HttpTransport, RetryPolicy, RobustClient, UreqTransport};

/// Everything one process needs, wired together over one settings handle.
pub struct Services {
    pub settings: Arc<SettingsHandle>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn CacheStore>,
    pub http: Arc<RobustClient>,
    pub api: Arc<ApiClient>,
    pub resolver: Arc<DependencyResolver>,
    pub warmer: Arc<Warmer>,
    pub favorites: Arc<FavoritesStore>,
    pub sideloader: Arc<Sideloader>,
}

impl Services {
    /// Production wiring: system clock, ureq, the configured cache backend
    /// and the file-backed host, media library and favorites under data_dir.
    pub fn open(settings: Settings) -> Result<Self, CoreError> {
        let settings = Arc::new(SettingsHandle::new(settings));
        let snap = settings.snapshot();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn CacheStore> = match snap.cache_backend {
            CacheBackend::Memory => Arc::new(MemoryStore::new(clock.clone())),
            CacheBackend::Disk => Arc::new(DiskStore::open(snap.cache_dir(), clock.clone())?),
        };
        let http = Arc::new(RobustClient::new(
            Arc::new(UreqTransport::new()),
            store.clone(),
            clock.clone(),
            RetryPolicy::default(),
        ));
        let mut host = DirectoryHost::open(snap.plugins_dir(), snap.allow_install, snap.allow_activate)?;
        if let Some(base) = snap.package_base.as_deref() {
            host = host.with_packages(http.clone(), base);
        }
        let library = DiskMediaLibrary::open(
            snap.uploads_dir(),
            &format!("{}/uploads", snap.site_url),
        )?;
        let favorites = FavoritesStore::open(snap.favorites_path())?;
        tracing::debug!(
            "[CORE] data dir {}, cache backend {:?}",
            snap.data_dir.display(),
            snap.cache_backend
        );
        Ok(Self::assemble(
            settings,
            clock,
            store,
            http,
            Arc::new(host),
            Arc::new(library),
            favorites,
        ))
    }

    /// Wire the services over caller-provided seams.
    pub fn assemble(
        settings: Arc<SettingsHandle>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn CacheStore>,
        http: Arc<RobustClient>,
        host: Arc<dyn PluginHost>,
        library: Arc<dyn MediaLibrary>,
        favorites: FavoritesStore,
    ) -> Self {
        let api = Arc::new(ApiClient::new(settings.clone(), http.clone(), store.clone()));
        let resolver = Arc::new(DependencyResolver::new(
            api.clone(),
            host,
            store.clone(),
            settings.clone(),
        ));
        resolver.watch();
        let warmer = Arc::new(Warmer::new(
            api.clone(),
            store.clone(),
            settings.clone(),
            clock.clone(),
        ));
        let sideloader = Arc::new(Sideloader::new(http.clone(), library, settings.clone()));

        let invalidate = store.clone();
        settings.subscribe(move |change| {
            if matches!(change, SettingsChange::ApiBase | SettingsChange::AuthToken) {
                let n = clear_all(invalidate.as_ref());
                tracing::info!("[CACHE] {:?} changed, cleared {} entries", change, n);
            }
        });

        Self {
            settings,
            clock,
            store,
            http,
            api,
            resolver,
            warmer,
            favorites: Arc::new(favorites),
            sideloader,
        }
    }

    /// Start the background scheduler for these services.
    pub fn start_scheduler(&self) -> Arc<Scheduler> {
        Scheduler::start(
            self.warmer.clone(),
            self.resolver.clone(),
            &self.settings,
            ScheduleConfig::for_ttl(self.settings.cache_ttl()),
        )
    }
}
