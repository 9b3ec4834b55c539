//! Cache warmup and the background scheduler that drives it.
//!
//! The scheduler is one worker thread fed over a channel: the hourly sync,
//! the dependency status check (every `max(60, cache_ttl)` seconds) and
//! ad-hoc warmup submissions all run there, one at a time.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::cache::{named_key, CacheStore};
use crate::client::{ApiClient, BULK_PAGE_SIZE, MAX_PAGINATION_PAGES};
use crate::clock::Clock;
use crate::config::{SettingsChange, SettingsHandle, MIN_CACHE_TTL};
use crate::deps::DependencyResolver;
use crate::error::CoreError;
use crate::models::PatternQuery;

const SYNC_MARKER: &str = "last_sync";
/// Page size the editor UI asks for.
pub const UI_PAGE_SIZE: u32 = 18;
pub const EXTENDED_FIRST_PAGE: u32 = 50;
pub const SYNC_INTERVAL: Duration = Duration::from_secs(3600);
/// Delay before the first deps check after start or a TTL change.
pub const DEPS_FIRST_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub categories: usize,
    pub types: usize,
    pub latest: usize,
    pub popular: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtendedReport {
    pub categories: usize,
    pub fetched: usize,
    pub pages: u32,
}

pub struct Warmer {
    api: Arc<ApiClient>,
    store: Arc<dyn CacheStore>,
    settings: Arc<SettingsHandle>,
    clock: Arc<dyn Clock>,
}

impl Warmer {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<dyn CacheStore>,
        settings: Arc<SettingsHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api,
            store,
            settings,
            clock,
        }
    }

    /// Seconds since the last completed sync, if one is on record.
    pub fn last_synced(&self) -> Option<i64> {
        self.store
            .get(&named_key(SYNC_MARKER))
            .and_then(|v| v.get("at").and_then(|t| t.as_i64()))
    }

    pub fn should_sync(&self) -> bool {
        match self.last_synced() {
            None => true,
            Some(at) => self.clock.now() - at >= self.settings.cache_ttl() as i64,
        }
    }

    /// Fetch what the UI opens with. Idempotent; everything goes through the
    /// normal cached reads.
    pub fn run_sync(&self) -> SyncReport {
        let categories = self.api.get_categories().len();
        let types = self.api.get_types().len();
        let latest = self
            .api
            .get_patterns(&PatternQuery::page(UI_PAGE_SIZE, 1).sorted("date", "DESC"))
            .len();
        let popular = self
            .api
            .get_patterns(&PatternQuery::page(UI_PAGE_SIZE, 1).sorted("popular", "DESC"))
            .len();
        let report = SyncReport {
            categories,
            types,
            latest,
            popular,
        };
        tracing::info!("[SYNC] warmup done: {:?}", report);
        report
    }

    pub fn mark_synced(&self) {
        self.store.set(
            &named_key(SYNC_MARKER),
            &json!({ "at": self.clock.now() }),
            self.settings.cache_ttl(),
        );
    }

    /// Sync and mark, unless a fresh marker exists. Returns whether it ran.
    pub fn run_sync_if_needed(&self) -> bool {
        if !self.should_sync() {
            return false;
        }
        self.run_sync();
        self.mark_synced();
        true
    }

    /// Deeper prefetch of minimal listings, up to `max_register` rows.
    pub fn run_extended(&self) -> Result<ExtendedReport, CoreError> {
        let categories = self.api.get_categories().len();
        let max = self.settings.max_register();
        let mut fetched = self
            .api
            .get_patterns_min(&PatternQuery::page(EXTENDED_FIRST_PAGE, 1))
            .len();
        let mut pages = 1u32;
        let mut page = 2u32;
        while fetched < max {
            if pages >= MAX_PAGINATION_PAGES {
                return Err(CoreError::PaginationLimit { pages });
            }
            let batch = self
                .api
                .get_patterns_min(&PatternQuery::page(BULK_PAGE_SIZE, page));
            if batch.is_empty() {
                break;
            }
            fetched += batch.len();
            pages += 1;
            page += 1;
        }
        tracing::info!("[SYNC] extended prefetch: {} rows over {} pages", fetched, pages);
        Ok(ExtendedReport {
            categories,
            fetched,
            pages,
        })
    }
}

pub fn deps_check_interval(cache_ttl: u64) -> Duration {
    Duration::from_secs(cache_ttl.max(MIN_CACHE_TTL))
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub sync_every: Duration,
    pub deps_every: Duration,
    pub deps_first_delay: Duration,
}

impl ScheduleConfig {
    pub fn for_ttl(cache_ttl: u64) -> Self {
        Self {
            sync_every: SYNC_INTERVAL,
            deps_every: deps_check_interval(cache_ttl),
            deps_first_delay: DEPS_FIRST_DELAY,
        }
    }
}

enum Msg {
    Warmup,
    Reschedule(u64),
    Shutdown,
}

pub struct Scheduler {
    tx: Mutex<Sender<Msg>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker and hook it to `cache_ttl` changes.
    pub fn start(
        warmer: Arc<Warmer>,
        resolver: Arc<DependencyResolver>,
        settings: &SettingsHandle,
        cfg: ScheduleConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Msg>();
        let handle = thread::Builder::new()
            .name("patterns-scheduler".into())
            .spawn(move || {
                let mut deps_every = cfg.deps_every;
                let mut next_sync = Instant::now() + cfg.sync_every;
                let mut next_deps = Instant::now() + cfg.deps_first_delay;
                tracing::info!(
                    "[SCHED] started: sync every {:?}, deps check every {:?}",
                    cfg.sync_every,
                    deps_every
                );
                loop {
                    let now = Instant::now();
                    if now >= next_sync {
                        warmer.run_sync();
                        warmer.mark_synced();
                        next_sync = now + cfg.sync_every;
                    }
                    if now >= next_deps {
                        let status = resolver.refresh_status();
                        tracing::debug!("[SCHED] deps check: all_ready={}", status.all_ready);
                        next_deps = now + deps_every;
                    }
                    let wait = next_sync.min(next_deps).saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(Msg::Warmup) => {
                            if warmer.run_sync_if_needed() {
                                tracing::debug!("[SCHED] background warmup ran");
                            }
                        }
                        Ok(Msg::Reschedule(ttl)) => {
                            deps_every = deps_check_interval(ttl);
                            next_deps = Instant::now() + cfg.deps_first_delay;
                            tracing::info!("[SCHED] deps check every {:?}", deps_every);
                        }
                        Ok(Msg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                tracing::info!("[SCHED] stopped");
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("[SCHED] could not spawn worker: {}", e);
                None
            }
        };
        let sched = Arc::new(Self {
            tx: Mutex::new(tx),
            handle: Mutex::new(handle),
        });

        let weak: Weak<Self> = Arc::downgrade(&sched);
        settings.subscribe(move |change| {
            if let SettingsChange::CacheTtl { new, .. } = change {
                if let Some(s) = weak.upgrade() {
                    s.reschedule(*new);
                }
            }
        });
        sched
    }

    fn send(&self, msg: Msg) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if tx.send(msg).is_err() {
            tracing::debug!("[SCHED] worker gone, message dropped");
        }
    }

    /// Queue a warmup-if-stale. Returns immediately.
    pub fn submit_warmup(&self) {
        self.send(Msg::Warmup);
    }

    pub fn reschedule(&self, cache_ttl: u64) {
        self.send(Msg::Reschedule(cache_ttl));
    }

    /// Stop the worker and wait for the job in progress.
    pub fn shutdown(&self) {
        self.send(Msg::Shutdown);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.send(Msg::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeHost, Kit, Reply};
    use serde_json::json;

    fn warmer(kit: &Kit) -> Warmer {
        Warmer::new(kit.api.clone(), kit.store.clone(), kit.settings.clone(), kit.clock.clone())
    }

    fn rows(n: usize) -> serde_json::Value {
        json!((0..n).map(|i| json!({"id": i + 1, "title": format!("P{}", i + 1)})).collect::<Vec<_>>())
    }

    #[test]
    fn stale_until_marked_then_fresh_for_ttl() {
        let kit = Kit::new();
        let w = warmer(&kit);
        assert!(w.should_sync());
        w.mark_synced();
        assert!(!w.should_sync());
        kit.clock.advance(kit.settings.cache_ttl() as i64);
        assert!(w.should_sync());
    }

    #[test]
    fn run_sync_warms_the_four_ui_reads() {
        let kit = Kit::new();
        kit.transport.on("categories", Reply::json(json!([{"id": 1, "slug": "a", "name": "A"}])));
        kit.transport.on("types", Reply::json(json!([])));
        kit.transport.on("patterns", Reply::json(rows(18)));
        let w = warmer(&kit);

        let report = w.run_sync();
        assert_eq!(report.latest, 18);
        assert_eq!(kit.transport.calls(), 4);
        let urls = kit.transport.urls();
        assert!(urls.iter().any(|u| u.contains("orderby=popular")));
        assert!(urls.iter().all(|u| !u.contains("fields=min")));

        // Second run is served from cache.
        w.run_sync();
        assert_eq!(kit.transport.calls(), 4);
    }

    #[test]
    fn run_sync_if_needed_skips_when_fresh() {
        let kit = Kit::new();
        let w = warmer(&kit);
        assert!(w.run_sync_if_needed());
        let calls = kit.transport.calls();
        assert!(!w.run_sync_if_needed());
        assert_eq!(kit.transport.calls(), calls);
    }

    #[test]
    fn extended_stops_at_max_register() {
        let kit = Kit::new();
        kit.settings.update(|s| s.max_register = 200);
        kit.transport.on("patterns", Reply::json(rows(100)));
        kit.transport.on_query("patterns", "per_page=50", Reply::json(rows(50)));
        let w = warmer(&kit);

        let report = w.run_extended().unwrap();
        // 50 on page one, then two pages of 100.
        assert_eq!(report.fetched, 250);
        assert_eq!(report.pages, 3);
        assert!(kit.transport.urls().iter().all(|u| !u.starts_with("https://api.test/v1/patterns") || u.contains("fields=min")));
    }

    #[test]
    fn extended_stops_on_empty_page() {
        let kit = Kit::new();
        kit.transport.on("patterns", Reply::json(json!([])));
        kit.transport.on_query("patterns", "per_page=50", Reply::json(rows(10)));
        let report = warmer(&kit).run_extended().unwrap();
        assert_eq!(report.fetched, 10);
        assert_eq!(report.pages, 1);
    }

    #[test]
    fn deps_interval_has_a_floor() {
        assert_eq!(deps_check_interval(10), Duration::from_secs(60));
        assert_eq!(deps_check_interval(900), Duration::from_secs(900));
    }

    #[test]
    fn submitted_warmup_runs_in_background() {
        let kit = Kit::new();
        kit.transport.on("categories", Reply::json(json!([])));
        let w = Arc::new(warmer(&kit));
        let resolver = Arc::new(DependencyResolver::new(
            kit.api.clone(),
            Arc::new(FakeHost::new()),
            kit.store.clone(),
            kit.settings.clone(),
        ));
        let cfg = ScheduleConfig {
            sync_every: Duration::from_secs(3600),
            deps_every: Duration::from_secs(3600),
            deps_first_delay: Duration::from_secs(3600),
        };
        let sched = Scheduler::start(w.clone(), resolver, &kit.settings, cfg);
        sched.submit_warmup();

        let deadline = Instant::now() + Duration::from_secs(5);
        while w.should_sync() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        sched.shutdown();
        assert!(!w.should_sync());
        assert_eq!(kit.transport.calls_to("categories"), 1);
    }
}
