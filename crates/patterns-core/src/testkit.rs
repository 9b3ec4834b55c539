//! Test doubles shared by the unit and scenario tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::cache::{CacheStore, MemoryStore};
use crate::client::ApiClient;
use crate::clock::{Clock, ManualClock};
use crate::config::{Settings, SettingsHandle};
use crate::error::{FetchError, HostError};
use crate::events::EventBus;
use crate::host::{CapabilityEvent, InstalledPlugin, PluginHost};
use crate::transport::{HttpResponse, HttpTransport, RetryPolicy, RobustClient};

pub(crate) const API_BASE: &str = "https://api.test/v1/";
pub(crate) const SITE_URL: &str = "https://site.test";

#[derive(Clone)]
pub(crate) enum Reply {
    Status(u16, Vec<u8>),
    Fail(String),
}

impl Reply {
    pub(crate) fn json(v: Value) -> Self {
        Reply::Status(200, serde_json::to_vec(&v).unwrap())
    }

    pub(crate) fn status(code: u16) -> Self {
        Reply::Status(code, b"{}".to_vec())
    }

    pub(crate) fn bytes(b: &[u8]) -> Self {
        Reply::Status(200, b.to_vec())
    }
}

struct Route {
    path: String,
    needle: Option<String>,
    replies: VecDeque<Reply>,
}

/// Routes by path relative to `API_BASE` (or by full URL for other hosts),
/// optionally narrowed by a query substring. Multi-reply routes play in
/// order and then repeat the last reply.
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub(crate) fn on(&self, path: &str, reply: Reply) {
        self.push(path, None, vec![reply]);
    }

    pub(crate) fn on_query(&self, path: &str, needle: &str, reply: Reply) {
        self.push(path, Some(needle.to_string()), vec![reply]);
    }

    pub(crate) fn sequence(&self, path: &str, replies: Vec<Reply>) {
        self.push(path, None, replies);
    }

    fn push(&self, path: &str, needle: Option<String>, replies: Vec<Reply>) {
        self.routes.lock().unwrap().push(Route {
            path: path.to_string(),
            needle,
            replies: replies.into(),
        });
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| split(u).0 == path)
            .count()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, url: &str) -> Result<HttpResponse, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let (path, query) = split(url);
        let mut routes = self.routes.lock().unwrap();
        let reply = routes
            .iter_mut()
            .rev()
            .find(|r| r.path == path && r.needle.as_deref().map(|n| query.contains(n)).unwrap_or(true))
            .map(|r| {
                if r.replies.len() > 1 {
                    r.replies.pop_front().unwrap()
                } else {
                    r.replies[0].clone()
                }
            })
            .unwrap_or(Reply::Status(404, br#"{"code":"rest_no_route"}"#.to_vec()));
        match reply {
            Reply::Status(status, body) => Ok(HttpResponse {
                status,
                reason: match status {
                    200 => "OK",
                    404 => "Not Found",
                    503 => "Service Unavailable",
                    _ => "",
                }
                .to_string(),
                content_type: Some("application/json".into()),
                body,
            }),
            Reply::Fail(msg) => Err(FetchError::Transport(msg)),
        }
    }
}

fn split(url: &str) -> (&str, &str) {
    let rest = url.strip_prefix(API_BASE).unwrap_or(url);
    match rest.split_once('?') {
        Some((p, q)) => (p, q),
        None => (rest, ""),
    }
}

impl HttpTransport for MockTransport {
    fn get(&self, url: &str, _: &[(&str, &str)], _: Duration) -> Result<HttpResponse, FetchError> {
        self.answer(url)
    }

    fn post(
        &self,
        url: &str,
        _: &[(&str, &str)],
        _: &[u8],
        _: Duration,
    ) -> Result<HttpResponse, FetchError> {
        self.answer(url)
    }
}

/// Fully wired client over the mock transport and a manual clock.
pub(crate) struct Kit {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn CacheStore>,
    pub transport: Arc<MockTransport>,
    pub settings: Arc<SettingsHandle>,
    pub http: Arc<RobustClient>,
    pub api: Arc<ApiClient>,
}

pub(crate) fn test_settings() -> Settings {
    Settings {
        api_base: Some(API_BASE.to_string()),
        site_url: SITE_URL.to_string(),
        ..Settings::default()
    }
}

impl Kit {
    pub(crate) fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(dyn_clock.clone()));
        let transport = Arc::new(MockTransport::default());
        let settings = Arc::new(SettingsHandle::new(test_settings()));
        let http = Arc::new(RobustClient::new(
            transport.clone(),
            store.clone(),
            dyn_clock,
            RetryPolicy::without_delays(),
        ));
        let api = Arc::new(ApiClient::new(settings.clone(), http.clone(), store.clone()));
        Self {
            clock,
            store,
            transport,
            settings,
            http,
            api,
        }
    }
}

struct FakePlugin {
    active: bool,
}

/// In-memory host. `installable` slugs can be installed; others are unknown.
pub(crate) struct FakeHost {
    plugins: Mutex<BTreeMap<String, FakePlugin>>,
    installable: Mutex<Vec<String>>,
    can_install: bool,
    can_activate: bool,
    events: EventBus<CapabilityEvent>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self {
            plugins: Mutex::new(BTreeMap::new()),
            installable: Mutex::new(Vec::new()),
            can_install: true,
            can_activate: true,
            events: EventBus::new(),
        }
    }

    pub(crate) fn with_permissions(mut self, install: bool, activate: bool) -> Self {
        self.can_install = install;
        self.can_activate = activate;
        self
    }

    pub(crate) fn add_installed(&self, slug: &str, active: bool) {
        self.plugins
            .lock()
            .unwrap()
            .insert(slug.to_string(), FakePlugin { active });
    }

    pub(crate) fn add_installable(&self, slug: &str) {
        self.installable.lock().unwrap().push(slug.to_string());
    }
}

impl PluginHost for FakeHost {
    fn list_installed(&self) -> Result<Vec<InstalledPlugin>, HostError> {
        Ok(self
            .plugins
            .lock()
            .unwrap()
            .iter()
            .map(|(slug, p)| InstalledPlugin {
                locator: format!("{}/{}.php", slug, slug),
                slug: slug.clone(),
                active: p.active,
            })
            .collect())
    }

    fn install(&self, slug: &str) -> Result<String, HostError> {
        if !self.installable.lock().unwrap().iter().any(|s| s == slug) {
            return Err(HostError::NotFound(slug.to_string()));
        }
        self.add_installed(slug, false);
        self.events.emit(&CapabilityEvent::Installed(slug.to_string()));
        Ok(format!("{}/{}.php", slug, slug))
    }

    fn activate(&self, locator: &str) -> Result<(), HostError> {
        let slug = crate::host::slug_from_locator(locator).to_string();
        {
            let mut plugins = self.plugins.lock().unwrap();
            let p = plugins
                .get_mut(&slug)
                .ok_or_else(|| HostError::NotFound(locator.to_string()))?;
            p.active = true;
        }
        self.events
            .emit(&CapabilityEvent::Activated(locator.to_string()));
        Ok(())
    }

    fn can_install(&self) -> bool {
        self.can_install
    }

    fn can_activate(&self) -> bool {
        self.can_activate
    }

    fn events(&self) -> &EventBus<CapabilityEvent> {
        &self.events
    }
}
