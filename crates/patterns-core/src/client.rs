//! Catalog API client: canonical URLs, cache-or-fetch, typed reads.
//! Reads never fail. A transport error, non-2xx or undecodable body yields an
//! empty result that is not cached.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::cache::{cache_key, CacheStore};
use crate::config::SettingsHandle;
use crate::deps::DependencyDescriptor;
use crate::error::CoreError;
use crate::models::{decode_list, decode_rows, ConnectivityReport, Pattern, PatternQuery, PatternSummary, Term};
use crate::params::{build_url, FilterValue, Query};
use crate::singleflight::SingleFlight;
use crate::transport::RobustClient;

pub const DEFAULT_PER_PAGE: u32 = 10;
pub const BULK_PAGE_SIZE: u32 = 100;
/// Full pages `get_all_patterns` will follow before giving up.
pub const MAX_PAGINATION_PAGES: u32 = 50;

/// Hooks for per-path cache behaviour.
pub trait CachePolicy: Send + Sync {
    fn ttl(&self, _path: &str, _query: &Query, default_ttl: u64) -> u64 {
        default_ttl
    }

    fn bypass(&self, _path: &str, _query: &Query) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCachePolicy;

impl CachePolicy for DefaultCachePolicy {}

pub struct ApiClient {
    settings: Arc<SettingsHandle>,
    http: Arc<RobustClient>,
    store: Arc<dyn CacheStore>,
    policy: Arc<dyn CachePolicy>,
    flights: SingleFlight,
}

/// Fill listing defaults. Zero and empty values count as absent.
fn listing_query(q: &PatternQuery) -> Query {
    let mut out = Query::new();
    out.set("per_page", q.per_page.filter(|n| *n > 0).unwrap_or(DEFAULT_PER_PAGE));
    out.set("page", q.page.filter(|n| *n > 0).unwrap_or(1));
    out.set(
        "orderby",
        q.orderby.as_deref().filter(|s| !s.is_empty()).unwrap_or("date"),
    );
    out.set(
        "order",
        q.order.as_deref().filter(|s| !s.is_empty()).unwrap_or("DESC"),
    );
    filters_into(&mut out, q);
    out
}

fn filters_into(out: &mut Query, q: &PatternQuery) {
    out.add_filter("category", &FilterValue::from(q.category.clone()));
    out.add_filter("type", &FilterValue::from(q.kind.clone()));
}

fn array_rows(data: Option<Value>) -> Vec<Value> {
    match data {
        Some(Value::Array(rows)) => rows,
        _ => Vec::new(),
    }
}

fn minimal_rows(data: Value) -> Value {
    match data {
        Value::Array(rows) => Value::Array(
            rows.iter()
                .filter_map(|r| r.as_object())
                .filter_map(|r| serde_json::to_value(PatternSummary::from_row(r)).ok())
                .collect(),
        ),
        other => other,
    }
}

impl ApiClient {
    pub fn new(
        settings: Arc<SettingsHandle>,
        http: Arc<RobustClient>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            settings,
            http,
            store,
            policy: Arc::new(DefaultCachePolicy),
            flights: SingleFlight::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CachePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn http(&self) -> &Arc<RobustClient> {
        &self.http
    }

    pub fn url(&self, path: &str, query: &Query) -> String {
        build_url(&self.settings.api_base(), path, query)
    }

    fn headers(&self, with_auth: bool) -> Vec<(String, String)> {
        let mut h = vec![("Accept".to_string(), "application/json".to_string())];
        if with_auth {
            if let Some(t) = self.settings.auth_token() {
                h.push(("Authorization".to_string(), format!("Bearer {}", t)));
            }
        }
        h
    }

    fn fetch_json(&self, url: &str) -> Option<Value> {
        let owned = self.headers(true);
        let headers: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let resp = match self.http.robust_get(url, &headers) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("[API] GET {} -> {}", url, e);
                return None;
            }
        };
        if !resp.is_success() {
            tracing::debug!("[API] GET {} -> HTTP {}", url, resp.status);
            return None;
        }
        match resp.json() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("[API] GET {} -> {}", url, e);
                None
            }
        }
    }

    /// Cache-or-fetch. `shape` runs on fresh data before it is stored.
    fn cached<F>(&self, path: &str, query: &Query, shape: F) -> Option<Value>
    where
        F: FnOnce(Value) -> Value,
    {
        let url = self.url(path, query);
        let key = cache_key(&url);
        let bypass = self.policy.bypass(path, query);
        if !bypass {
            if let Some(v) = self.store.get(&key) {
                tracing::debug!("[API] cache hit {}", url);
                return Some(v);
            }
        }
        self.flights.run(&key, || {
            if !bypass {
                if let Some(v) = self.store.get(&key) {
                    return Some(v);
                }
            }
            let data = shape(self.fetch_json(&url)?);
            let ttl = self.policy.ttl(path, query, self.settings.cache_ttl());
            self.store.set(&key, &data, ttl);
            Some(data)
        })
    }

    fn request(&self, path: &str, query: &Query) -> Option<Value> {
        self.cached(path, query, |v| v)
    }

    /// Like `request`, but marks the URL with `fields=min` and caches only
    /// id/title/link/featured_image per row.
    fn request_min(&self, path: &str, query: &Query) -> Option<Value> {
        let query = query.clone().with("fields", "min");
        self.cached(path, &query, minimal_rows)
    }

    /// Listing rows exactly as the catalog sent them.
    pub fn get_patterns_raw(&self, q: &PatternQuery) -> Vec<Value> {
        array_rows(self.request("patterns", &listing_query(q)))
    }

    pub fn get_patterns(&self, q: &PatternQuery) -> Vec<Pattern> {
        decode_rows(&self.get_patterns_raw(q))
    }

    pub fn get_patterns_min(&self, q: &PatternQuery) -> Vec<PatternSummary> {
        self.request_min("patterns", &listing_query(q))
            .map(|v| decode_list(&v))
            .unwrap_or_default()
    }

    /// Every page at `BULK_PAGE_SIZE` until a short or empty page.
    pub fn get_all_patterns(&self, q: &PatternQuery) -> Result<Vec<Pattern>, CoreError> {
        let per_page = q.per_page.filter(|n| *n > 0).unwrap_or(BULK_PAGE_SIZE);
        self.paginate(q, per_page, MAX_PAGINATION_PAGES)
    }

    /// Page length is judged on the rows received, not on how many decoded.
    pub(crate) fn paginate(
        &self,
        q: &PatternQuery,
        per_page: u32,
        max_pages: u32,
    ) -> Result<Vec<Pattern>, CoreError> {
        let first = q.page.filter(|n| *n > 0).unwrap_or(1);
        let mut all = Vec::new();
        for page in first..first + max_pages {
            let rows = self.get_patterns_raw(&PatternQuery {
                per_page: Some(per_page),
                page: Some(page),
                ..q.clone()
            });
            let n = rows.len();
            all.extend(decode_rows::<Pattern>(&rows));
            if n == 0 || n < per_page as usize {
                return Ok(all);
            }
        }
        tracing::warn!("[API] pagination cap hit after {} pages", max_pages);
        Err(CoreError::PaginationLimit { pages: max_pages })
    }

    /// Single pattern object as the catalog sent it.
    pub fn get_pattern_raw(&self, id: u64) -> Option<Value> {
        self.request(&format!("patterns/{}", id), &Query::new())
            .filter(Value::is_object)
    }

    pub fn get_pattern(&self, id: u64) -> Option<Pattern> {
        serde_json::from_value(self.get_pattern_raw(id)?).ok()
    }

    pub fn get_categories_raw(&self) -> Vec<Value> {
        array_rows(self.request("categories", &Query::new()))
    }

    pub fn get_types_raw(&self) -> Vec<Value> {
        array_rows(self.request("types", &Query::new()))
    }

    pub fn get_categories(&self) -> Vec<Term> {
        decode_rows(&self.get_categories_raw())
    }

    pub fn get_types(&self) -> Vec<Term> {
        decode_rows(&self.get_types_raw())
    }

    pub fn get_dependencies(&self) -> Vec<DependencyDescriptor> {
        self.request("dependencies", &Query::new())
            .map(|v| decode_list(&v))
            .unwrap_or_default()
    }

    pub fn search(&self, q: &str, args: &PatternQuery) -> Vec<Pattern> {
        decode_rows(&self.search_raw(q, args))
    }

    /// Search passes only what the caller set, plus `q`.
    pub fn search_raw(&self, q: &str, args: &PatternQuery) -> Vec<Value> {
        let mut query = Query::new().with("q", q);
        if let Some(n) = args.per_page.filter(|n| *n > 0) {
            query.set("per_page", n);
        }
        if let Some(n) = args.page.filter(|n| *n > 0) {
            query.set("page", n);
        }
        if let Some(s) = args.orderby.as_deref().filter(|s| !s.is_empty()) {
            query.set("orderby", s);
        }
        if let Some(s) = args.order.as_deref().filter(|s| !s.is_empty()) {
            query.set("order", s);
        }
        filters_into(&mut query, args);
        array_rows(self.request("search", &query))
    }

    /// POST `patterns/{id}/import`. Never cached. `{}` on any failure.
    pub fn import_pattern(&self, id: u64) -> Value {
        let url = self.url(&format!("patterns/{}/import", id), &Query::new());
        let owned = self.headers(true);
        let headers: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        match self.http.post_json(&url, &headers, &json!({})) {
            Ok(resp) => resp.json().unwrap_or_else(|e| {
                tracing::warn!("[API] import {} -> {}", id, e);
                json!({})
            }),
            Err(e) => {
                tracing::warn!("[API] import {} -> {}", id, e);
                json!({})
            }
        }
    }

    /// One uncached GET of `categories`.
    pub fn test_connectivity(&self) -> ConnectivityReport {
        let url = self.url("categories", &Query::new());
        let owned = self.headers(false);
        let headers: Vec<(&str, &str)> = owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        match self.http.robust_get(&url, &headers) {
            Ok(resp) => {
                let ok = resp.is_success();
                let message = if ok {
                    "OK".to_string()
                } else if resp.reason.is_empty() {
                    "Error".to_string()
                } else {
                    resp.reason.clone()
                };
                ConnectivityReport {
                    ok,
                    code: resp.status,
                    message,
                }
            }
            Err(e) => ConnectivityReport {
                ok: false,
                code: 0,
                message: e.to_string(),
            },
        }
    }
}
