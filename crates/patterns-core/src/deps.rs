//! Required-dependency readiness: what the catalog says must be installed
//! and active, what the host actually has, and driving the host to close
//! the gap.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{named_key, CacheStore};
use crate::client::ApiClient;
use crate::config::{SettingsHandle, MIN_CACHE_TTL};
use crate::error::HostError;
use crate::host::{InstalledPlugin, PluginHost};

const STATUS_KEY: &str = "deps_status";

pub const ERR_NO_PERMISSION_ACTIVATE: &str = "no_permission_activate";
pub const ERR_NO_PERMISSION_INSTALL: &str = "no_permission_install";
pub const ERR_PLUGIN_INFO_FAILED: &str = "plugin_info_failed";
pub const ERR_INSTALL_FAILED: &str = "install_failed";

/// Remote descriptors come as a bare slug or a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyDescriptor {
    Slug(String),
    Record(DependencyRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<DependencyInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequirement {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub slug: String,
    pub name: String,
    pub installed: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub all_ready: bool,
    pub required: Vec<DependencyStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnsureResult {
    pub slug: String,
    pub installed: bool,
    pub activated: bool,
    /// Empty on success.
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureAllReport {
    pub results: Vec<EnsureResult>,
    pub status: StatusReport,
}

/// Lowercase and keep only `[a-z0-9_-]`.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect()
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(s.trim(), "" | "0" | "false"),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

impl DependencyDescriptor {
    /// Requirement if this descriptor names a required dependency.
    pub fn requirement(&self) -> Option<DependencyRequirement> {
        let (slug, name, required) = match self {
            DependencyDescriptor::Slug(s) => {
                let slug = sanitize_key(s);
                (slug.clone(), slug, true)
            }
            DependencyDescriptor::Record(r) => {
                let info = r.info.as_ref();
                let slug = info
                    .and_then(|i| i.slug.as_deref())
                    .or(r.slug.as_deref())
                    .map(sanitize_key)
                    .unwrap_or_default();
                let name = r
                    .name
                    .as_deref()
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| slug.clone());
                let required = info
                    .and_then(|i| i.required.as_ref())
                    .or(r.required.as_ref())
                    .map(truthy)
                    .unwrap_or(false);
                (slug, name, required)
            }
        };
        (!slug.is_empty() && required).then_some(DependencyRequirement { slug, name })
    }
}

pub struct DependencyResolver {
    api: Arc<ApiClient>,
    host: Arc<dyn PluginHost>,
    store: Arc<dyn CacheStore>,
    settings: Arc<SettingsHandle>,
}

impl DependencyResolver {
    pub fn new(
        api: Arc<ApiClient>,
        host: Arc<dyn PluginHost>,
        store: Arc<dyn CacheStore>,
        settings: Arc<SettingsHandle>,
    ) -> Self {
        Self {
            api,
            host,
            store,
            settings,
        }
    }

    /// Recompute status whenever the host reports a capability change.
    pub fn watch(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.host.events().subscribe(move |event| {
            if let Some(r) = weak.upgrade() {
                tracing::debug!("[DEPS] host event {:?}, refreshing status", event);
                r.refresh_status();
            }
        });
    }

    pub fn host(&self) -> &Arc<dyn PluginHost> {
        &self.host
    }

    fn status_ttl(&self) -> u64 {
        self.settings.cache_ttl().max(MIN_CACHE_TTL)
    }

    /// Required entries, first occurrence of each slug wins.
    pub fn get_required_list(&self) -> Vec<DependencyRequirement> {
        let mut seen = HashSet::new();
        self.api
            .get_dependencies()
            .iter()
            .filter_map(DependencyDescriptor::requirement)
            .filter(|r| seen.insert(r.slug.clone()))
            .collect()
    }

    pub fn get_installed_map(&self) -> BTreeMap<String, InstalledPlugin> {
        match self.host.list_installed() {
            Ok(list) => list.into_iter().map(|p| (p.slug.clone(), p)).collect(),
            Err(e) => {
                tracing::warn!("[DEPS] listing installed plugins failed: {}", e);
                BTreeMap::new()
            }
        }
    }

    pub fn compute_status(&self) -> StatusReport {
        let installed = self.get_installed_map();
        let required: Vec<DependencyStatus> = self
            .get_required_list()
            .into_iter()
            .map(|r| {
                let hit = installed.get(&r.slug);
                DependencyStatus {
                    installed: hit.is_some(),
                    active: hit.map(|p| p.active).unwrap_or(false),
                    slug: r.slug,
                    name: r.name,
                }
            })
            .collect();
        StatusReport {
            all_ready: required.iter().all(|d| d.installed && d.active),
            required,
        }
    }

    pub fn get_status(&self) -> StatusReport {
        if let Some(cached) = self
            .store
            .get(&named_key(STATUS_KEY))
            .and_then(|v| serde_json::from_value::<StatusReport>(v).ok())
        {
            return cached;
        }
        self.refresh_status()
    }

    pub fn refresh_status(&self) -> StatusReport {
        let status = self.compute_status();
        match serde_json::to_value(&status) {
            Ok(v) => self
                .store
                .set(&named_key(STATUS_KEY), &v, self.status_ttl()),
            Err(e) => tracing::warn!("[DEPS] could not cache status: {}", e),
        }
        status
    }

    fn activate_into(&self, locator: &str, result: &mut EnsureResult) {
        match self.host.activate(locator) {
            Ok(()) => result.activated = true,
            Err(e) => result.error = e.to_string(),
        }
    }

    /// Install and/or activate one dependency. Problems land in `error`.
    pub fn ensure_plugin_ready(&self, slug: &str) -> EnsureResult {
        let slug = sanitize_key(slug);
        let mut result = EnsureResult {
            slug: slug.clone(),
            ..EnsureResult::default()
        };
        let installed = self.get_installed_map();

        if let Some(p) = installed.get(&slug) {
            result.installed = true;
            if p.active {
                result.activated = true;
            } else if !self.host.can_activate() {
                result.error = ERR_NO_PERMISSION_ACTIVATE.to_string();
            } else {
                self.activate_into(&p.locator, &mut result);
            }
            return result;
        }

        if !self.host.can_install() {
            result.error = ERR_NO_PERMISSION_INSTALL.to_string();
            return result;
        }

        match self.host.install(&slug) {
            Ok(_) => {}
            Err(HostError::NotFound(_)) => {
                result.error = ERR_PLUGIN_INFO_FAILED.to_string();
                return result;
            }
            Err(e) => {
                tracing::warn!("[DEPS] installing {} failed: {}", slug, e);
                result.error = e.to_string();
                return result;
            }
        }

        match self.get_installed_map().get(&slug) {
            Some(p) => {
                result.installed = true;
                if self.host.can_activate() {
                    self.activate_into(&p.locator, &mut result);
                }
            }
            None => result.error = ERR_INSTALL_FAILED.to_string(),
        }
        result
    }

    /// Ensure every required dependency (or the subset in `limit`), then
    /// refresh the cached status.
    pub fn ensure_all_ready(&self, limit: &[String]) -> EnsureAllReport {
        let limit: HashSet<String> = limit.iter().map(|s| sanitize_key(s)).collect();
        let results = self
            .get_required_list()
            .into_iter()
            .filter(|r| limit.is_empty() || limit.contains(&r.slug))
            .map(|r| self.ensure_plugin_ready(&r.slug))
            .collect();
        EnsureAllReport {
            results,
            status: self.refresh_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeHost, Kit, Reply};
    use serde_json::json;

    fn resolver(kit: &Kit, host: Arc<FakeHost>) -> Arc<DependencyResolver> {
        let r = Arc::new(DependencyResolver::new(
            kit.api.clone(),
            host,
            kit.store.clone(),
            kit.settings.clone(),
        ));
        r.watch();
        r
    }

    #[test]
    fn sanitize_key_lowercases_and_strips() {
        assert_eq!(sanitize_key("My Plugin!_v2"), "myplugin_v2");
        assert_eq!(sanitize_key("FORMS-pro"), "forms-pro");
    }

    #[test]
    fn required_list_dedups_across_shapes() {
        let kit = Kit::new();
        kit.transport.on(
            "dependencies",
            Reply::json(json!([
                "Forms",
                {"info": {"slug": "forms", "required": true}, "name": "Forms Pro"},
                {"slug": "seo", "name": "SEO", "info": {"required": 1}},
                {"slug": "optional-thing", "info": {"required": false}},
                {"info": {"slug": "GALLERY", "required": "1"}}
            ])),
        );
        let r = resolver(&kit, Arc::new(FakeHost::new()));
        let list = r.get_required_list();
        let slugs: Vec<&str> = list.iter().map(|d| d.slug.as_str()).collect();
        assert_eq!(slugs, vec!["forms", "seo", "gallery"]);
        assert_eq!(list[0].name, "forms");
        assert_eq!(list[2].name, "gallery");
    }

    #[test]
    fn all_ready_flips_when_last_dependency_activates() {
        let kit = Kit::new();
        kit.transport
            .on("dependencies", Reply::json(json!(["alpha", "beta"])));
        let host = Arc::new(FakeHost::new());
        host.add_installed("alpha", true);
        host.add_installed("beta", false);
        let r = resolver(&kit, host.clone());

        let before = r.get_status();
        assert!(!before.all_ready);
        assert!(before.required[1].installed && !before.required[1].active);

        let res = r.ensure_plugin_ready("beta");
        assert!(res.activated && res.error.is_empty());
        // The host event refreshed the cached status.
        assert!(r.get_status().all_ready);
    }

    #[test]
    fn missing_permissions_are_reported_not_raised() {
        let kit = Kit::new();
        kit.transport.on("dependencies", Reply::json(json!(["a", "b"])));
        let host = Arc::new(FakeHost::new().with_permissions(false, false));
        host.add_installed("a", false);
        let r = resolver(&kit, host);

        assert_eq!(r.ensure_plugin_ready("a").error, ERR_NO_PERMISSION_ACTIVATE);
        let b = r.ensure_plugin_ready("b");
        assert_eq!(b.error, ERR_NO_PERMISSION_INSTALL);
        assert!(!b.installed);
    }

    #[test]
    fn install_paths_report_host_outcome() {
        let kit = Kit::new();
        kit.transport.on("dependencies", Reply::json(json!([])));
        let host = Arc::new(FakeHost::new());
        host.add_installable("gallery");
        let r = resolver(&kit, host.clone());

        let ok = r.ensure_plugin_ready("gallery");
        assert!(ok.installed && ok.activated);

        let unknown = r.ensure_plugin_ready("nowhere");
        assert_eq!(unknown.error, ERR_PLUGIN_INFO_FAILED);
    }

    #[test]
    fn ensure_all_respects_limit_and_refreshes() {
        let kit = Kit::new();
        kit.transport
            .on("dependencies", Reply::json(json!(["a", "b", "c"])));
        let host = Arc::new(FakeHost::new());
        host.add_installable("a");
        host.add_installable("b");
        host.add_installable("c");
        let r = resolver(&kit, host);

        let report = r.ensure_all_ready(&["B".to_string(), "zzz".to_string()]);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].slug, "b");
        assert!(!report.status.all_ready);

        let report = r.ensure_all_ready(&[]);
        assert_eq!(report.results.len(), 3);
        assert!(report.status.all_ready);
    }

    #[test]
    fn status_is_cached_for_at_least_a_minute() {
        let kit = Kit::new();
        kit.transport.on("dependencies", Reply::json(json!(["a"])));
        let host = Arc::new(FakeHost::new());
        let r = DependencyResolver::new(kit.api.clone(), host.clone(), kit.store.clone(), kit.settings.clone());
        assert!(!r.get_status().required[0].installed);

        // Without watch(), a host change is invisible until the TTL runs out.
        host.add_installed("a", true);
        assert!(!r.get_status().required[0].installed);
        kit.clock.advance(kit.settings.cache_ttl() as i64);
        assert!(r.get_status().all_ready);
    }
}
