//! Settings from .patternsrc (project dir, then home), overridden by
//! PATTERNS_* env vars and then CLI flags. A `SettingsHandle` owns the live
//! copy and tells subscribers what changed.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::events::EventBus;

pub const RC_FILE: &str = ".patternsrc";
pub const DEFAULT_CACHE_TTL: u64 = 900;
pub const MIN_CACHE_TTL: u64 = 60;
pub const DEFAULT_MAX_REGISTER: usize = 200;
pub const DEFAULT_SITE_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
/// Catalog path under the site root when no api_base is configured.
pub const DEFAULT_API_PATH: &str = "wp-json/patterns/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    #[default]
    Disk,
}

impl CacheBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Some(CacheBackend::Memory),
            "disk" | "file" => Some(CacheBackend::Disk),
            _ => None,
        }
    }
}

/// Proxy caller roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Edit,
    Admin,
}

/// One bearer token accepted by the local proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyUser {
    pub token: String,
    pub user: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Remote catalog base. `None` means derive from `site_url`.
    pub api_base: Option<String>,
    pub cache_ttl: u64,
    pub max_register: usize,
    /// Bearer token sent to the remote catalog.
    pub auth_token: Option<String>,
    /// Public root of this site; media is rehosted under it.
    pub site_url: String,
    pub data_dir: PathBuf,
    pub cache_backend: CacheBackend,
    /// Where plugin archives (`{slug}.tar.gz`) are downloaded from.
    pub package_base: Option<String>,
    pub plugins_dir: Option<PathBuf>,
    pub allow_install: bool,
    pub allow_activate: bool,
    pub bind: String,
    pub users: Vec<ProxyUser>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: None,
            cache_ttl: DEFAULT_CACHE_TTL,
            max_register: DEFAULT_MAX_REGISTER,
            auth_token: None,
            site_url: DEFAULT_SITE_URL.to_string(),
            data_dir: default_data_dir(),
            cache_backend: CacheBackend::default(),
            package_base: None,
            plugins_dir: None,
            allow_install: false,
            allow_activate: true,
            bind: DEFAULT_BIND.to_string(),
            users: Vec::new(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patterns-proxy")
}

impl Settings {
    /// Catalog base URL with exactly one trailing separator.
    pub fn effective_api_base(&self) -> String {
        let base = match self.api_base.as_deref() {
            Some(b) if !b.trim().is_empty() => b.trim().to_string(),
            _ => format!(
                "{}/{}",
                self.site_url.trim_end_matches('/'),
                DEFAULT_API_PATH
            ),
        };
        format!("{}/", base.trim_end_matches('/'))
    }

    /// Host of `site_url`, lowercased. Used to tell local media from remote.
    pub fn site_host(&self) -> Option<String> {
        url::Url::parse(&self.site_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn favorites_path(&self) -> PathBuf {
        self.data_dir.join("favorites.json")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("plugins"))
    }

    pub fn user_for_token(&self, token: &str) -> Option<&ProxyUser> {
        if token.is_empty() {
            return None;
        }
        self.users.iter().find(|u| u.token == token)
    }

    /// Merge one rc document. Unknown keys are ignored.
    pub fn apply_json(&mut self, v: &Value) {
        if let Some(s) = v.get("apiBase").and_then(|x| x.as_str()) {
            self.api_base = Some(s.to_string());
        }
        if let Some(n) = v.get("cacheTtl").and_then(|x| x.as_u64()) {
            self.cache_ttl = n;
        }
        if let Some(n) = v.get("maxRegister").and_then(|x| x.as_u64()) {
            self.max_register = n as usize;
        }
        if let Some(s) = v.get("authToken").and_then(|x| x.as_str()) {
            self.auth_token = Some(s.to_string());
        }
        if let Some(s) = v.get("siteUrl").and_then(|x| x.as_str()) {
            self.site_url = s.to_string();
        }
        if let Some(s) = v.get("dataDir").and_then(|x| x.as_str()) {
            self.data_dir = PathBuf::from(s);
        }
        if let Some(b) = v
            .get("cacheBackend")
            .and_then(|x| x.as_str())
            .and_then(CacheBackend::parse)
        {
            self.cache_backend = b;
        }
        if let Some(s) = v.get("packageBase").and_then(|x| x.as_str()) {
            self.package_base = Some(s.to_string());
        }
        if let Some(s) = v.get("pluginsDir").and_then(|x| x.as_str()) {
            self.plugins_dir = Some(PathBuf::from(s));
        }
        if let Some(b) = v.get("allowInstall").and_then(|x| x.as_bool()) {
            self.allow_install = b;
        }
        if let Some(b) = v.get("allowActivate").and_then(|x| x.as_bool()) {
            self.allow_activate = b;
        }
        if let Some(s) = v.get("bind").and_then(|x| x.as_str()) {
            self.bind = s.to_string();
        }
        if let Some(users) = v.get("users") {
            match serde_json::from_value::<Vec<ProxyUser>>(users.clone()) {
                Ok(u) => self.users = u,
                Err(e) => tracing::warn!("[CONFIG] ignoring malformed users list: {}", e),
            }
        }
    }

    /// Apply PATTERNS_* overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PATTERNS_API_BASE") {
            self.api_base = Some(v);
        }
        if let Some(v) = lookup("PATTERNS_AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(n) = lookup("PATTERNS_CACHE_TTL").and_then(|v| v.trim().parse().ok()) {
            self.cache_ttl = n;
        }
        if let Some(n) = lookup("PATTERNS_MAX_REGISTER").and_then(|v| v.trim().parse().ok()) {
            self.max_register = n;
        }
        if let Some(v) = lookup("PATTERNS_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PATTERNS_SITE_URL") {
            self.site_url = v;
        }
        if let Some(b) = lookup("PATTERNS_CACHE_BACKEND").and_then(|v| CacheBackend::parse(&v)) {
            self.cache_backend = b;
        }
        if let Some(v) = lookup("PATTERNS_BIND") {
            self.bind = v;
        }
    }

    /// Clamp and clean values coming from any source.
    pub fn normalize(&mut self) {
        self.cache_ttl = self.cache_ttl.max(MIN_CACHE_TTL);
        self.api_base = self
            .api_base
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.auth_token = self
            .auth_token
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let trimmed = self.site_url.trim().trim_end_matches('/').to_string();
        self.site_url = if trimmed.is_empty() {
            DEFAULT_SITE_URL.to_string()
        } else {
            trimmed
        };
    }

    /// JSON view for `config show`. Secrets are masked.
    pub fn redacted(&self) -> Value {
        serde_json::json!({
            "apiBase": self.effective_api_base(),
            "cacheTtl": self.cache_ttl,
            "maxRegister": self.max_register,
            "authToken": self.auth_token.as_ref().map(|_| "********"),
            "siteUrl": self.site_url,
            "dataDir": self.data_dir.display().to_string(),
            "cacheBackend": self.cache_backend,
            "packageBase": self.package_base,
            "pluginsDir": self.plugins_dir().display().to_string(),
            "allowInstall": self.allow_install,
            "allowActivate": self.allow_activate,
            "bind": self.bind,
            "users": self.users.iter().map(|u| serde_json::json!({"user": u.user, "role": u.role})).collect::<Vec<_>>(),
        })
    }
}

fn home_dir() -> Option<PathBuf> {
    dirs::home_dir()
}

fn rc_candidates(dir: &Path) -> Vec<PathBuf> {
    let mut out = vec![dir.join(RC_FILE)];
    if let Some(h) = home_dir() {
        out.push(h.join(RC_FILE));
    }
    out
}

/// Load settings: defaults, then the first rc file found, then env.
/// Missing or invalid rc file = defaults.
pub fn load_settings(dir: &Path) -> Settings {
    let mut s = Settings::default();
    for path in rc_candidates(dir) {
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        {
            Some(v) => s.apply_json(&v),
            None => tracing::warn!("[CONFIG] ignoring unreadable {}", path.display()),
        }
        break;
    }
    s.apply_env_with(|k| std::env::var(k).ok());
    s.normalize();
    s
}

/// Persist one key into the project rc file, keeping the other keys.
pub fn save_setting(dir: &Path, key: &str, raw: &str) -> Result<(), CoreError> {
    let path = dir.join(RC_FILE);
    let mut doc = match std::fs::read_to_string(&path) {
        Ok(s) => serde_json::from_str::<Value>(&s).unwrap_or_else(|_| Value::Object(Default::default())),
        Err(_) => Value::Object(Default::default()),
    };
    let value = match key {
        "cacheTtl" | "maxRegister" => raw
            .trim()
            .parse::<u64>()
            .map(Value::from)
            .map_err(|_| CoreError::Config(format!("{} expects a number, got {:?}", key, raw)))?,
        "allowInstall" | "allowActivate" => match raw.trim() {
            "1" | "true" | "yes" => Value::Bool(true),
            "0" | "false" | "no" => Value::Bool(false),
            _ => return Err(CoreError::Config(format!("{} expects true/false", key))),
        },
        "apiBase" | "authToken" | "siteUrl" | "dataDir" | "cacheBackend" | "packageBase"
        | "pluginsDir" | "bind" => Value::String(raw.to_string()),
        _ => return Err(CoreError::Config(format!("unknown setting {:?}", key))),
    };
    if let Value::Object(map) = &mut doc {
        map.insert(key.to_string(), value);
    }
    let body = serde_json::to_string_pretty(&doc).map_err(|e| CoreError::Config(e.to_string()))?;
    std::fs::write(&path, body)?;
    Ok(())
}

/// What changed in an update. Endpoint and identity changes invalidate the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsChange {
    ApiBase,
    AuthToken,
    CacheTtl { old: u64, new: u64 },
    MaxRegister,
}

/// Live settings shared by the client, resolver and scheduler.
pub struct SettingsHandle {
    inner: RwLock<Settings>,
    bus: EventBus<SettingsChange>,
}

impl SettingsHandle {
    pub fn new(mut settings: Settings) -> Self {
        settings.normalize();
        Self {
            inner: RwLock::new(settings),
            bus: EventBus::new(),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.read(|s| s.clone())
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn cache_ttl(&self) -> u64 {
        self.read(|s| s.cache_ttl)
    }

    pub fn api_base(&self) -> String {
        self.read(|s| s.effective_api_base())
    }

    pub fn auth_token(&self) -> Option<String> {
        self.read(|s| s.auth_token.clone())
    }

    pub fn max_register(&self) -> usize {
        self.read(|s| s.max_register)
    }

    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&SettingsChange) + Send + Sync + 'static,
    {
        self.bus.subscribe(f);
    }

    /// Mutate, normalize, then notify subscribers of each effective change.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Vec<SettingsChange> {
        let changes = {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let before = guard.clone();
            f(&mut guard);
            guard.normalize();
            let mut changes = Vec::new();
            if before.effective_api_base() != guard.effective_api_base() {
                changes.push(SettingsChange::ApiBase);
            }
            if before.auth_token != guard.auth_token {
                changes.push(SettingsChange::AuthToken);
            }
            if before.cache_ttl != guard.cache_ttl {
                changes.push(SettingsChange::CacheTtl {
                    old: before.cache_ttl,
                    new: guard.cache_ttl,
                });
            }
            if before.max_register != guard.max_register {
                changes.push(SettingsChange::MaxRegister);
            }
            changes
        };
        for c in &changes {
            tracing::info!("[CONFIG] setting changed: {:?}", c);
            self.bus.emit(c);
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn rc_file_in_project_dir_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(RC_FILE),
            r#"{"apiBase":"https://catalog.example.com/api/v1","cacheTtl":1200,"maxRegister":50}"#,
        )
        .unwrap();
        let s = load_settings(dir.path());
        assert!(s.effective_api_base().starts_with("https://catalog.example.com/api/v1"));
        assert_eq!(s.max_register, 50);
    }

    #[test]
    fn api_base_gets_exactly_one_trailing_separator() {
        let mut s = Settings {
            api_base: Some("https://x.test/api///".into()),
            ..Settings::default()
        };
        assert_eq!(s.effective_api_base(), "https://x.test/api/");
        s.api_base = None;
        s.site_url = "https://site.test/".into();
        assert_eq!(
            s.effective_api_base(),
            "https://site.test/wp-json/patterns/v1/"
        );
    }

    #[test]
    fn cache_ttl_floor_is_enforced() {
        let mut s = Settings {
            cache_ttl: 5,
            ..Settings::default()
        };
        s.normalize();
        assert_eq!(s.cache_ttl, MIN_CACHE_TTL);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut s = Settings::default();
        s.apply_json(&serde_json::json!({"cacheTtl": 300, "authToken": "file"}));
        s.apply_env_with(|k| match k {
            "PATTERNS_CACHE_TTL" => Some("600".into()),
            "PATTERNS_AUTH_TOKEN" => Some("env".into()),
            _ => None,
        });
        assert_eq!(s.cache_ttl, 600);
        assert_eq!(s.auth_token.as_deref(), Some("env"));
    }

    #[test]
    fn save_setting_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        save_setting(dir.path(), "maxRegister", "40").unwrap();
        save_setting(dir.path(), "apiBase", "https://a.test/v1").unwrap();
        let raw = std::fs::read_to_string(dir.path().join(RC_FILE)).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["maxRegister"], 40);
        assert_eq!(v["apiBase"], "https://a.test/v1");
        assert!(save_setting(dir.path(), "cacheTtl", "soon").is_err());
        assert!(save_setting(dir.path(), "nope", "1").is_err());
    }

    #[test]
    fn update_reports_only_real_changes() {
        let handle = SettingsHandle::new(Settings::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s2 = Arc::clone(&seen);
        handle.subscribe(move |c| s2.lock().unwrap().push(c.clone()));

        let none = handle.update(|s| s.cache_ttl = DEFAULT_CACHE_TTL);
        assert!(none.is_empty());

        let changes = handle.update(|s| {
            s.auth_token = Some("t".into());
            s.cache_ttl = 10;
        });
        assert_eq!(
            changes,
            vec![
                SettingsChange::AuthToken,
                SettingsChange::CacheTtl {
                    old: DEFAULT_CACHE_TTL,
                    new: MIN_CACHE_TTL
                }
            ]
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn token_lookup_ignores_empty() {
        let s = Settings {
            users: vec![ProxyUser {
                token: "abc".into(),
                user: "ed".into(),
                role: Role::Edit,
            }],
            ..Settings::default()
        };
        assert_eq!(s.user_for_token("abc").map(|u| u.role), Some(Role::Edit));
        assert!(s.user_for_token("").is_none());
        assert!(s.user_for_token("zzz").is_none());
    }
}
