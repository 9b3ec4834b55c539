use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use tar::Archive;

use super::{slug_from_locator, CapabilityEvent, InstalledPlugin, PluginHost};
use crate::error::{FetchError, HostError};
use crate::events::EventBus;
use crate::transport::RobustClient;

/// Every installed plugin directory carries this manifest.
pub const MANIFEST: &str = "plugin.json";
const ACTIVE_FILE: &str = "active.json";
const NETWORK_ACTIVE_FILE: &str = "network-active.json";

/// Plugins as sub-directories of `root`. Site activation is a JSON list of
/// locators; network activation is a JSON map of locator to activation time.
pub struct DirectoryHost {
    root: PathBuf,
    http: Option<Arc<RobustClient>>,
    package_base: Option<String>,
    allow_install: bool,
    allow_activate: bool,
    events: EventBus<CapabilityEvent>,
    write_lock: Mutex<()>,
}

fn locator_for(slug: &str) -> String {
    format!("{}/{}", slug, MANIFEST)
}

impl DirectoryHost {
    pub fn open(
        root: impl Into<PathBuf>,
        allow_install: bool,
        allow_activate: bool,
    ) -> Result<Self, HostError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            http: None,
            package_base: None,
            allow_install,
            allow_activate,
            events: EventBus::new(),
            write_lock: Mutex::new(()),
        })
    }

    /// Enable `install` from `{base}/{slug}.tar.gz`.
    pub fn with_packages(mut self, http: Arc<RobustClient>, base: impl Into<String>) -> Self {
        self.http = Some(http);
        self.package_base = Some(base.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_active(&self) -> Result<Vec<String>, HostError> {
        let path = self.root.join(ACTIVE_FILE);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn write_active(&self, list: &[String]) -> Result<(), HostError> {
        fs::write(self.root.join(ACTIVE_FILE), serde_json::to_vec_pretty(list)?)?;
        Ok(())
    }

    fn read_network(&self) -> Result<BTreeMap<String, i64>, HostError> {
        let path = self.root.join(NETWORK_ACTIVE_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn require_installed(&self, locator: &str) -> Result<(), HostError> {
        if self.root.join(locator).is_file() {
            Ok(())
        } else {
            Err(HostError::NotFound(locator.to_string()))
        }
    }

    pub fn deactivate(&self, locator: &str) -> Result<(), HostError> {
        let _g = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut active = self.read_active()?;
        let before = active.len();
        active.retain(|l| l != locator);
        if active.len() != before {
            self.write_active(&active)?;
            drop(_g);
            self.events
                .emit(&CapabilityEvent::Deactivated(locator.to_string()));
        }
        Ok(())
    }

    /// Activate across the whole network.
    pub fn network_activate(&self, locator: &str) -> Result<(), HostError> {
        self.require_installed(locator)?;
        {
            let _g = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut net = self.read_network()?;
            net.insert(locator.to_string(), chrono::Utc::now().timestamp());
            fs::write(
                self.root.join(NETWORK_ACTIVE_FILE),
                serde_json::to_vec_pretty(&net)?,
            )?;
        }
        self.events.emit(&CapabilityEvent::ActiveSetUpdated);
        Ok(())
    }

    pub fn delete(&self, slug: &str) -> Result<(), HostError> {
        let dir = self.root.join(slug);
        if !dir.is_dir() {
            return Err(HostError::NotFound(slug.to_string()));
        }
        self.deactivate(&locator_for(slug))?;
        fs::remove_dir_all(&dir)?;
        self.events.emit(&CapabilityEvent::Deleted(slug.to_string()));
        Ok(())
    }

    /// Unpack a gzipped tarball into `<root>/<slug>`, stripping one top-level
    /// directory. The archive is unpacked beside the target first, so a bad
    /// archive leaves any installed copy in place.
    pub fn install_archive(&self, slug: &str, bytes: &[u8]) -> Result<String, HostError> {
        let dest = self.root.join(slug);
        let staging = self.root.join(format!(".{}.staging", slug));
        let retired = self.root.join(format!(".{}.old", slug));
        let _g = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        let unpacked = extract_stripped(bytes, &staging).and_then(|()| {
            if staging.join(MANIFEST).is_file() {
                Ok(())
            } else {
                Err(HostError::Install(format!(
                    "archive for {} has no {}",
                    slug, MANIFEST
                )))
            }
        });
        if let Err(e) = unpacked {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let upgrade = dest.exists();
        if upgrade {
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            fs::rename(&dest, &retired)?;
        }
        if let Err(e) = fs::rename(&staging, &dest) {
            if upgrade {
                let _ = fs::rename(&retired, &dest);
            }
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        if upgrade {
            let _ = fs::remove_dir_all(&retired);
        }
        drop(_g);

        tracing::info!("[HOST] installed {} into {}", slug, dest.display());
        self.events.emit(&if upgrade {
            CapabilityEvent::UpgradeCompleted
        } else {
            CapabilityEvent::Installed(slug.to_string())
        });
        Ok(locator_for(slug))
    }
}

fn extract_stripped(bytes: &[u8], dest: &Path) -> Result<(), HostError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(HostError::Install(format!(
                "unsafe path in archive: {}",
                path.display()
            )));
        }
        let rel: PathBuf = path.components().skip(1).collect();
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(p) = out.parent() {
                fs::create_dir_all(p)?;
            }
            entry.unpack(&out)?;
        }
    }
    Ok(())
}

impl PluginHost for DirectoryHost {
    fn list_installed(&self) -> Result<Vec<InstalledPlugin>, HostError> {
        let active = self.read_active()?;
        let network = self.read_network()?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            // Dot dirs are install staging areas.
            if name.starts_with('.') {
                continue;
            }
            if !entry.path().join(MANIFEST).is_file() {
                continue;
            }
            let locator = locator_for(&name);
            let is_active = active.contains(&locator) || network.contains_key(&locator);
            out.push(InstalledPlugin {
                slug: slug_from_locator(&locator).to_string(),
                locator,
                active: is_active,
            });
        }
        out.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(out)
    }

    fn install(&self, slug: &str) -> Result<String, HostError> {
        let (Some(http), Some(base)) = (self.http.as_ref(), self.package_base.as_deref()) else {
            return Err(HostError::NotFound(slug.to_string()));
        };
        let url = format!("{}/{}.tar.gz", base.trim_end_matches('/'), slug);
        let resp = http.download(&url).map_err(|e| match e {
            FetchError::Status(404) => HostError::NotFound(slug.to_string()),
            other => HostError::Fetch(other),
        })?;
        self.install_archive(slug, &resp.body)
    }

    fn activate(&self, locator: &str) -> Result<(), HostError> {
        self.require_installed(locator)?;
        {
            let _g = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut active = self.read_active()?;
            if active.iter().any(|l| l == locator) {
                return Ok(());
            }
            active.push(locator.to_string());
            self.write_active(&active)
                .map_err(|e| HostError::Activate(e.to_string()))?;
        }
        self.events
            .emit(&CapabilityEvent::Activated(locator.to_string()));
        Ok(())
    }

    fn can_install(&self) -> bool {
        self.allow_install
    }

    fn can_activate(&self) -> bool {
        self.allow_activate
    }

    fn events(&self) -> &EventBus<CapabilityEvent> {
        &self.events
    }
}
