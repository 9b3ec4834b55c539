//! Plugin host primitives the dependency resolver drives. The host owns the
//! capability event bus; the resolver subscribes to it.

mod directory;

pub use directory::DirectoryHost;

use serde::Serialize;

use crate::error::HostError;
use crate::events::EventBus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledPlugin {
    /// Host-specific handle, `<slug>/<entry>`.
    pub locator: String,
    pub slug: String,
    /// Active on this site or across the network.
    pub active: bool,
}

/// Anything that can change which capabilities are installed or active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityEvent {
    Installed(String),
    Activated(String),
    Deactivated(String),
    Deleted(String),
    UpgradeCompleted,
    ActiveSetUpdated,
}

pub trait PluginHost: Send + Sync {
    fn list_installed(&self) -> Result<Vec<InstalledPlugin>, HostError>;

    /// Fetch and unpack `slug`; returns its locator.
    fn install(&self, slug: &str) -> Result<String, HostError>;

    fn activate(&self, locator: &str) -> Result<(), HostError>;

    fn can_install(&self) -> bool;

    fn can_activate(&self) -> bool;

    fn events(&self) -> &EventBus<CapabilityEvent>;
}

/// First path segment of a locator is the slug.
pub fn slug_from_locator(locator: &str) -> &str {
    locator.split('/').next().unwrap_or(locator)
}
