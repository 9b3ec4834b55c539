//! Per-user favorite pattern ids in one JSON document.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavoriteAction {
    #[default]
    Add,
    Remove,
}

pub struct FavoritesStore {
    path: PathBuf,
    data: Mutex<BTreeMap<String, Vec<u64>>>,
}

impl FavoritesStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.is_file() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn get(&self, user: &str) -> Vec<u64> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add(&self, user: &str, id: u64) -> Result<Vec<u64>, StoreError> {
        self.update(user, FavoriteAction::Add, id)
    }

    pub fn remove(&self, user: &str, id: u64) -> Result<Vec<u64>, StoreError> {
        self.update(user, FavoriteAction::Remove, id)
    }

    /// Apply one action and persist. Returns the user's list afterwards.
    pub fn update(&self, user: &str, action: FavoriteAction, id: u64) -> Result<Vec<u64>, StoreError> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let list = data.entry(user.to_string()).or_default();
        let changed = match action {
            FavoriteAction::Add if !list.contains(&id) => {
                list.push(id);
                true
            }
            FavoriteAction::Add => false,
            FavoriteAction::Remove => {
                let before = list.len();
                list.retain(|x| *x != id);
                list.len() != before
            }
        };
        let out = list.clone();
        if changed {
            self.persist(&data)?;
        }
        Ok(out)
    }

    fn persist(&self, data: &BTreeMap<String, Vec<u64>>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Merge a client-side list into the server list: server order first, then
/// anything only the client had.
pub fn reconcile(server: &[u64], client: &[u64]) -> Vec<u64> {
    let mut out = server.to_vec();
    for id in client {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_and_order_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = FavoritesStore::open(dir.path().join("favorites.json")).unwrap();
        store.add("alice", 5).unwrap();
        store.add("alice", 3).unwrap();
        assert_eq!(store.add("alice", 5).unwrap(), vec![5, 3]);
        assert_eq!(store.remove("alice", 42).unwrap(), vec![5, 3]);
        assert_eq!(store.remove("alice", 5).unwrap(), vec![3]);
        assert!(store.get("bob").is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/favorites.json");
        {
            let store = FavoritesStore::open(&path).unwrap();
            store.add("alice", 9).unwrap();
            store.add("bob", 1).unwrap();
        }
        let store = FavoritesStore::open(&path).unwrap();
        assert_eq!(store.get("alice"), vec![9]);
        assert_eq!(store.get("bob"), vec![1]);
    }

    #[test]
    fn reconcile_is_a_server_first_union() {
        assert_eq!(reconcile(&[3, 1], &[1, 7, 3, 8]), vec![3, 1, 7, 8]);
        assert_eq!(reconcile(&[], &[2]), vec![2]);
    }

    #[test]
    fn action_parses_lowercase() {
        let a: FavoriteAction = serde_json::from_str("\"remove\"").unwrap();
        assert_eq!(a, FavoriteAction::Remove);
    }
}
