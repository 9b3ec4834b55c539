use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{expiry, is_expired, CacheStore};
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Serialize, Deserialize)]
struct Document {
    key: String,
    expires_at: Option<i64>,
    value: Value,
}

/// One JSON document per key under `dir`. Writes go through a temp file and
/// a rename so readers never see half a document.
pub struct DiskStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DiskStore {
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, clock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(key)))
    }

    fn read_doc(path: &Path) -> Result<Document, StoreError> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn write_doc(&self, key: &str, doc: &Document) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            file_stem(key),
            std::process::id()
        ));
        fs::write(&tmp, serde_json::to_vec(doc)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Entry files, skipping temp files.
    fn entries(&self) -> Vec<PathBuf> {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        rd.filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|x| x == "json").unwrap_or(false)
                    && !p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with('.'))
                        .unwrap_or(true)
            })
            .collect()
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key);
        if !path.is_file() {
            return None;
        }
        match Self::read_doc(&path) {
            Ok(doc) if doc.key == key => {
                if is_expired(doc.expires_at, self.clock.now()) {
                    let _ = fs::remove_file(&path);
                    None
                } else {
                    Some(doc.value)
                }
            }
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("[CACHE] dropping unreadable entry {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &Value, ttl_secs: u64) {
        let doc = Document {
            key: key.to_string(),
            expires_at: expiry(self.clock.now(), ttl_secs),
            value: value.clone(),
        };
        if let Err(e) = self.write_doc(key, &doc) {
            tracing::warn!("[CACHE] write failed for {}: {}", key, e);
        }
    }

    fn delete(&self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }

    fn clear(&self, prefix: &str) -> usize {
        let stem_prefix = file_stem(prefix);
        let mut removed = 0;
        for path in self.entries() {
            let matches = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.starts_with(&stem_prefix))
                .unwrap_or(false);
            if matches && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for path in self.entries() {
            let expired = match Self::read_doc(&path) {
                Ok(doc) => is_expired(doc.expires_at, now),
                Err(_) => true,
            };
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Arc<ManualClock>, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let s = DiskStore::open(dir.path().join("cache"), clock.clone()).unwrap();
        (dir, clock, s)
    }

    #[test]
    fn survives_reopen_and_honours_ttl() {
        let (dir, clock, s) = store();
        s.set("pcat_k", &json!({"a": 1}), 60);
        let reopened = DiskStore::open(dir.path().join("cache"), clock.clone()).unwrap();
        assert_eq!(reopened.get("pcat_k"), Some(json!({"a": 1})));
        clock.advance(60);
        assert_eq!(reopened.get("pcat_k"), None);
        assert!(!s.path_for("pcat_k").exists());
    }

    #[test]
    fn clear_by_prefix_counts_removed_files() {
        let (_dir, _clock, s) = store();
        s.set("pcat_a", &json!(1), 60);
        s.set("pcat_b", &json!(2), 60);
        s.set("keep_c", &json!(3), 60);
        assert_eq!(s.clear("pcat_"), 2);
        assert_eq!(s.get("keep_c"), Some(json!(3)));
    }

    #[test]
    fn corrupt_entry_reads_as_miss() {
        let (_dir, _clock, s) = store();
        fs::write(s.path_for("pcat_bad"), b"{not json").unwrap();
        assert_eq!(s.get("pcat_bad"), None);
        assert_eq!(s.purge_expired(), 0);
    }
}
