//! Media sideload: find remote media in pattern HTML, rehost the images
//! locally and rewrite the markup to point at the local copies. Videos are
//! reported but left alone.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::SettingsHandle;
use crate::error::MediaError;
use crate::transport::RobustClient;

const INDEX_FILE: &str = ".index.json";
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp", "ico"];
const VIDEO_EXTS: &[&str] = &["mp4", "webm", "ogg", "mov", "avi", "wmv", "flv"];
/// Extensions recognised in `data-*` attributes. Matched case-sensitively.
const DATA_ATTR_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "mp4", "webm", "ogg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

fn is_quote(b: u8) -> bool {
    b == b'"' || b == b'\''
}

/// Quoted value starting at `at` (which must be a quote). Returns the value
/// and the index just past the closing quote.
fn quoted_at(content: &str, at: usize) -> Option<(&str, usize)> {
    let bytes = content.as_bytes();
    if !bytes.get(at).copied().map(is_quote).unwrap_or(false) {
        return None;
    }
    let start = at + 1;
    let len = bytes[start..].iter().position(|b| is_quote(*b))?;
    if len == 0 {
        return None;
    }
    Some((&content[start..start + len], start + len + 1))
}

/// `<tag ... attr="value"`. The last `attr=` inside the tag wins, like a
/// greedy scan would pick.
fn tag_attr_values<'a>(content: &'a str, tag: &str, attr: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let needle = format!("{}=", attr);
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(rel) = content[from..].find(&open) {
        let body = from + rel + open.len();
        let end = content[body..].find('>').map(|i| body + i).unwrap_or(content.len());
        let head = &content[body..end];
        let mut hit = None;
        let mut search_end = head.len();
        while let Some(pos) = head[..search_end].rfind(&needle) {
            if pos == 0 {
                break;
            }
            if let Some(found) = quoted_at(content, body + pos + needle.len()) {
                hit = Some(found);
                break;
            }
            search_end = pos;
        }
        match hit {
            Some((value, next)) => {
                out.push(value);
                from = next;
            }
            None => from = body,
        }
    }
    out
}

/// `background-image: url(...)`, quotes optional, case-insensitive.
fn background_urls(content: &str) -> Vec<&str> {
    const PROP: &str = "background-image:";
    let lower = content.to_ascii_lowercase();
    let bytes = content.as_bytes();
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(rel) = lower[from..].find(PROP) {
        let mut i = from + rel + PROP.len();
        from = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if !lower[i..].starts_with("url(") {
            continue;
        }
        i += 4;
        if i < bytes.len() && is_quote(bytes[i]) {
            i += 1;
        }
        let start = i;
        while i < bytes.len()
            && !is_quote(bytes[i])
            && bytes[i] != b')'
            && !bytes[i].is_ascii_whitespace()
        {
            i += 1;
        }
        if i == start {
            continue;
        }
        let end = i;
        if i < bytes.len() && is_quote(bytes[i]) {
            i += 1;
        }
        if bytes.get(i) == Some(&b')') {
            out.push(&content[start..end]);
            from = i + 1;
        }
    }
    out
}

/// `data-foo="....png"` for the media extensions, lowercase only.
fn data_attr_urls(content: &str) -> Vec<&str> {
    let bytes = content.as_bytes();
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(rel) = content[from..].find("data-") {
        let name_start = from + rel + 5;
        from = from + rel + 1;
        let mut i = name_start;
        while i < bytes.len() && (bytes[i].is_ascii_lowercase() || bytes[i] == b'-') {
            i += 1;
        }
        if i == name_start || bytes.get(i) != Some(&b'=') {
            continue;
        }
        let Some((value, next)) = quoted_at(content, i + 1) else {
            continue;
        };
        let media = DATA_ATTR_EXTS.iter().any(|ext| {
            value.len() > ext.len() + 1
                && value.ends_with(ext)
                && value.as_bytes()[value.len() - ext.len() - 1] == b'.'
        });
        if media {
            out.push(value);
            from = next;
        }
    }
    out
}

/// Every media URL referenced by the markup, in discovery order: img src,
/// video poster, source src, CSS backgrounds, then data attributes.
/// Trimmed, blanks dropped, duplicates removed.
pub fn extract_media_urls(content: &str) -> Vec<String> {
    let groups = [
        tag_attr_values(content, "img", "src"),
        tag_attr_values(content, "video", "poster"),
        tag_attr_values(content, "source", "src"),
        background_urls(content),
        data_attr_urls(content),
    ];
    let mut seen = HashSet::new();
    groups
        .iter()
        .flatten()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .filter(|u| seen.insert(u.to_string()))
        .map(str::to_string)
        .collect()
}

/// Absolute URLs whose host is not ours.
pub fn filter_external(urls: &[String], site_host: Option<&str>) -> Vec<String> {
    urls.iter()
        .filter(|raw| match url::Url::parse(raw) {
            Ok(u) => match u.host_str() {
                Some(host) => Some(host) != site_host,
                None => false,
            },
            Err(_) => false,
        })
        .cloned()
        .collect()
}

fn path_of(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| u.path().to_string())
        .unwrap_or_default()
}

fn extension(raw: &str) -> String {
    let path = path_of(raw);
    let base = path.rsplit('/').next().unwrap_or("");
    match base.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

pub fn classify(raw: &str) -> MediaKind {
    let ext = extension(raw);
    if IMAGE_EXTS.contains(&ext.as_str()) {
        MediaKind::Image
    } else if VIDEO_EXTS.contains(&ext.as_str()) {
        MediaKind::Video
    } else {
        MediaKind::Other
    }
}

/// Last segment of the URL path; the file name a download is stored under.
pub fn file_name_for(raw: &str) -> String {
    path_of(raw).rsplit('/').next().unwrap_or("").to_string()
}

/// Replace longer URLs first so one that prefixes another cannot clobber it.
pub fn rewrite_longest_first(content: &str, url_map: &BTreeMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = url_map.iter().collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    pairs
        .into_iter()
        .fold(content.to_string(), |acc, (old, new)| acc.replace(old.as_str(), new))
}

/// Where sideloaded files end up.
pub trait MediaLibrary: Send + Sync {
    /// Local URLs of files already stored for these originals.
    fn find_by_original_urls(&self, urls: &[String]) -> BTreeMap<String, String>;

    /// Store `bytes` and remember `original`. Returns the local URL.
    fn store(&self, original: &str, file_name: &str, bytes: &[u8]) -> Result<String, MediaError>;
}

/// Files in a directory served at `base_url`, with a JSON index of
/// original URL to stored file name.
pub struct DiskMediaLibrary {
    dir: PathBuf,
    base_url: String,
    lock: Mutex<()>,
}

impl DiskMediaLibrary {
    pub fn open(dir: impl Into<PathBuf>, base_url: &str) -> Result<Self, MediaError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_index(&self) -> Result<BTreeMap<String, String>, MediaError> {
        let path = self.dir.join(INDEX_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// `name`, or `stem-1.ext`, `stem-2.ext`... whichever is free.
    fn free_name(&self, name: &str) -> String {
        let clean: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let clean = clean.trim_start_matches('.');
        let clean = if clean.is_empty() { "file" } else { clean };
        if !self.dir.join(clean).exists() {
            return clean.to_string();
        }
        let (stem, ext) = match clean.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s, format!(".{}", e)),
            _ => (clean, String::new()),
        };
        let mut n = 1;
        loop {
            let candidate = format!("{}-{}{}", stem, n, ext);
            if !self.dir.join(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

impl MediaLibrary for DiskMediaLibrary {
    fn find_by_original_urls(&self, urls: &[String]) -> BTreeMap<String, String> {
        if urls.is_empty() {
            return BTreeMap::new();
        }
        let index = match self.read_index() {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("[MEDIA] unreadable index: {}", e);
                return BTreeMap::new();
            }
        };
        urls.iter()
            .filter_map(|u| {
                let name = index.get(u)?;
                self.dir
                    .join(name)
                    .is_file()
                    .then(|| (u.clone(), self.url_for(name)))
            })
            .collect()
    }

    fn store(&self, original: &str, file_name: &str, bytes: &[u8]) -> Result<String, MediaError> {
        let _g = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let name = self.free_name(file_name);
        fs::write(self.dir.join(&name), bytes)?;
        let mut index = self.read_index()?;
        index.insert(original.to_string(), name.clone());
        fs::write(self.dir.join(INDEX_FILE), serde_json::to_vec_pretty(&index)?)?;
        Ok(self.url_for(&name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SideloadStats {
    pub total: usize,
    pub images: usize,
    pub videos: usize,
    pub downloaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SideloadReport {
    pub success: bool,
    pub content: String,
    pub stats: SideloadStats,
    pub url_map: BTreeMap<String, String>,
    pub failed_urls: Vec<String>,
    pub video_urls: Vec<String>,
}

pub struct Sideloader {
    http: Arc<RobustClient>,
    library: Arc<dyn MediaLibrary>,
    settings: Arc<SettingsHandle>,
}

impl Sideloader {
    pub fn new(
        http: Arc<RobustClient>,
        library: Arc<dyn MediaLibrary>,
        settings: Arc<SettingsHandle>,
    ) -> Self {
        Self {
            http,
            library,
            settings,
        }
    }

    fn download_and_store(&self, url: &str) -> Result<String, MediaError> {
        let name = file_name_for(url);
        if name.is_empty() {
            return Err(MediaError::BadUrl(url.to_string()));
        }
        let resp = self.http.download(url)?;
        self.library.store(url, &name, &resp.body)
    }

    pub fn sideload(&self, content: &str) -> Result<SideloadReport, MediaError> {
        if content.is_empty() {
            return Err(MediaError::EmptyContent);
        }
        let site_host = self.settings.read(|s| s.site_host());
        let external = filter_external(&extract_media_urls(content), site_host.as_deref());
        let images: Vec<String> = external
            .iter()
            .filter(|u| classify(u) == MediaKind::Image)
            .cloned()
            .collect();
        let videos: Vec<String> = external
            .iter()
            .filter(|u| classify(u) == MediaKind::Video)
            .cloned()
            .collect();

        let existing = self.library.find_by_original_urls(&images);
        let mut url_map = BTreeMap::new();
        let mut failed = Vec::new();
        for url in &images {
            if let Some(local) = existing.get(url) {
                url_map.insert(url.clone(), local.clone());
                continue;
            }
            match self.download_and_store(url) {
                Ok(local) => {
                    url_map.insert(url.clone(), local);
                }
                Err(e) => {
                    tracing::warn!("[MEDIA] {} not sideloaded: {}", url, e);
                    failed.push(url.clone());
                }
            }
        }

        tracing::info!(
            "[MEDIA] {} external, {} rehosted, {} failed, {} videos skipped",
            external.len(),
            url_map.len(),
            failed.len(),
            videos.len()
        );
        Ok(SideloadReport {
            success: true,
            content: rewrite_longest_first(content, &url_map),
            stats: SideloadStats {
                total: external.len(),
                images: images.len(),
                videos: videos.len(),
                downloaded: url_map.len(),
                failed: failed.len(),
                skipped: videos.len(),
            },
            url_map,
            failed_urls: failed,
            video_urls: videos,
        })
    }
}
