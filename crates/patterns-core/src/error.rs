//! Error types for the core. Domain reads swallow these into empty results;
//! mutating operations and diagnostics surface them.

use thiserror::Error;

/// Failure of one outbound request after the retry/cooldown policy ran.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// DNS, connect, TLS or timeout. Never retried; starts a short cooldown.
    #[error("transport error: {0}")]
    Transport(String),

    /// Host+path is cooling down; no request was made.
    #[error("rate limited until {until}")]
    RateLimited { until: i64 },

    /// Every attempt came back 5xx.
    #[error("backoff exhausted after {attempts} attempts (last HTTP {status})")]
    BackoffExhausted { attempts: u32, status: u16 },

    /// Non-success status where one was required (downloads, import).
    #[error("HTTP {0}")]
    Status(u16),

    /// Body was not the JSON we expected.
    #[error("undecodable response: {0}")]
    Decode(String),
}

/// Cache store I/O failures. Stores log and swallow these on the read path.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures of the plugin host primitives.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin not found: {0}")]
    NotFound(String),
    #[error("install failed: {0}")]
    Install(String),
    #[error("activation failed: {0}")]
    Activate(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("host io: {0}")]
    Io(#[from] std::io::Error),
    #[error("host state: {0}")]
    State(#[from] serde_json::Error),
}

/// Failures while storing a sideloaded file.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("media io: {0}")]
    Io(#[from] std::io::Error),
    #[error("media index: {0}")]
    Index(#[from] serde_json::Error),
    #[error("not a downloadable url: {0}")]
    BadUrl(String),
    #[error("Empty content provided")]
    EmptyContent,
}

/// Top-level error for operations that are allowed to fail.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Remote kept returning full pages past the safety cap.
    #[error("pagination aborted after {pages} full pages")]
    PaginationLimit { pages: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
