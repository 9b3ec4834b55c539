//! Outbound HTTP: a blocking ureq agent behind `HttpTransport`, and
//! `RobustClient`, which adds retry with backoff and per-endpoint cooldown.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::cache::{named_key, sha256_hex, CacheStore};
use crate::clock::Clock;
use crate::error::FetchError;

const MAX_IDLE_CONNECTIONS: usize = 16;
const USER_AGENT: &str = concat!("patterns-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<serde_json::Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// One raw request, no retry. Every status code comes back as `Ok`; only
/// connection-level failures are `Err(FetchError::Transport)`.
pub trait HttpTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError>;

    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError>;
}

/// Shared ureq agent, reused for connection pooling.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .max_idle_connections(MAX_IDLE_CONNECTIONS)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }

    fn finish(result: Result<ureq::Response, ureq::Error>) -> Result<HttpResponse, FetchError> {
        let resp = match result {
            Ok(r) => r,
            Err(ureq::Error::Status(_, r)) => r,
            Err(e) => return Err(FetchError::Transport(e.to_string())),
        };
        let status = resp.status();
        let reason = resp.status_text().to_string();
        let content_type = resp.header("Content-Type").map(|s| s.to_string());
        let hint = resp
            .header("Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = Vec::with_capacity(hint.min(8 * 1024 * 1024));
        resp.into_reader()
            .read_to_end(&mut body)
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(HttpResponse {
            status,
            reason,
            content_type,
            body,
        })
    }
}

impl HttpTransport for UreqTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let mut req = self.agent.get(url).timeout(timeout);
        for (k, v) in headers {
            req = req.set(k, v);
        }
        Self::finish(req.call())
    }

    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<HttpResponse, FetchError> {
        let mut req = self.agent.post(url).timeout(timeout);
        for (k, v) in headers {
            req = req.set(k, v);
        }
        Self::finish(req.send_bytes(body))
    }
}

/// Retry and cooldown knobs. Defaults: 3 attempts of 15 s, sleeps of
/// 0.5/1/2 s after each 5xx, 30 s cooldown after a transport failure and
/// 60 s after exhausting retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff: Vec<Duration>,
    pub network_cooldown_secs: u64,
    pub exhausted_cooldown_secs: u64,
    pub post_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(15),
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            network_cooldown_secs: 30,
            exhausted_cooldown_secs: 60,
            post_timeout: Duration::from_secs(20),
            download_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Same shape, no sleeping. For tests and batch tools.
    pub fn without_delays() -> Self {
        Self {
            backoff: Vec::new(),
            ..Self::default()
        }
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        self.backoff
            .get(attempt)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Cooldown marker key: host + path, query excluded.
pub fn cooldown_key(url: &str) -> String {
    let scope = match url::Url::parse(url) {
        Ok(u) => format!("{}{}", u.host_str().unwrap_or_default(), u.path()),
        Err(_) => url.split(&['?', '#'][..]).next().unwrap_or(url).to_string(),
    };
    named_key(&format!("cd_{}", &sha256_hex(&scope)[..32]))
}

pub struct RobustClient {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RobustClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Expiry of an active cooldown for `url`, if any.
    pub fn cooling_until(&self, url: &str) -> Option<i64> {
        let until = self
            .store
            .get(&cooldown_key(url))?
            .get("until")?
            .as_i64()?;
        (self.clock.now() < until).then_some(until)
    }

    fn start_cooldown(&self, key: &str, secs: u64) {
        let until = self.clock.now() + secs as i64;
        self.store.set(key, &json!({ "until": until }), secs);
    }

    /// GET with retry on 5xx and cooldown on persistent failure. 2xx-4xx
    /// responses are returned as-is for the caller to interpret.
    pub fn robust_get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, FetchError> {
        let key = cooldown_key(url);
        if let Some(until) = self.cooling_until(url) {
            tracing::debug!("[HTTP] {} cooling down until {}", url, until);
            return Err(FetchError::RateLimited { until });
        }

        let mut last_status = 0u16;
        for attempt in 0..self.policy.attempts as usize {
            match self.transport.get(url, headers, self.policy.timeout) {
                Err(e @ FetchError::Transport(_)) => {
                    tracing::warn!("[HTTP] GET {} failed: {}", url, e);
                    self.start_cooldown(&key, self.policy.network_cooldown_secs);
                    return Err(e);
                }
                Err(e) => return Err(e),
                Ok(resp) if resp.status >= 500 => {
                    last_status = resp.status;
                    tracing::debug!(
                        "[HTTP] GET {} attempt {} got {}",
                        url,
                        attempt + 1,
                        resp.status
                    );
                    let pause = self.policy.delay_after(attempt);
                    if !pause.is_zero() {
                        std::thread::sleep(pause);
                    }
                }
                Ok(resp) => return Ok(resp),
            }
        }

        tracing::warn!(
            "[HTTP] GET {} exhausted {} attempts, cooling down {}s",
            url,
            self.policy.attempts,
            self.policy.exhausted_cooldown_secs
        );
        self.start_cooldown(&key, self.policy.exhausted_cooldown_secs);
        Err(FetchError::BackoffExhausted {
            attempts: self.policy.attempts,
            status: last_status,
        })
    }

    /// Single GET, no retry or cooldown. For diagnostics.
    pub fn get_once(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, FetchError> {
        self.transport.get(url, headers, self.policy.timeout)
    }

    /// POST a JSON body once with the longer write timeout.
    pub fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, FetchError> {
        let bytes = serde_json::to_vec(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        let mut all: Vec<(&str, &str)> = Vec::with_capacity(headers.len() + 1);
        all.push(("Content-Type", "application/json"));
        all.extend_from_slice(headers);
        self.transport
            .post(url, &all, &bytes, self.policy.post_timeout)
    }

    /// Fetch a binary asset. Non-2xx is an error.
    pub fn download(&self, url: &str) -> Result<HttpResponse, FetchError> {
        let resp = self
            .transport
            .get(url, &[], self.policy.download_timeout)?;
        if !resp.is_success() {
            return Err(FetchError::Status(resp.status));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    /// Replays canned results in order; repeats the last one.
    struct Scripted {
        script: Mutex<Vec<Result<u16, FetchError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<u16, FetchError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn next(&self, url: &str) -> Result<HttpResponse, FetchError> {
            self.calls.lock().unwrap().push(url.to_string());
            let mut s = self.script.lock().unwrap();
            let r = if s.len() > 1 { s.remove(0) } else { s[0].clone() };
            r.map(|status| HttpResponse {
                status,
                reason: String::new(),
                content_type: None,
                body: b"[]".to_vec(),
            })
        }
    }

    impl HttpTransport for Scripted {
        fn get(&self, url: &str, _: &[(&str, &str)], _: Duration) -> Result<HttpResponse, FetchError> {
            self.next(url)
        }

        fn post(
            &self,
            url: &str,
            _: &[(&str, &str)],
            _: &[u8],
            _: Duration,
        ) -> Result<HttpResponse, FetchError> {
            self.next(url)
        }
    }

    fn client(script: Vec<Result<u16, FetchError>>) -> (Arc<Scripted>, Arc<ManualClock>, RobustClient) {
        let t = Arc::new(Scripted::new(script));
        let clock = Arc::new(ManualClock::new(50_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let c = RobustClient::new(t.clone(), store, clock.clone(), RetryPolicy::without_delays());
        (t, clock, c)
    }

    #[test]
    fn three_server_errors_then_cooldown_blocks_calls() {
        let (t, clock, c) = client(vec![Ok(503)]);
        let url = "https://api.test/v1/patterns?page=1";
        let err = c.robust_get(url, &[]).unwrap_err();
        assert_eq!(err, FetchError::BackoffExhausted { attempts: 3, status: 503 });
        assert_eq!(t.calls(), 3);

        // Different query, same host+path: still cooling.
        let err = c.robust_get("https://api.test/v1/patterns?page=2", &[]).unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert_eq!(t.calls(), 3);

        clock.advance(60);
        let _ = c.robust_get(url, &[]);
        assert_eq!(t.calls(), 6);
    }

    #[test]
    fn transport_failure_is_not_retried() {
        let (t, clock, c) = client(vec![Err(FetchError::Transport("refused".into()))]);
        let url = "https://api.test/v1/categories";
        assert!(matches!(c.robust_get(url, &[]), Err(FetchError::Transport(_))));
        assert_eq!(t.calls(), 1);
        assert!(c.cooling_until(url).is_some());
        clock.advance(30);
        assert!(c.cooling_until(url).is_none());
    }

    #[test]
    fn client_errors_return_immediately() {
        let (t, _clock, c) = client(vec![Ok(404)]);
        let resp = c.robust_get("https://api.test/v1/patterns/9", &[]).unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(t.calls(), 1);
    }

    #[test]
    fn recovers_when_server_comes_back() {
        let (t, _clock, c) = client(vec![Ok(502), Ok(200)]);
        let resp = c.robust_get("https://api.test/v1/types", &[]).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(t.calls(), 2);
    }

    #[test]
    fn cooldown_scope_ignores_query() {
        assert_eq!(
            cooldown_key("https://h.test/a/b?x=1"),
            cooldown_key("https://h.test/a/b?x=2")
        );
        assert_ne!(
            cooldown_key("https://h.test/a/b"),
            cooldown_key("https://h.test/a/c")
        );
    }

    #[test]
    fn download_rejects_non_success() {
        let (_t, _clock, c) = client(vec![Ok(404)]);
        assert_eq!(
            c.download("https://cdn.test/x.png").unwrap_err(),
            FetchError::Status(404)
        );
    }
}
