//! Public-key resolution with a bounded, etag-revalidating cache.
//!
//! Principals may pin their acceptable keys behind an `https://` URL (a
//! `USER.keys`-style endpoint). Results are cached per URL: 60 s for
//! non-empty lists, 15 s for empty ones, so both hot paths and failing
//! endpoints are rate-limited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

/// How long a non-empty key list stays fresh.
pub const KEY_FRESH_TTL: Duration = Duration::from_secs(60);
/// How long an empty (or failed) result stays fresh.
pub const KEY_EMPTY_TTL: Duration = Duration::from_secs(15);
/// Per-fetch deadline.
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Response bodies are read up to this many bytes and truncated beyond.
const KEY_BODY_LIMIT: usize = 4 << 10;
/// Cache size above which a sweep of stale entries runs.
const KEY_CACHE_SWEEP_AT: usize = 50;

/// Injectable time source, fixed per server instance.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Anything that can turn a key URL into authorized-keys lines. The matcher
/// depends on this seam rather than on the HTTP-backed directory directly.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    lines: Vec<String>,
    etag: Option<String>,
    at: DateTime<Utc>,
}

impl CacheEntry {
    fn max_age(&self) -> Duration {
        if self.lines.is_empty() {
            KEY_EMPTY_TTL
        } else {
            KEY_FRESH_TTL
        }
    }

    fn fresh_at(&self, now: DateTime<Utc>) -> bool {
        now - self.at < chrono::Duration::from_std(self.max_age()).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// HTTPS-backed key list cache.
pub struct KeyDirectory {
    http: reqwest::Client,
    clock: Clock,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl KeyDirectory {
    pub fn new(http: reqwest::Client, clock: Clock) -> Self {
        Self { http, clock, cache: Mutex::new(HashMap::new()) }
    }

    /// Cached entry for `url` plus whether it is still fresh. A stale entry
    /// is still useful for its etag. Opportunistically sweeps long-dead
    /// entries once the cache grows past [`KEY_CACHE_SWEEP_AT`].
    fn cached(&self, url: &str) -> (Option<CacheEntry>, bool) {
        let now = (self.clock)();
        let mut cache = self.cache.lock().unwrap();
        if cache.len() > KEY_CACHE_SWEEP_AT {
            let horizon = now
                - chrono::Duration::from_std(KEY_FRESH_TTL * 10)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            cache.retain(|_, e| e.at >= horizon);
        }
        match cache.get(url) {
            Some(e) => {
                let fresh = e.fresh_at(now);
                (Some(e.clone()), fresh)
            }
            None => (None, false),
        }
    }

    fn store(&self, url: &str, lines: Vec<String>, etag: Option<String>) {
        let entry = CacheEntry { lines, etag, at: (self.clock)() };
        self.cache.lock().unwrap().insert(url.to_string(), entry);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[async_trait]
impl KeyResolver for KeyDirectory {
    async fn resolve(&self, url: &str) -> Result<Vec<String>> {
        if !url.starts_with("https://") {
            bail!("invalid URL scheme");
        }

        let (prev, fresh) = self.cached(url);
        if fresh {
            return Ok(prev.map(|e| e.lines).unwrap_or_default());
        }

        let mut req = self.http.get(url).timeout(KEY_FETCH_TIMEOUT);
        if let Some(etag) = prev.as_ref().and_then(|e| e.etag.as_deref()) {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        // Transport failure leaves the cache untouched; the caller treats
        // the key list as empty for this evaluation.
        let mut res = req.send().await?;
        let status = res.status().as_u16();
        let etag_header = res
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut read_err: Option<anyhow::Error> = None;
        if status == 200 {
            loop {
                match res.chunk().await {
                    Ok(Some(chunk)) => {
                        body.extend_from_slice(&chunk);
                        if body.len() >= KEY_BODY_LIMIT {
                            body.truncate(KEY_BODY_LIMIT);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        read_err = Some(e.into());
                        break;
                    }
                }
            }
        }

        let (lines, etag, status_err) = merge_response(prev.as_ref(), status, &body, etag_header);
        if let Some(ref e) = status_err {
            warn!(%url, error = %e, "fetching public keys");
        }
        self.store(url, lines.clone(), etag);

        match status_err.or(read_err) {
            Some(e) => Err(e),
            None => Ok(lines),
        }
    }
}

/// Decide the next cache content from a response. `304` keeps the previous
/// lines and etag; `200` takes the (already truncated) body; any other
/// status yields an empty entry plus an error, so failing endpoints are
/// retried at most once per empty-TTL window.
fn merge_response(
    prev: Option<&CacheEntry>,
    status: u16,
    body: &[u8],
    etag_header: Option<String>,
) -> (Vec<String>, Option<String>, Option<anyhow::Error>) {
    match status {
        304 => {
            let lines = prev.map(|e| e.lines.clone()).unwrap_or_default();
            let etag = prev.and_then(|e| e.etag.clone());
            (lines, etag, None)
        }
        200 => {
            let text = String::from_utf8_lossy(&body[..body.len().min(KEY_BODY_LIMIT)]);
            let trimmed = text.trim();
            let lines = if trimmed.is_empty() {
                Vec::new()
            } else {
                trimmed.lines().map(str::to_string).collect()
            };
            (lines, etag_header, None)
        }
        other => (Vec::new(), None, Some(anyhow::anyhow!("unexpected status {other}"))),
    }
}
