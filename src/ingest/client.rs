// src/ingest/client.rs
//
// HTTP plumbing for the parser: one pooled client with a hard timeout,
// transparent retry on transport errors and 5xx, and a TTL response cache
// keyed by alert identifier.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 3;

#[derive(Debug)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub body: String,
}

struct CacheEntry {
    body: String,
    stored_at: Instant,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl HttpFetcher {
    pub fn new(cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("cap-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            cache: Mutex::new(HashMap::new()),
            ttl: cache_ttl,
        })
    }

    /// GET with transparent retry: transport errors and 5xx back off
    /// 1 s / 2 s / 4 s before the next attempt; any 4xx is returned to the
    /// caller immediately (404 has its own fallback path there).
    pub async fn get(&self, url: &str) -> Result<FetchedBody> {
        let mut last_err = anyhow!("request to {url} never attempted");
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1u64 << (attempt - 1))).await;
            }
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() {
                        last_err = anyhow!("HTTP {status} from {url}");
                        continue;
                    }
                    match resp.text().await {
                        Ok(body) => return Ok(FetchedBody { status, body }),
                        Err(e) => {
                            // Dropped mid-body: as retryable as a failed send.
                            last_err = anyhow::Error::from(e)
                                .context(format!("reading body from {url}"));
                        }
                    }
                }
                Err(e) => {
                    last_err = anyhow::Error::from(e).context(format!("GET {url}"));
                }
            }
        }
        Err(last_err)
    }

    /// Cached response body for an identifier, if still within TTL.
    pub fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.lock().expect("response cache poisoned");
        let entry = cache.get(key)?;
        (entry.stored_at.elapsed() <= self.ttl).then(|| entry.body.clone())
    }

    /// Insert a response body, sweeping expired entries on the way.
    pub fn cache_put(&self, key: String, body: String) {
        let mut cache = self.cache.lock().expect("response cache poisoned");
        let ttl = self.ttl;
        cache.retain(|_, e| e.stored_at.elapsed() <= ttl);
        cache.insert(
            key,
            CacheEntry {
                body,
                stored_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn cache_len(&self) -> usize {
        self.cache.lock().expect("response cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_honours_ttl_and_sweeps_on_insert() {
        let fetcher = HttpFetcher::new(Duration::from_millis(0)).unwrap();
        fetcher.cache_put("a".into(), "<alert/>".into());
        // TTL zero: the entry is already stale.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(fetcher.cached("a"), None);
        // Inserting another key sweeps the stale one.
        fetcher.cache_put("b".into(), "<alert/>".into());
        assert_eq!(fetcher.cache_len(), 1);
    }

    #[test]
    fn cache_returns_fresh_entries() {
        let fetcher = HttpFetcher::new(Duration::from_secs(300)).unwrap();
        fetcher.cache_put("x".into(), "body".into());
        assert_eq!(fetcher.cached("x").as_deref(), Some("body"));
        assert_eq!(fetcher.cached("y"), None);
    }
}
