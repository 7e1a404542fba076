use crate::env;
use askpipe_core::{Error, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn timeout_ms_from_query(q: &SearchQuery) -> u64 {
    // Provider requests can hang without an explicit timeout.
    q.timeout_ms.unwrap_or(20_000).clamp(1_000, 60_000)
}

fn brave_api_key_from_env() -> Option<String> {
    env("ASKPIPE_BRAVE_API_KEY").or_else(|| env("BRAVE_SEARCH_API_KEY"))
}

pub fn searxng_endpoint_from_env() -> Option<String> {
    env("ASKPIPE_SEARXNG_ENDPOINT")
}

fn keep_http_url(url: &str) -> bool {
    let u = url.trim();
    u.starts_with("http://") || u.starts_with("https://")
}

#[derive(Debug, Clone)]
pub struct BraveSearchProvider {
    client: reqwest::Client,
    api_key: String,
}

impl BraveSearchProvider {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = brave_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing ASKPIPE_BRAVE_API_KEY (or BRAVE_SEARCH_API_KEY)".to_string(),
            )
        })?;
        Ok(Self { client, api_key })
    }

    fn endpoint() -> String {
        env("ASKPIPE_BRAVE_ENDPOINT")
            .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct BraveWebSearchResponse {
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    results: Option<Vec<BraveWebResult>>,
}

#[derive(Debug, Deserialize)]
struct BraveWebResult {
    url: String,
    title: Option<String>,
    description: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for BraveSearchProvider {
    fn name(&self) -> &'static str {
        "brave"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let mut req = self
            .client
            .get(Self::endpoint())
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", q.query.as_str())]);
        if let Some(n) = q.max_results {
            req = req.query(&[("count", n.to_string())]);
        }
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("search_lang", lang)]);
        }
        if let Some(country) = q.country.as_deref() {
            req = req.query(&[("country", country)]);
        }

        let resp = req
            .timeout(Duration::from_millis(timeout_ms_from_query(q)))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("brave search HTTP {status}")));
        }
        let parsed: BraveWebSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let results = parsed
            .web
            .and_then(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .filter(|r| keep_http_url(&r.url))
            .take(q.max_results.unwrap_or(usize::MAX))
            .map(|r| SearchResult {
                url: r.url,
                title: r.title,
                snippet: r.description,
                source: "brave".to_string(),
            })
            .collect();
        Ok(SearchResponse {
            results,
            provider: "brave".to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearxngSearchProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl SearxngSearchProvider {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoint = searxng_endpoint_from_env()
            .ok_or_else(|| Error::NotConfigured("missing ASKPIPE_SEARXNG_ENDPOINT".to_string()))?;
        Ok(Self::new(client, endpoint))
    }

    fn endpoint_search(&self) -> String {
        // Accept either a base URL or a full /search endpoint.
        let mut base = self.endpoint.trim().trim_end_matches('/').to_string();
        if !base.ends_with("/search") {
            base.push_str("/search");
        }
        base
    }
}

#[derive(Debug, Deserialize)]
struct SearxngSearchResponse {
    results: Option<Vec<SearxngResult>>,
}

#[derive(Debug, Deserialize)]
struct SearxngResult {
    url: Option<String>,
    title: Option<String>,
    content: Option<String>,
}

#[async_trait::async_trait]
impl SearchProvider for SearxngSearchProvider {
    fn name(&self) -> &'static str {
        "searxng"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let max_results = q.max_results.unwrap_or(10).min(20);
        let mut req = self
            .client
            .get(self.endpoint_search())
            .query(&[("q", q.query.as_str()), ("format", "json")]);
        if let Some(lang) = q.language.as_deref() {
            req = req.query(&[("language", lang)]);
        }
        let resp = req
            .timeout(Duration::from_millis(timeout_ms_from_query(q)))
            .send()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Search(format!("searxng search HTTP {status}")));
        }
        let parsed: SearxngSearchResponse = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;

        let results = parsed
            .results
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| {
                let url = r.url.filter(|u| keep_http_url(u))?;
                Some(SearchResult {
                    url,
                    title: r.title,
                    snippet: r.content,
                    source: "searxng".to_string(),
                })
            })
            .take(max_results)
            .collect();
        Ok(SearchResponse {
            results,
            provider: "searxng".to_string(),
        })
    }
}

/// Pick a provider: `ASKPIPE_SEARCH_PROVIDER` (auto|brave|searxng), auto preferring Brave.
pub fn provider_from_env(
    client: reqwest::Client,
    requested: Option<&str>,
) -> Result<Arc<dyn SearchProvider>> {
    let choice = requested
        .map(|s| s.trim().to_ascii_lowercase())
        .or_else(|| env("ASKPIPE_SEARCH_PROVIDER").map(|s| s.to_ascii_lowercase()))
        .unwrap_or_else(|| "auto".to_string());
    match choice.as_str() {
        "brave" => Ok(Arc::new(BraveSearchProvider::from_env(client)?)),
        "searxng" => Ok(Arc::new(SearxngSearchProvider::from_env(client)?)),
        "auto" => {
            if let Ok(p) = BraveSearchProvider::from_env(client.clone()) {
                return Ok(Arc::new(p));
            }
            if let Ok(p) = SearxngSearchProvider::from_env(client) {
                return Ok(Arc::new(p));
            }
            Err(Error::NotConfigured(
                "no search provider configured (set ASKPIPE_BRAVE_API_KEY or ASKPIPE_SEARXNG_ENDPOINT)"
                    .to_string(),
            ))
        }
        other => Err(Error::NotConfigured(format!(
            "unknown search provider: {other} (expected auto|brave|searxng)"
        ))),
    }
}

/// Retries a provider with exponential backoff.
pub struct RetryingSearch {
    inner: Arc<dyn SearchProvider>,
    retries: u32,
    base_delay: Duration,
}

impl RetryingSearch {
    pub fn new(inner: Arc<dyn SearchProvider>, retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            retries,
            base_delay,
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for RetryingSearch {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let mut attempt = 0u32;
        loop {
            match self.inner.search(q).await {
                Ok(r) => return Ok(r),
                Err(e) if attempt < self.retries && !matches!(e, Error::NotConfigured(_)) => {
                    let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
                    tracing::warn!(
                        provider = self.inner.name(),
                        query = %q.query,
                        attempt = attempt + 1,
                        error = %e,
                        "search failed; retrying in {} ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-memory TTL cache keyed by `(lowercased query, limit)`.
pub struct CachedSearch {
    inner: Arc<dyn SearchProvider>,
    ttl: Duration,
    entries: Mutex<HashMap<(String, usize), (Instant, SearchResponse)>>,
}

impl CachedSearch {
    pub fn new(inner: Arc<dyn SearchProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(q: &SearchQuery) -> (String, usize) {
        (q.query.trim().to_lowercase(), q.max_results.unwrap_or(0))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, usize), (Instant, SearchResponse)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl SearchProvider for CachedSearch {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let key = Self::key(q);
        if let Some((at, hit)) = self.lock().get(&key) {
            if at.elapsed() < self.ttl {
                tracing::debug!(query = %q.query, "search cache hit");
                return Ok(hit.clone());
            }
        }
        let resp = self.inner.search(q).await?;
        let mut entries = self.lock();
        entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
        // Empty responses are not cached so a flaky provider can recover.
        if !resp.results.is_empty() {
            entries.insert(key, (Instant::now(), resp.clone()));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl SearchProvider for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(Error::Search("HTTP 503".to_string()));
            }
            Ok(SearchResponse {
                results: vec![SearchResult {
                    url: format!("https://example.com/{}", q.query),
                    title: None,
                    snippet: None,
                    source: "flaky".to_string(),
                }],
                provider: "flaky".to_string(),
            })
        }
    }

    #[test]
    fn parses_minimal_brave_shape() {
        let js = r#"{"web":{"results":[{"url":"https://example.com","title":"Example","description":"Hello"}]}}"#;
        let parsed: BraveWebSearchResponse = serde_json::from_str(js).unwrap();
        let rs = parsed.web.unwrap().results.unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].url, "https://example.com");
        assert_eq!(rs[0].description.as_deref(), Some("Hello"));
    }

    #[test]
    fn parses_searxng_shape_with_missing_urls() {
        let js = r#"{"results":[{"url":"https://example.com","title":"Example","content":"Hello"},{"title":"no url"}]}"#;
        let parsed: SearxngSearchResponse = serde_json::from_str(js).unwrap();
        let rs = parsed.results.unwrap();
        assert_eq!(rs.len(), 2);
        assert!(rs[1].url.is_none());
    }

    #[test]
    fn searxng_endpoint_accepts_base_or_search_path() {
        let c = reqwest::Client::new();
        assert_eq!(
            SearxngSearchProvider::new(c.clone(), "http://sx/").endpoint_search(),
            "http://sx/search"
        );
        assert_eq!(
            SearxngSearchProvider::new(c, "http://sx/search").endpoint_search(),
            "http://sx/search"
        );
    }

    #[tokio::test]
    async fn retrying_search_recovers_within_budget() {
        let inner = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let p = RetryingSearch::new(inner.clone(), 2, Duration::from_millis(1));
        let r = p.search(&SearchQuery::new("a", 5)).await.unwrap();
        assert_eq!(r.results.len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retrying_search_gives_up_after_budget() {
        let inner = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        });
        let p = RetryingSearch::new(inner.clone(), 1, Duration::from_millis(1));
        assert!(p.search(&SearchQuery::new("a", 5)).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_search_reuses_results_case_insensitively() {
        let inner = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let p = CachedSearch::new(inner.clone(), Duration::from_secs(60));
        p.search(&SearchQuery::new("Paris", 5)).await.unwrap();
        p.search(&SearchQuery::new("paris ", 5)).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        p.search(&SearchQuery::new("paris", 3)).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_search_evicts_expired_entries_on_miss() {
        let inner = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let p = CachedSearch::new(inner.clone(), Duration::from_millis(20));
        for q in ["a", "b", "c"] {
            p.search(&SearchQuery::new(q, 5)).await.unwrap();
        }
        assert_eq!(p.lock().len(), 3);
        tokio::time::sleep(Duration::from_millis(40)).await;
        p.search(&SearchQuery::new("d", 5)).await.unwrap();
        let keys: Vec<String> = p.lock().keys().map(|(q, _)| q.clone()).collect();
        assert_eq!(keys, vec!["d".to_string()]);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }
}
