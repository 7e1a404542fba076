use askpipe_core::{Error, FetchedPage, LlmClient, PageFetcher, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod cache;
pub mod extract;
pub mod ollama;
pub mod openai_compat;
pub mod search;
pub mod store;

pub use cache::PageCache;
pub use search::{provider_from_env, CachedSearch, RetryingSearch};
pub use store::{FsConversationStore, MemoryConversationStore};

pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn env_bool(key: &str) -> bool {
    matches!(
        env(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Shared HTTP client for providers and model backends.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("askpipe-local/0.1")
        .redirect(reqwest::redirect::Policy::limited(10))
        // Avoid "hang forever" on DNS/TLS stalls; per-request timeouts still apply.
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::Fetch(e.to_string()))
}

/// Pick a model backend: `ASKPIPE_LLM_BACKEND` (auto|openai_compat|ollama).
///
/// `auto` prefers an OpenAI-compatible endpoint, then an opted-in local Ollama.
pub fn llm_from_env(
    client: reqwest::Client,
    requested: Option<&str>,
    model: Option<String>,
    timeout_ms: u64,
) -> Result<Arc<dyn LlmClient>> {
    let choice = requested
        .map(|s| s.trim().to_ascii_lowercase())
        .or_else(|| env("ASKPIPE_LLM_BACKEND").map(|s| s.to_ascii_lowercase()))
        .unwrap_or_else(|| "auto".to_string());
    match choice.as_str() {
        "openai_compat" | "openai" => Ok(Arc::new(openai_compat::OpenAiCompatClient::from_env(
            client, model, timeout_ms,
        )?)),
        "ollama" => Ok(Arc::new(ollama::OllamaClient::from_env(
            client, model, timeout_ms,
        )?)),
        "auto" => {
            if let Ok(c) =
                openai_compat::OpenAiCompatClient::from_env(client.clone(), model.clone(), timeout_ms)
            {
                return Ok(Arc::new(c));
            }
            if let Ok(c) = ollama::OllamaClient::from_env(client, model, timeout_ms) {
                return Ok(Arc::new(c));
            }
            Err(Error::NotConfigured(
                "no model backend configured (set ASKPIPE_OPENAI_BASE_URL/ASKPIPE_OPENAI_API_KEY or ASKPIPE_OLLAMA_ENABLE=1)"
                    .to_string(),
            ))
        }
        other => Err(Error::NotConfigured(format!(
            "unknown llm backend: {other} (expected auto|openai_compat|ollama)"
        ))),
    }
}

const DEFAULT_MAX_BYTES: usize = 2_000_000;
const TEXT_WIDTH: usize = 100;

/// Fetches a URL and returns extracted page text.
#[derive(Debug, Clone)]
pub struct LocalFetcher {
    client: reqwest::Client,
    cache: Option<PageCache>,
    max_bytes: usize,
}

impl LocalFetcher {
    pub fn new(cache: Option<PageCache>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; askpipe-local/0.1)")
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            cache,
            max_bytes: DEFAULT_MAX_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes.max(1);
        self
    }

    pub fn default_cache_dir() -> PathBuf {
        std::env::temp_dir().join("askpipe-cache")
    }

    async fn cache_get(&self, url: &str) -> Option<FetchedPage> {
        let cache = self.cache.clone()?;
        let url = url.to_string();
        match tokio::task::spawn_blocking(move || cache.get(&url)).await {
            Ok(Ok(hit)) => hit,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "page cache read failed");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "page cache join failed");
                None
            }
        }
    }

    async fn cache_put(&self, page: &FetchedPage) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let page = page.clone();
        // A failed cache write never fails the fetch.
        match tokio::task::spawn_blocking(move || cache.put(&page)).await {
            Ok(Err(e)) => tracing::debug!(error = %e, "page cache write failed"),
            Err(e) => tracing::debug!(error = %e, "page cache join failed"),
            Ok(Ok(())) => {}
        }
    }

    async fn fetch_network(&self, url: url::Url, timeout_ms: u64) -> Result<FetchedPage> {
        let requested = url.to_string();
        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(timeout_ms)
                } else {
                    Error::Fetch(e.to_string())
                }
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status}")));
        }
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Fetch(e.to_string()))?;
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                let can_take = self.max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        let (title, content) = extract::extract_page(content_type.as_deref(), &bytes, TEXT_WIDTH)
            .map_err(|code| Error::Fetch(code.to_string()))?;
        Ok(FetchedPage {
            url: requested.clone(),
            final_url,
            title: title.unwrap_or(requested),
            content,
        })
    }
}

#[async_trait::async_trait]
impl PageFetcher for LocalFetcher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchedPage> {
        let parsed = url::Url::parse(url.trim()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        if let Some(hit) = self.cache_get(url).await {
            return Ok(hit);
        }
        // The reqwest timeout covers send; this bounds body streaming too.
        let page = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.fetch_network(parsed, timeout_ms),
        )
        .await
        .map_err(|_| Error::Timeout(timeout_ms))??;
        self.cache_put(&page).await;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn local_fetcher_extracts_html_title_and_text() {
        let app = Router::new().route(
            "/paris",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    "<html><head><title>Paris</title></head><body><p>Paris is the capital of France.</p></body></html>",
                )
            }),
        );
        let addr = serve(app).await;
        let fetcher = LocalFetcher::new(None).unwrap();
        let page = fetcher
            .fetch(&format!("http://{addr}/paris"), 2_000)
            .await
            .unwrap();
        assert_eq!(page.title, "Paris");
        assert!(page.content.contains("capital of France"));
    }

    #[tokio::test]
    async fn local_fetcher_reports_http_errors_and_timeouts() {
        let app = Router::new()
            .route("/gone", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(1_500)).await;
                    "late"
                }),
            );
        let addr = serve(app).await;
        let fetcher = LocalFetcher::new(None).unwrap();

        let e = fetcher
            .fetch(&format!("http://{addr}/gone"), 2_000)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Fetch(ref m) if m.contains("404")), "{e}");

        let e = fetcher
            .fetch(&format!("http://{addr}/slow"), 200)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Timeout(200)), "{e}");
    }

    #[tokio::test]
    async fn local_fetcher_serves_second_fetch_from_cache() {
        let app = Router::new().route(
            "/",
            get(|| async { ([(header::CONTENT_TYPE, "text/plain")], "hello cache") }),
        );
        let addr = serve(app).await;
        let tmp = tempfile::tempdir().unwrap();
        let cache = PageCache::new(tmp.path().to_path_buf(), Some(60));
        let fetcher = LocalFetcher::new(Some(cache.clone())).unwrap();
        let url = format!("http://{addr}/");

        let first = fetcher.fetch(&url, 2_000).await.unwrap();
        assert!(cache.get(&url).unwrap().is_some());
        let second = fetcher.fetch(&url, 2_000).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn local_fetcher_rejects_non_http_schemes() {
        let fetcher = LocalFetcher::new(None).unwrap();
        let e = fetcher.fetch("file:///etc/passwd", 1_000).await.unwrap_err();
        assert!(matches!(e, Error::InvalidUrl(_)));
    }
}
