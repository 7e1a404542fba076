//! Backend-agnostic types and collaborator traits for `askpipe`.
//!
//! Nothing in this crate performs IO. Concrete search providers, fetchers, model
//! clients and stores live in `askpipe-local`; the pipeline lives in `askpipe`.

mod model;

pub use model::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("malformed model output: {0}")]
    Malformed(String),
    #[error("run failed: {0}")]
    Run(String),
}

impl Error {
    /// A single external call failed; callers recover locally.
    pub fn is_collaborator(&self) -> bool {
        matches!(
            self,
            Error::Fetch(_)
                | Error::Search(_)
                | Error::Llm(_)
                | Error::Store(_)
                | Error::Timeout(_)
                | Error::InvalidUrl(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
}

#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchedPage>;
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;
    async fn complete(&self, req: &LlmRequest) -> Result<String>;
}

/// Durable turn history and run status, keyed by conversation id.
///
/// Implementations must serialize read-modify-write per conversation; writes to
/// different conversations are independent.
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<()>;
    async fn load(&self, conversation_id: &str) -> Result<Vec<Turn>>;
    async fn title(&self, conversation_id: &str) -> Result<Option<String>>;
    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<()>;
    async fn record_status(&self, event: &StageEvent) -> Result<()>;
    async fn status(&self, conversation_id: &str) -> Result<Option<StatusRecord>>;
    async fn list(&self, limit: usize) -> Result<Vec<ConversationSummary>>;
}

/// Receives stage events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StageEvent);
}

/// Dedup key for a URL: scheme, lowercased host, port and path.
///
/// Query strings and fragments are dropped. Unparseable input falls back to the
/// trimmed string so it still dedups against itself.
pub fn normalize_url(url: &str) -> String {
    let s = url.trim();
    let Ok(u) = url::Url::parse(s) else {
        return s.to_string();
    };
    let Some(host) = u.host_str() else {
        return s.to_string();
    };
    let mut out = format!("{}://{}", u.scheme(), host.to_ascii_lowercase());
    if let Some(port) = u.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(u.path());
    out
}

/// Host of `url`, lowercased, or `None` when it does not parse.
pub fn url_host(url: &str) -> Option<String> {
    url::Url::parse(url.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
