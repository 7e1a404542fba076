//! Parallel search-then-fetch across a plan's queries.

use super::state::DocumentSet;
use crate::config::PipelineConfig;
use askpipe_core::{
    normalize_url, Document, Error, PageFetcher, Result, SearchProvider, SearchQuery,
};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RetrievalReport {
    /// New documents, first-completed-first-merged.
    pub documents: Vec<Document>,
    /// Search hits across all queries, before dedup.
    pub raw_results: usize,
    pub failed_queries: usize,
    pub failed_fetches: usize,
    pub duplicates_dropped: usize,
}

struct QueryOutcome {
    documents: Vec<Document>,
    raw_results: usize,
    search_failed: bool,
    failed_fetches: usize,
}

async fn search_one(
    search: &dyn SearchProvider,
    query: &str,
    cfg: &PipelineConfig,
) -> Result<Vec<String>> {
    let mut q = SearchQuery::new(query, cfg.urls_per_query);
    q.timeout_ms = Some(cfg.search_timeout_ms);
    let resp = tokio::time::timeout(
        Duration::from_millis(cfg.search_timeout_ms),
        search.search(&q),
    )
    .await
    .map_err(|_| Error::Timeout(cfg.search_timeout_ms))??;
    let mut seen = HashSet::new();
    Ok(resp
        .results
        .into_iter()
        .map(|r| r.url)
        .filter(|u| seen.insert(normalize_url(u)))
        .take(cfg.urls_per_query)
        .collect())
}

async fn fetch_one(
    fetcher: &dyn PageFetcher,
    url: &str,
    query: &str,
    cfg: &PipelineConfig,
) -> Result<Document> {
    let page = tokio::time::timeout(
        Duration::from_millis(cfg.fetch_timeout_ms),
        fetcher.fetch(url, cfg.fetch_timeout_ms),
    )
    .await
    .map_err(|_| Error::Timeout(cfg.fetch_timeout_ms))??;
    if page.content.trim().is_empty() {
        return Err(Error::Fetch("empty content".to_string()));
    }
    Ok(Document {
        url: url.to_string(),
        title: page.title,
        content: page.content,
        query: query.to_string(),
    })
}

async fn run_query(
    search: &dyn SearchProvider,
    fetcher: &dyn PageFetcher,
    query: String,
    known: &HashSet<String>,
    cfg: &PipelineConfig,
) -> QueryOutcome {
    let urls = match search_one(search, &query, cfg).await {
        Ok(urls) => urls,
        Err(e) => {
            tracing::warn!(stage = "search", query = %query, error = %e, "query yielded no documents");
            return QueryOutcome {
                documents: Vec::new(),
                raw_results: 0,
                search_failed: true,
                failed_fetches: 0,
            };
        }
    };
    let raw_results = urls.len();
    let fresh: Vec<String> = urls
        .into_iter()
        .filter(|u| !known.contains(&normalize_url(u)))
        .collect();
    let fetched = futures::future::join_all(
        fresh
            .iter()
            .map(|url| fetch_one(fetcher, url, &query, cfg)),
    )
    .await;

    let mut documents = Vec::new();
    let mut failed_fetches = 0;
    for (url, r) in fresh.iter().zip(fetched) {
        match r {
            Ok(doc) => documents.push(doc),
            Err(e) => {
                failed_fetches += 1;
                tracing::warn!(stage = "fetch", query = %query, url = %url, error = %e, "fetch failed");
            }
        }
    }
    tracing::debug!(query = %query, raw_results, documents = documents.len(), "query done");
    QueryOutcome {
        documents,
        raw_results,
        search_failed: false,
        failed_fetches,
    }
}

/// Fan `queries` out with at most `cfg.concurrency` in flight.
///
/// URLs already in `existing` are neither fetched nor returned. A failed query or
/// fetch contributes nothing and never fails the batch.
pub async fn retrieve(
    search: &dyn SearchProvider,
    fetcher: &dyn PageFetcher,
    queries: &[String],
    existing: &DocumentSet,
    cfg: &PipelineConfig,
) -> RetrievalReport {
    let known: HashSet<String> = existing
        .as_slice()
        .iter()
        .map(|d| normalize_url(&d.url))
        .collect();
    let mut merged = DocumentSet::new();
    let mut report = RetrievalReport::default();

    let mut outcomes = stream::iter(queries.iter().cloned())
        .map(|q| run_query(search, fetcher, q, &known, cfg))
        .buffer_unordered(cfg.concurrency.max(1));
    while let Some(out) = outcomes.next().await {
        report.raw_results += out.raw_results;
        report.failed_fetches += out.failed_fetches;
        if out.search_failed {
            report.failed_queries += 1;
        }
        for doc in out.documents {
            if !merged.insert(doc) {
                report.duplicates_dropped += 1;
            }
        }
    }
    report.documents = merged.into_vec();
    tracing::info!(
        queries = queries.len(),
        documents = report.documents.len(),
        failed_queries = report.failed_queries,
        failed_fetches = report.failed_fetches,
        duplicates = report.duplicates_dropped,
        "retrieval done"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use askpipe_core::{FetchedPage, SearchResponse, SearchResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Every query returns `shared` plus one URL unique to the query.
    struct Search {
        shared: Vec<String>,
        fail: Option<String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Search {
        fn new(shared: &[&str]) -> Self {
            Self {
                shared: shared.iter().map(|s| s.to_string()).collect(),
                fail: None,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl SearchProvider for Search {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail.as_deref() == Some(q.query.as_str()) {
                return Err(Error::Search("HTTP 500".to_string()));
            }
            let mut urls = self.shared.clone();
            urls.push(format!("https://example.com/{}", q.query.replace(' ', "-")));
            Ok(SearchResponse {
                results: urls
                    .into_iter()
                    .map(|url| SearchResult {
                        url,
                        title: None,
                        snippet: None,
                        source: "fake".to_string(),
                    })
                    .collect(),
                provider: "fake".to_string(),
            })
        }
    }

    struct Fetch {
        slow_needle: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl PageFetcher for Fetch {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch(&self, url: &str, _timeout_ms: u64) -> Result<FetchedPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_needle.is_some_and(|n| url.contains(n)) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                title: url.to_string(),
                content: format!("content of {url}"),
            })
        }
    }

    fn cfg() -> PipelineConfig {
        PipelineConfig {
            fetch_timeout_ms: 100,
            search_timeout_ms: 1_000,
            ..PipelineConfig::default()
        }
    }

    fn queries(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("query {i}")).collect()
    }

    #[tokio::test]
    async fn duplicate_urls_across_queries_merge_once() {
        let search = Search::new(&["https://Wiki.org/Paris", "https://wiki.org/Paris?ref=x"]);
        let fetch = Fetch {
            slow_needle: None,
            calls: AtomicUsize::new(0),
        };
        let r = retrieve(&search, &fetch, &queries(4), &DocumentSet::new(), &cfg()).await;
        let keys: HashSet<String> = r.documents.iter().map(|d| normalize_url(&d.url)).collect();
        assert_eq!(keys.len(), r.documents.len());
        assert_eq!(r.documents.len(), 5);
        assert_eq!(r.duplicates_dropped, 3);
    }

    #[tokio::test]
    async fn at_most_five_queries_in_flight() {
        let search = Arc::new(Search::new(&[]));
        let fetch = Fetch {
            slow_needle: None,
            calls: AtomicUsize::new(0),
        };
        let c = PipelineConfig {
            concurrency: 5,
            ..cfg()
        };
        let r = retrieve(search.as_ref(), &fetch, &queries(10), &DocumentSet::new(), &c).await;
        assert_eq!(r.documents.len(), 10);
        let max = search.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 5, "max in flight {max}");
        assert!(max >= 2, "expected overlap, got {max}");
    }

    #[tokio::test]
    async fn slow_fetches_and_failed_searches_do_not_fail_the_batch() {
        let mut search = Search::new(&[]);
        search.fail = Some("query 0".to_string());
        let fetch = Fetch {
            slow_needle: Some("query-3"),
            calls: AtomicUsize::new(0),
        };
        let r = retrieve(&search, &fetch, &queries(5), &DocumentSet::new(), &cfg()).await;
        assert_eq!(r.failed_queries, 1);
        assert_eq!(r.failed_fetches, 1);
        assert_eq!(r.documents.len(), 3);
    }

    #[tokio::test]
    async fn known_urls_are_not_refetched() {
        let search = Search::new(&["https://wiki.org/paris"]);
        let fetch = Fetch {
            slow_needle: None,
            calls: AtomicUsize::new(0),
        };
        let mut existing = DocumentSet::new();
        existing.insert(Document {
            url: "https://wiki.org/paris".to_string(),
            title: String::new(),
            content: "x".to_string(),
            query: "earlier".to_string(),
        });
        let r = retrieve(&search, &fetch, &queries(1), &existing, &cfg()).await;
        assert_eq!(r.documents.len(), 1);
        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.raw_results, 2);
    }
}
