//! Relevance filter: model-side distillation validated against a deterministic policy.

use super::ask_model;
use super::parse::{decode_json, Decoded};
use crate::config::PipelineConfig;
use askpipe_core::{normalize_url, url_host, Document, FilteredDocument, LlmClient, LlmTask, QualityTier};
use regex::RegexSet;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

const DENY_PATTERNS: &[&str] = &[
    r"\.gov/.*form",
    r"\.gov/.*application",
    r"\.gov/.*login",
    r"\.gov/.*account",
    r"ssa\.gov",
    r"irs\.gov",
    r"uscis\.gov",
    r"login\.",
    r"signin\.",
    r"register\.",
    r"account\.",
    r"profile\.",
    r"dashboard\.",
    r"admin\.",
    r"manage\.",
];

/// Path segments that mark auth walls and consent gates.
const AUTH_SEGMENTS: &[&str] = &[
    "login", "log-in", "signin", "sign-in", "signup", "sign-up", "register", "auth", "oauth",
    "sso", "captcha", "challenge", "consent",
];

const AUTH_QUERY_NEEDLES: &[&str] = &["returnurl=", "redirect=", "callback="];

const AUTHORITATIVE_MARKERS: &[&str] = &[
    "docs.",
    "developer.",
    "learn.",
    "support.",
    "help.",
    "wikipedia.org",
    "arxiv.org",
    "who.int",
    "nih.gov",
];

const UGC_DOMAINS: &[&str] = &["reddit.com", "quora.com", "stackoverflow.com", "medium.com"];

fn deny_set() -> Option<&'static RegexSet> {
    static SET: OnceLock<Option<RegexSet>> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(DENY_PATTERNS).ok()).as_ref()
}

/// True for auth pages, generic government forms and account/admin hosts.
pub fn is_denied(url: &str) -> bool {
    let u = url.trim().to_ascii_lowercase();
    if deny_set().is_some_and(|s| s.is_match(&u)) {
        return true;
    }
    if let Ok(parsed) = url::Url::parse(&u) {
        let auth_path = parsed
            .path_segments()
            .into_iter()
            .flatten()
            .any(|seg| AUTH_SEGMENTS.contains(&seg));
        if auth_path {
            return true;
        }
        if let Some(q) = parsed.query() {
            return AUTH_QUERY_NEEDLES.iter().any(|n| q.contains(n));
        }
    }
    false
}

/// Domain-derived source quality: authoritative 1.0, user-generated 0.4, otherwise 0.7.
pub fn source_quality(url: &str) -> (f64, QualityTier) {
    let host = url_host(url).unwrap_or_default();
    let is_under = |d: &str| host == d || host.ends_with(&format!(".{d}"));
    if AUTHORITATIVE_MARKERS
        .iter()
        .any(|m| if m.ends_with('.') { host.starts_with(*m) } else { is_under(*m) })
        || host.ends_with(".edu")
    {
        (1.0, QualityTier::High)
    } else if UGC_DOMAINS.iter().any(|d| is_under(*d)) {
        (0.4, QualityTier::Low)
    } else {
        (0.7, QualityTier::Medium)
    }
}

fn terms(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Fraction of distinct query terms (longer than two chars) present in `content`.
pub fn keyword_overlap(query: &str, content: &str) -> f64 {
    let q: HashSet<String> = terms(query).filter(|w| w.chars().count() > 2).collect();
    if q.is_empty() {
        return 0.0;
    }
    let d: HashSet<String> = terms(content).collect();
    q.iter().filter(|w| d.contains(*w)).count() as f64 / q.len() as f64
}

pub fn combined_score(query: &str, doc: &Document) -> (f64, QualityTier) {
    let (quality, tier) = source_quality(&doc.url);
    let text = format!("{} {}", doc.title, doc.content);
    (0.5 * keyword_overlap(query, &text) + 0.5 * quality, tier)
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => s[..i].to_string(),
        None => s.to_string(),
    }
}

fn doc_title(doc: &Document) -> String {
    let t = doc.title.trim();
    if !t.is_empty() && t != doc.url {
        return t.to_string();
    }
    doc.content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate_chars(l, 100))
        .unwrap_or_else(|| doc.url.clone())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub documents: Vec<FilteredDocument>,
    pub total_original: usize,
    pub filtered_out: usize,
}

/// Score, exclude denylisted URLs, rank by combined score (ties keep discovery order) and cap.
pub fn deterministic_filter(docs: &[Document], query: &str, cfg: &PipelineConfig) -> FilterOutcome {
    let mut scored: Vec<(f64, FilteredDocument)> = docs
        .iter()
        .filter(|d| !is_denied(&d.url))
        .map(|d| {
            let (score, tier) = combined_score(query, d);
            (
                score,
                FilteredDocument {
                    url: d.url.clone(),
                    title: doc_title(d),
                    excerpt: truncate_chars(&d.content, cfg.excerpt_chars),
                    relevance_score: score.clamp(0.0, 1.0),
                    quality_tier: tier,
                },
            )
        })
        .collect();
    // Stable sort keeps discovery order among equal scores.
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    let documents: Vec<FilteredDocument> = scored
        .into_iter()
        .take(cfg.filter_cap)
        .map(|(_, d)| d)
        .collect();
    FilterOutcome {
        filtered_out: docs.len() - documents.len(),
        total_original: docs.len(),
        documents,
    }
}

#[derive(Debug, Deserialize)]
struct DistillReply {
    distilled_docs: Vec<DistilledDoc>,
}

#[derive(Debug, Deserialize)]
struct DistilledDoc {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    relevant_content: String,
    #[serde(default)]
    relevance_score: f64,
    #[serde(default)]
    source_quality: Option<String>,
}

fn parse_tier(s: &str) -> Option<QualityTier> {
    match s.trim().to_ascii_lowercase().as_str() {
        "high" => Some(QualityTier::High),
        "medium" => Some(QualityTier::Medium),
        "low" => Some(QualityTier::Low),
        _ => None,
    }
}

/// Check the model's picks against the supplied documents.
///
/// Unknown or repeated URLs and denylisted URLs are dropped; excerpts fall back to the
/// document text and are bounded; scores are clamped; the cap is enforced.
fn validate_distilled(
    reply: DistillReply,
    docs: &[Document],
    cfg: &PipelineConfig,
) -> Vec<FilteredDocument> {
    let by_key: HashMap<String, &Document> =
        docs.iter().map(|d| (normalize_url(&d.url), d)).collect();
    let mut seen = HashSet::new();
    let mut out: Vec<FilteredDocument> = Vec::new();
    for pick in reply.distilled_docs {
        let key = normalize_url(&pick.url);
        let Some(doc) = by_key.get(&key) else {
            tracing::debug!(url = %pick.url, "distiller returned an unknown url");
            continue;
        };
        if is_denied(&doc.url) || !seen.insert(key) {
            continue;
        }
        let excerpt = if pick.relevant_content.trim().is_empty() {
            &doc.content
        } else {
            &pick.relevant_content
        };
        let score = if pick.relevance_score.is_finite() {
            pick.relevance_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let title = if pick.title.trim().is_empty() {
            doc_title(doc)
        } else {
            pick.title.trim().to_string()
        };
        out.push(FilteredDocument {
            url: doc.url.clone(),
            title,
            excerpt: truncate_chars(excerpt, cfg.excerpt_chars),
            relevance_score: score,
            quality_tier: pick
                .source_quality
                .as_deref()
                .and_then(parse_tier)
                .unwrap_or_else(|| source_quality(&doc.url).1),
        });
    }
    out.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    out.truncate(cfg.filter_cap);
    out
}

fn prompt(docs: &[Document], query: &str, cfg: &PipelineConfig) -> String {
    let listing: Vec<String> = docs
        .iter()
        .enumerate()
        .map(|(i, d)| {
            format!(
                "Document {}:\nURL: {}\nContent: {}",
                i + 1,
                d.url,
                truncate_chars(&d.content, 1_000)
            )
        })
        .collect();
    format!(
        "Filter web search results for relevance to the query.\n\nQuery: {query}\nDocuments: {}\n\n{}\n\n\
         Drop irrelevant pages (government forms, login or account pages, directory listings, spam). \
         Keep at most {} documents. For each, extract the relevant content (max {} chars), rate relevance \
         0.0-1.0 and source quality high|medium|low.\n\
         Respond with JSON: {{\"distilled_docs\": [{{\"url\": \"...\", \"title\": \"...\", \
         \"relevant_content\": \"...\", \"relevance_score\": 0.0, \"source_quality\": \"high\"}}]}}",
        docs.len(),
        listing.join("\n\n"),
        cfg.filter_cap,
        cfg.excerpt_chars
    )
}

/// Reduce `docs` to a bounded, ranked set. Never drops everything because the model failed.
pub async fn filter(
    llm: &dyn LlmClient,
    docs: &[Document],
    query: &str,
    cfg: &PipelineConfig,
) -> Decoded<FilterOutcome> {
    if docs.is_empty() {
        return Decoded::Parsed(FilterOutcome {
            documents: Vec::new(),
            total_original: 0,
            filtered_out: 0,
        });
    }
    let reply = ask_model(llm, LlmTask::Filter, prompt(docs, query, cfg), cfg.llm_timeout_ms).await;
    let decoded = decode_json::<DistillReply, _>(reply, || DistillReply {
        distilled_docs: Vec::new(),
    });
    let reason = match decoded {
        Decoded::Parsed(r) => {
            let documents = validate_distilled(r, docs, cfg);
            if !documents.is_empty() {
                return Decoded::Parsed(FilterOutcome {
                    filtered_out: docs.len() - documents.len(),
                    total_original: docs.len(),
                    documents,
                });
            }
            "no valid documents in distiller reply".to_string()
        }
        Decoded::FallbackUsed { reason, .. } => reason,
    };
    tracing::warn!(stage = "filter", query, error = %reason, "using deterministic scoring");
    Decoded::FallbackUsed {
        value: deterministic_filter(docs, query, cfg),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(url: &str, content: &str) -> Document {
        Document {
            url: url.to_string(),
            title: String::new(),
            content: content.to_string(),
            query: "q".to_string(),
        }
    }

    #[test]
    fn denylist_catches_forms_auth_and_account_hosts() {
        for u in [
            "https://www.irs.gov/forms-pubs",
            "https://example.gov/benefits/application",
            "https://login.example.com/",
            "https://example.com/account/login",
            "https://example.com/oauth/authorize",
            "https://admin.example.com/x",
            "https://example.com/page?returnUrl=/x",
        ] {
            assert!(is_denied(u), "{u}");
        }
        for u in [
            "https://en.wikipedia.org/wiki/Paris",
            "https://example.com/authors/jane",
            "https://docs.rs/tokio",
        ] {
            assert!(!is_denied(u), "{u}");
        }
    }

    #[test]
    fn source_quality_tiers() {
        assert_eq!(source_quality("https://en.wikipedia.org/wiki/Paris").1, QualityTier::High);
        assert_eq!(source_quality("https://docs.python.org/3/").1, QualityTier::High);
        assert_eq!(source_quality("https://cs.stanford.edu/x").1, QualityTier::High);
        assert_eq!(source_quality("https://www.reddit.com/r/paris").1, QualityTier::Low);
        assert_eq!(source_quality("https://example.com/").0, 0.7);
    }

    #[test]
    fn keyword_overlap_counts_distinct_long_terms() {
        assert_eq!(keyword_overlap("capital of France", "Paris is the capital of France."), 1.0);
        assert_eq!(keyword_overlap("capital of France", "France"), 0.5);
        assert_eq!(keyword_overlap("of a", "of a"), 0.0);
    }

    #[test]
    fn deterministic_filter_ranks_caps_and_excludes() {
        let cfg = PipelineConfig::default();
        let mut docs: Vec<Document> = (0..12)
            .map(|i| doc(&format!("https://site{i}.com/p"), "unrelated text"))
            .collect();
        docs.push(doc("https://en.wikipedia.org/wiki/Paris", "Paris is the capital of France."));
        docs.push(doc("https://login.example.com/", "capital of France"));
        let out = deterministic_filter(&docs, "capital of France", &cfg);
        assert_eq!(out.documents.len(), 8);
        assert_eq!(out.total_original, 14);
        assert_eq!(out.filtered_out, 6);
        assert_eq!(out.documents[0].url, "https://en.wikipedia.org/wiki/Paris");
        assert_eq!(out.documents[0].title, "Paris is the capital of France.");
        // Equal scores keep discovery order.
        assert_eq!(out.documents[1].url, "https://site0.com/p");
        assert_eq!(out.documents[2].url, "https://site1.com/p");
    }

    #[test]
    fn validate_distilled_rejects_unknown_and_denied_urls() {
        let cfg = PipelineConfig::default();
        let docs = vec![
            doc("https://a.com/x", &"a".repeat(5_000)),
            doc("https://login.b.com/", "b"),
        ];
        let reply = DistillReply {
            distilled_docs: vec![
                DistilledDoc {
                    url: "https://evil.com/".to_string(),
                    title: "x".to_string(),
                    relevant_content: "x".to_string(),
                    relevance_score: 0.9,
                    source_quality: None,
                },
                DistilledDoc {
                    url: "https://login.b.com/".to_string(),
                    title: String::new(),
                    relevant_content: String::new(),
                    relevance_score: 0.9,
                    source_quality: None,
                },
                DistilledDoc {
                    url: "https://A.com/x".to_string(),
                    title: String::new(),
                    relevant_content: String::new(),
                    relevance_score: 7.0,
                    source_quality: Some("High".to_string()),
                },
            ],
        };
        let out = validate_distilled(reply, &docs, &cfg);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://a.com/x");
        assert_eq!(out[0].relevance_score, 1.0);
        assert_eq!(out[0].excerpt.chars().count(), cfg.excerpt_chars);
        assert_eq!(out[0].quality_tier, QualityTier::High);
    }

    fn arb_docs() -> impl Strategy<Value = Vec<Document>> {
        let host = prop_oneof![
            Just("en.wikipedia.org"),
            Just("login.example.com"),
            Just("www.reddit.com"),
            Just("irs.gov"),
            Just("example.com"),
            Just("docs.rs"),
        ];
        prop::collection::vec((host, 0u32..50, "[a-z ]{0,80}"), 0..30).prop_map(|v| {
            v.into_iter()
                .map(|(h, n, text)| doc(&format!("https://{h}/p{n}"), &text))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn filter_is_bounded_clean_and_deterministic(docs in arb_docs(), q in "[a-z ]{0,30}") {
            let cfg = PipelineConfig::default();
            let a = deterministic_filter(&docs, &q, &cfg);
            let b = deterministic_filter(&docs, &q, &cfg);
            prop_assert!(a.documents.len() <= 8);
            prop_assert!(a.documents.iter().all(|d| !is_denied(&d.url)));
            prop_assert!(a.documents.iter().all(|d| (0.0..=1.0).contains(&d.relevance_score)));
            prop_assert_eq!(a, b);
        }
    }
}
