use super::ask_model;
use super::filter::truncate_chars;
use super::parse::{decode_text, Decoded};
use crate::config::PipelineConfig;
use askpipe_core::{Answer, Error, FilteredDocument, LlmClient, LlmTask, Result, Role, Turn};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn marker_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\^?(\d{1,4})\]").ok()).as_ref()
}

/// Citation numbers (1-based) appearing as `[n]` or `[^n]`, ascending and unique.
pub fn cited_positions(text: &str) -> BTreeSet<usize> {
    let Some(re) = marker_re() else {
        return BTreeSet::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .collect()
}

/// URLs of `sources` whose markers occur in `text`, by marker number. Out-of-range markers are ignored.
pub fn prune_citations(text: &str, sources: &[FilteredDocument]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for n in cited_positions(text) {
        if let Some(d) = n.checked_sub(1).and_then(|i| sources.get(i)) {
            if !urls.contains(&d.url) {
                urls.push(d.url.clone());
            }
        }
    }
    urls
}

pub fn evidence_chars(sources: &[FilteredDocument]) -> usize {
    sources.iter().map(|d| d.excerpt.chars().count()).sum()
}

fn render_context(history: &[Turn], last: usize) -> String {
    let start = history.len().saturating_sub(last);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|t| match t.role {
            Role::User => format!("Previous question: {}", t.content),
            Role::Assistant => format!("Previous answer: {}", t.content),
        })
        .collect();
    if lines.is_empty() {
        "No previous conversation".to_string()
    } else {
        lines.join("\n")
    }
}

fn source_prompt(query: &str, sources: &[FilteredDocument]) -> String {
    let ctx: Vec<String> = sources
        .iter()
        .enumerate()
        .map(|(i, d)| {
            format!(
                "[^{}] {} ({} quality, relevance: {:.2})\n{}\n{}",
                i + 1,
                d.title,
                d.quality_tier.as_str(),
                d.relevance_score,
                d.url,
                d.excerpt
            )
        })
        .collect();
    format!(
        "Answer the question comprehensively using ONLY the sources below. Structure the answer with \
         clear sections. Cite with [^n] markers that refer to the numbered sources. Do not list the \
         sources at the end. If something is uncertain, say so.\n\n\
         Question: {query}\n\nSources:\n{}",
        ctx.join("\n\n")
    )
}

fn context_prompt(query: &str, history: &[Turn], cfg: &PipelineConfig) -> String {
    format!(
        "Answer the question using the conversation context. If the context is not enough, \
         answer from general knowledge and say so clearly. Give the complete answer directly.\n\n\
         Current question: {query}\n\nConversation context:\n{}",
        render_context(history, cfg.synth_history_turns)
    )
}

/// Deterministic digest of the top sources, used when the model call fails.
pub fn extractive_answer(query: &str, sources: &[FilteredDocument]) -> String {
    let mut out = format!("Here is what the retrieved sources say about \"{query}\":\n");
    for (i, d) in sources.iter().take(3).enumerate() {
        let snippet = truncate_chars(d.excerpt.split_whitespace().collect::<Vec<_>>().join(" ").as_str(), 300);
        out.push_str(&format!("\n- **{}**: {} [{}]", d.title, snippet, i + 1));
    }
    out
}

/// Produce an answer from `sources`, or from conversation context when evidence is thin.
///
/// Fails only when context-only synthesis has no model reply to work with.
pub async fn synthesize(
    llm: &dyn LlmClient,
    query: &str,
    sources: &[FilteredDocument],
    history: &[Turn],
    cfg: &PipelineConfig,
) -> Result<Decoded<Answer>> {
    let evidence = evidence_chars(sources);
    if sources.is_empty() || evidence < cfg.min_evidence_chars {
        tracing::info!(
            sources = sources.len(),
            evidence,
            "insufficient evidence; answering from conversation context"
        );
        let reply = ask_model(
            llm,
            LlmTask::Synthesize,
            context_prompt(query, history, cfg),
            cfg.llm_timeout_ms,
        )
        .await;
        let decoded = decode_text(reply, String::new);
        if let Some(reason) = decoded.fallback_reason() {
            return Err(Error::Run(format!("context-only synthesis failed: {reason}")));
        }
        return Ok(decoded.map(|text| Answer {
            text,
            cited_urls: Vec::new(),
            context_only: true,
        }));
    }

    let reply = ask_model(
        llm,
        LlmTask::Synthesize,
        source_prompt(query, sources),
        cfg.llm_timeout_ms,
    )
    .await;
    let decoded = decode_text(reply, || extractive_answer(query, sources));
    if let Some(reason) = decoded.fallback_reason() {
        tracing::warn!(stage = "synthesize", query, error = %reason, "using extractive answer");
    }
    Ok(decoded.map(|text| {
        let cited_urls = prune_citations(&text, sources);
        tracing::info!(sources = sources.len(), cited = cited_urls.len(), "answer synthesized");
        Answer {
            text,
            cited_urls,
            context_only: false,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use askpipe_core::QualityTier;
    use proptest::prelude::*;

    fn src(n: usize) -> Vec<FilteredDocument> {
        (1..=n)
            .map(|i| FilteredDocument {
                url: format!("https://s{i}.com/"),
                title: format!("S{i}"),
                excerpt: "x".repeat(100),
                relevance_score: 0.5,
                quality_tier: QualityTier::Medium,
            })
            .collect()
    }

    #[test]
    fn prune_citations_accepts_both_marker_forms_in_number_order() {
        let s = src(3);
        let text = "B says so [^3]. A agrees [1][1]. Nothing at [7] or [0].";
        assert_eq!(prune_citations(text, &s), vec!["https://s1.com/", "https://s3.com/"]);
        assert!(prune_citations("no markers", &s).is_empty());
    }

    #[test]
    fn extractive_answer_cites_top_three() {
        let s = src(5);
        let text = extractive_answer("q", &s);
        assert_eq!(
            prune_citations(&text, &s),
            vec!["https://s1.com/", "https://s2.com/", "https://s3.com/"]
        );
    }

    #[test]
    fn render_context_labels_roles() {
        let h = vec![Turn::user("q1", 0), Turn::assistant("a1", vec![], 0, serde_json::Value::Null)];
        assert_eq!(render_context(&h, 10), "Previous question: q1\nPrevious answer: a1");
    }

    proptest! {
        #[test]
        fn cited_urls_are_a_subset_backed_by_markers(
            n in 0usize..8,
            marks in prop::collection::vec(0usize..12, 0..10),
            hat in any::<bool>(),
        ) {
            let s = src(n);
            let text: String = marks
                .iter()
                .map(|m| if hat { format!("x [^{m}] ") } else { format!("x [{m}] ") })
                .collect();
            let cited = prune_citations(&text, &s);
            let urls: Vec<&str> = s.iter().map(|d| d.url.as_str()).collect();
            for (pos, u) in cited.iter().enumerate() {
                prop_assert!(urls.contains(&u.as_str()));
                let idx = urls.iter().position(|x| *x == u.as_str()).unwrap() + 1;
                prop_assert!(marks.contains(&idx));
                if pos > 0 {
                    let prev = urls.iter().position(|x| *x == cited[pos - 1]).unwrap() + 1;
                    prop_assert!(prev < idx);
                }
            }
        }
    }
}
