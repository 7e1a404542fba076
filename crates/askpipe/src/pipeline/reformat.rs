use super::ask_model;
use super::parse::{decode_text, Decoded};
use super::synthesize::{cited_positions, prune_citations};
use crate::config::PipelineConfig;
use askpipe_core::{Answer, FilteredDocument, LlmClient, LlmTask, QaVerdict};

const SOURCES_HEADING: &str = "## Sources";

fn prompt(query: &str, answer: &Answer, verdict: &QaVerdict) -> String {
    let suggestions = if verdict.improvement_suggestions.is_empty() {
        "none".to_string()
    } else {
        verdict.improvement_suggestions.join("; ")
    };
    format!(
        "Restructure the response so it answers the user's query directly, with clear sections and \
         logical flow. Keep all information and every citation marker exactly as written. Do not \
         add a source list.\n\nUser query: {query}\nImprovement suggestions: {suggestions}\n\n\
         Current response:\n{}",
        answer.text
    )
}

/// Ask the model to restructure `answer`. Keeps the original text on failure.
pub async fn reformat(
    llm: &dyn LlmClient,
    query: &str,
    answer: &Answer,
    verdict: &QaVerdict,
    sources: &[FilteredDocument],
    cfg: &PipelineConfig,
) -> Decoded<Answer> {
    let reply = ask_model(
        llm,
        LlmTask::Reformat,
        prompt(query, answer, verdict),
        cfg.llm_timeout_ms,
    )
    .await;
    let decoded = decode_text(reply, || answer.text.clone());
    if let Some(reason) = decoded.fallback_reason() {
        tracing::warn!(stage = "reformat", query, error = %reason, "keeping unformatted answer");
    }
    decoded.map(|text| {
        let text = strip_sources_section(&text).to_string();
        Answer {
            cited_urls: if answer.context_only {
                Vec::new()
            } else {
                prune_citations(&text, sources)
            },
            text,
            context_only: answer.context_only,
        }
    })
}

/// Text before a trailing `## Sources` section, if the model wrote one anyway.
fn strip_sources_section(text: &str) -> &str {
    match text.rfind(SOURCES_HEADING) {
        Some(i) if i == 0 || text[..i].ends_with('\n') => text[..i].trim_end(),
        _ => text.trim_end(),
    }
}

/// Append a `## Sources` list of every cited position. No-op without citations.
pub fn with_sources_section(answer: &Answer, sources: &[FilteredDocument]) -> String {
    let body = strip_sources_section(&answer.text);
    if answer.cited_urls.is_empty() {
        return body.to_string();
    }
    let mut out = format!("{body}\n\n{SOURCES_HEADING}\n");
    for n in cited_positions(body) {
        let Some(d) = n.checked_sub(1).and_then(|i| sources.get(i)) else {
            continue;
        };
        if answer.cited_urls.contains(&d.url) {
            out.push_str(&format!("\n[{n}] {} - {}", d.title, d.url));
        }
    }
    out
}
