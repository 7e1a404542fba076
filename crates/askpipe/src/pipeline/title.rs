use super::ask_model;
use super::filter::truncate_chars;
use super::parse::{decode_text, Decoded};
use crate::config::PipelineConfig;
use askpipe_core::{LlmClient, LlmTask};

const MAX_TITLE_CHARS: usize = 60;
const FALLBACK_QUERY_CHARS: usize = 50;

/// Strip quotes and a `Title:` label, collapse whitespace, cap at 60 chars.
pub fn clean_title(raw: &str) -> Option<String> {
    let first = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let first = first
        .strip_prefix("Title:")
        .or_else(|| first.strip_prefix("title:"))
        .unwrap_or(first);
    let quotes: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '*'];
    let t = first
        .trim()
        .trim_matches(quotes)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if t.is_empty() {
        return None;
    }
    if t.chars().count() > MAX_TITLE_CHARS {
        return Some(format!("{}...", truncate_chars(&t, MAX_TITLE_CHARS - 3)));
    }
    Some(t)
}

pub fn fallback_title(query: &str) -> String {
    let q = query.split_whitespace().collect::<Vec<_>>().join(" ");
    if q.chars().count() > FALLBACK_QUERY_CHARS {
        format!("{}...", truncate_chars(&q, FALLBACK_QUERY_CHARS))
    } else {
        q
    }
}

/// A short conversation title from the first exchange.
pub async fn generate_title(
    llm: &dyn LlmClient,
    query: &str,
    answer_text: &str,
    cfg: &PipelineConfig,
) -> Decoded<String> {
    let prompt = format!(
        "Write a concise, specific 3-8 word title for a conversation. Respond with just the title, \
         no quotes.\n\nUser query: {query}\nAssistant response: {}",
        truncate_chars(answer_text, 2_000)
    );
    let reply = ask_model(llm, LlmTask::Title, prompt, cfg.llm_timeout_ms)
        .await
        .and_then(|raw| {
            clean_title(&raw)
                .ok_or_else(|| askpipe_core::Error::Malformed("empty title".to_string()))
        });
    let decoded = decode_text(reply, || fallback_title(query));
    if let Some(reason) = decoded.fallback_reason() {
        tracing::warn!(stage = "title", query, error = %reason, "using query as title");
    }
    decoded
}
