use super::ask_model;
use super::parse::{decode_json, Decoded};
use crate::config::PipelineConfig;
use askpipe_core::{LlmClient, LlmTask, Mode, QaVerdict, RetrievalPlan, Turn};
use serde::Deserialize;

/// Reply shape requested from the model.
#[derive(Debug, Deserialize)]
pub(crate) struct PlanReply {
    #[serde(default)]
    needs_web_search: Option<bool>,
    #[serde(default)]
    search_queries: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    context_analysis: String,
    #[serde(default)]
    elaborated_intent: String,
}

fn render_history(history: &[Turn], last: usize) -> String {
    let start = history.len().saturating_sub(last);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|t| format!("{}: {}", t.role.as_str(), t.content))
        .collect();
    if lines.is_empty() {
        "No previous conversation".to_string()
    } else {
        lines.join("\n")
    }
}

fn prompt(query: &str, history: &[Turn], mode: Mode, hint: Option<&QaVerdict>, cfg: &PipelineConfig) -> String {
    let (min_q, max_q) = mode.query_bounds();
    let mut p = format!(
        "Analyze the user's query in the context of the conversation and decide whether web search is needed.\n\n\
         Conversation history:\n{}\n\nCurrent user query: {query}\n\n\
         Respond with a JSON object:\n\
         {{\"needs_web_search\": true/false, \"search_queries\": [\"...\"], \"reasoning\": \"...\", \
         \"context_analysis\": \"...\", \"elaborated_intent\": \"...\"}}\n\n\
         If search is needed, write {min_q}-{max_q} diverse queries covering different angles. \
         If not, return an empty search_queries array.",
        render_history(history, cfg.plan_history_turns)
    );
    if let Some(v) = hint {
        p.push_str("\n\nA previous answer was judged incomplete. Search for what it is missing.");
        if let Some(rq) = v.refined_query.as_deref().filter(|s| !s.trim().is_empty()) {
            p.push_str(&format!("\nRefined query: {rq}"));
        }
        if !v.missing_aspects.is_empty() {
            p.push_str(&format!("\nMissing aspects: {}", v.missing_aspects.join("; ")));
        }
    }
    p
}

/// Turn a model reply into a bounded plan.
///
/// Queries are trimmed and de-duplicated case-insensitively, a refined query from the
/// previous verdict goes first, and the list is cut to the mode maximum. A retrieval
/// round (`hint` present) always searches.
pub(crate) fn bound_plan(
    reply: PlanReply,
    query: &str,
    mode: Mode,
    hint: Option<&QaVerdict>,
) -> RetrievalPlan {
    let needs_search = hint.is_some() || reply.needs_web_search.unwrap_or(true);
    let mut queries: Vec<String> = Vec::new();
    let refined = hint
        .and_then(|v| v.refined_query.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    for q in refined
        .into_iter()
        .map(str::to_string)
        .chain(reply.search_queries)
    {
        let q = q.trim().to_string();
        if q.is_empty() || queries.iter().any(|seen| seen.eq_ignore_ascii_case(&q)) {
            continue;
        }
        queries.push(q);
    }
    if !needs_search {
        queries.clear();
    } else if queries.is_empty() {
        queries.push(query.trim().to_string());
    }
    queries.truncate(mode.query_bounds().1);
    RetrievalPlan {
        needs_search,
        search_queries: queries,
        reasoning: reply.reasoning,
        context_analysis: reply.context_analysis,
        elaborated_intent: reply.elaborated_intent,
    }
}

pub(crate) fn fallback_plan(query: &str, hint: Option<&QaVerdict>) -> RetrievalPlan {
    let mut search_queries = Vec::new();
    if let Some(rq) = hint
        .and_then(|v| v.refined_query.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        search_queries.push(rq.to_string());
    }
    if !search_queries.iter().any(|q| q.eq_ignore_ascii_case(query.trim())) {
        search_queries.push(query.trim().to_string());
    }
    RetrievalPlan {
        needs_search: true,
        search_queries,
        reasoning: "planner unavailable; searching the query as asked".to_string(),
        context_analysis: String::new(),
        elaborated_intent: query.to_string(),
    }
}

/// Ask the model for a retrieval plan. `hint` is the verdict that triggered a new round.
pub async fn plan(
    llm: &dyn LlmClient,
    query: &str,
    history: &[Turn],
    mode: Mode,
    hint: Option<&QaVerdict>,
    cfg: &PipelineConfig,
) -> Decoded<RetrievalPlan> {
    let reply = ask_model(
        llm,
        LlmTask::Plan,
        prompt(query, history, mode, hint, cfg),
        cfg.llm_timeout_ms,
    )
    .await;
    let decoded = decode_json::<PlanReply, _>(reply, || PlanReply {
        needs_web_search: None,
        search_queries: Vec::new(),
        reasoning: String::new(),
        context_analysis: String::new(),
        elaborated_intent: String::new(),
    });
    match decoded {
        Decoded::Parsed(r) => Decoded::Parsed(bound_plan(r, query, mode, hint)),
        Decoded::FallbackUsed { reason, .. } => {
            tracing::warn!(stage = "plan", query, error = %reason, "planner fell back");
            Decoded::FallbackUsed {
                value: fallback_plan(query, hint),
                reason,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(needs: Option<bool>, qs: &[&str]) -> PlanReply {
        PlanReply {
            needs_web_search: needs,
            search_queries: qs.iter().map(|s| s.to_string()).collect(),
            reasoning: String::new(),
            context_analysis: String::new(),
            elaborated_intent: String::new(),
        }
    }

    #[test]
    fn bound_plan_clamps_to_mode_maximum() {
        let many: Vec<String> = (0..20).map(|i| format!("q{i}")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let p = bound_plan(reply(Some(true), &refs), "x", Mode::Fast, None);
        assert_eq!(p.search_queries.len(), 5);
        let p = bound_plan(reply(Some(true), &refs), "x", Mode::Thorough, None);
        assert_eq!(p.search_queries.len(), 10);
    }

    #[test]
    fn bound_plan_falls_back_to_query_and_dedups() {
        let p = bound_plan(reply(Some(true), &["", "  "]), " capital of France ", Mode::Fast, None);
        assert_eq!(p.search_queries, vec!["capital of France"]);

        let p = bound_plan(reply(Some(true), &["Paris", "paris", "Paris facts"]), "q", Mode::Fast, None);
        assert_eq!(p.search_queries, vec!["Paris", "Paris facts"]);

        let p = bound_plan(reply(Some(false), &["ignored"]), "q", Mode::Fast, None);
        assert!(!p.needs_search);
        assert!(p.search_queries.is_empty());
    }

    #[test]
    fn bound_plan_puts_refined_query_first_on_a_new_round() {
        let v = QaVerdict {
            needs_more_data: true,
            refined_query: Some("paris population 2024".to_string()),
            ..QaVerdict::default()
        };
        let many: Vec<String> = (0..12).map(|i| format!("q{i}")).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let p = bound_plan(reply(Some(false), &refs), "paris", Mode::Thorough, Some(&v));
        assert!(p.needs_search);
        assert_eq!(p.search_queries[0], "paris population 2024");
        assert_eq!(p.search_queries.len(), 10);
    }

    #[test]
    fn fallback_plan_searches_the_query() {
        let p = fallback_plan("capital of France", None);
        assert!(p.needs_search);
        assert_eq!(p.search_queries, vec!["capital of France"]);
    }

    #[test]
    fn render_history_keeps_the_tail() {
        let h: Vec<Turn> = (0..8).map(|i| Turn::user(format!("m{i}"), 0)).collect();
        let s = render_history(&h, 6);
        assert!(!s.contains("m1\n"));
        assert!(s.starts_with("user: m2"));
        assert_eq!(render_history(&[], 6), "No previous conversation");
    }
}
