//! The pipeline controller.
//!
//! One [`Pipeline::run`] walks the stage machine in [`state`] from `Planning` to
//! `Done`. Collaborator failures degrade to deterministic fallbacks; only a run that
//! cannot produce any answer text returns `Error::Run`.

pub mod events;
pub mod filter;
pub mod parse;
pub mod plan;
pub mod quality;
pub mod reformat;
pub mod retrieve;
pub mod state;
pub mod synthesize;
pub mod title;

use crate::config::PipelineConfig;
use askpipe_core::{
    Answer, ConversationStore, Error, EventSink, FilteredDocument, LlmClient, LlmRequest, LlmTask,
    Mode, PageFetcher, Result, SearchProvider, StageEvent, StageKind, Turn,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use state::{next_stage, PipelineState, Stage};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub(crate) async fn ask_model(
    llm: &dyn LlmClient,
    task: LlmTask,
    prompt: String,
    timeout_ms: u64,
) -> Result<String> {
    let req = LlmRequest::new(task, prompt);
    tokio::time::timeout(Duration::from_millis(timeout_ms), llm.complete(&req))
        .await
        .map_err(|_| Error::Timeout(timeout_ms))?
}

/// Best text left after a failed synthesis: the previous round's answer, else a digest of `filtered`.
fn recover_answer(previous: Option<Answer>, query: &str, filtered: &[FilteredDocument]) -> Option<Answer> {
    if let Some(prev) = previous.filter(|a| !a.text.trim().is_empty()) {
        tracing::warn!(stage = "synthesize", "keeping previous round's answer");
        return Some(prev);
    }
    if filtered.is_empty() {
        return None;
    }
    tracing::warn!(stage = "synthesize", sources = filtered.len(), "using extractive answer");
    let text = synthesize::extractive_answer(query, filtered);
    let cited_urls = synthesize::prune_citations(&text, filtered);
    Some(Answer {
        text,
        cited_urls,
        context_only: false,
    })
}

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub conversation_id: String,
    pub query: String,
    pub mode: Mode,
}

impl RunRequest {
    pub fn new(conversation_id: impl Into<String>, query: impl Into<String>, mode: Mode) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            query: query.into(),
            mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub conversation_id: String,
    /// Final text, with a `## Sources` section when anything was cited.
    pub answer: Answer,
    pub title: Option<String>,
    pub iterations: u32,
    pub metadata: serde_json::Value,
}

/// Collaborators plus configuration. Cheap to clone; runs share nothing else.
#[derive(Clone)]
pub struct Pipeline {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn ConversationStore>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ConversationStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            search,
            fetcher,
            llm,
            store,
            events: Arc::new(events::NoopSink),
            config: config.sanitized(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    async fn emit(&self, conversation_id: &str, kind: StageKind, payload: serde_json::Value) {
        let ev = StageEvent {
            conversation_id: conversation_id.to_string(),
            kind,
            payload,
        };
        self.events.emit(&ev);
        if let Err(e) = self.store.record_status(&ev).await {
            tracing::warn!(stage = kind.as_str(), error = %e, "status record failed");
        }
    }

    async fn announce(&self, stage: Stage, conversation_id: &str, payload: serde_json::Value) {
        if let Some(kind) = stage.event_kind() {
            self.emit(conversation_id, kind, payload).await;
        }
    }

    /// Answer `req.query` within its conversation and persist both turns.
    pub async fn run(&self, req: RunRequest) -> Result<RunOutcome> {
        let started = Instant::now();
        let query = req.query.trim().to_string();
        if query.is_empty() {
            return Err(Error::Run("empty query".to_string()));
        }
        let history = match self.store.load(&req.conversation_id).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(conversation_id = %req.conversation_id, error = %e, "history unavailable");
                Vec::new()
            }
        };
        if let Err(e) = self
            .store
            .append(&req.conversation_id, Turn::user(query.clone(), now_epoch_s()))
            .await
        {
            tracing::warn!(conversation_id = %req.conversation_id, error = %e, "user turn not persisted");
        }

        let mut st = PipelineState::new(&req.conversation_id, &query, req.mode, history);
        let result = match self.drive(&mut st).await {
            Ok(()) => self.finish(st, started).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(out) => Ok(out),
            Err(e) => {
                tracing::error!(
                    conversation_id = %req.conversation_id,
                    query = %query,
                    collaborator = e.is_collaborator(),
                    error = %e,
                    "run failed"
                );
                self.emit(&req.conversation_id, StageKind::Error, json!({"error": e.to_string()}))
                    .await;
                Err(match e {
                    Error::Run(_) => e,
                    other => Error::Run(other.to_string()),
                })
            }
        }
    }

    async fn drive(&self, st: &mut PipelineState) -> Result<()> {
        let mut stage = Stage::Planning;
        while stage != Stage::Done {
            self.enter(stage, st).await?;
            let next = next_stage(stage, st.transition_input());
            if stage == Stage::QualityCheck && next == Stage::Retrieving {
                st.iteration += 1;
                tracing::info!(iteration = st.iteration, "quality gate requested another round");
            }
            stage = next;
        }
        Ok(())
    }

    async fn enter(&self, stage: Stage, st: &mut PipelineState) -> Result<()> {
        let cfg = &self.config;
        let id = st.conversation_id.clone();
        match stage {
            Stage::Planning => {
                self.announce(Stage::Planning, &id, json!({"query": st.query, "iteration": st.iteration}))
                    .await;
                let decoded = plan::plan(self.llm.as_ref(), &st.query, &st.history, st.mode, None, cfg).await;
                if decoded.is_fallback() {
                    st.note_fallback("plan");
                }
                st.plan = Some(decoded.into_inner());
                st.plan_iteration = st.iteration;
            }
            Stage::Retrieving => {
                if st.plan_iteration != st.iteration {
                    self.announce(Stage::Planning, &id, json!({"query": st.query, "iteration": st.iteration}))
                        .await;
                    let decoded = plan::plan(
                        self.llm.as_ref(),
                        &st.query,
                        &st.history,
                        st.mode,
                        st.verdict.as_ref(),
                        cfg,
                    )
                    .await;
                    if decoded.is_fallback() {
                        st.note_fallback("plan");
                    }
                    st.plan = Some(decoded.into_inner());
                    st.plan_iteration = st.iteration;
                }
                let queries = st
                    .plan
                    .as_ref()
                    .map(|p| p.search_queries.clone())
                    .unwrap_or_default();
                self.announce(stage, &id, json!({"queries": queries, "iteration": st.iteration}))
                    .await;
                let report = retrieve::retrieve(
                    self.search.as_ref(),
                    self.fetcher.as_ref(),
                    &queries,
                    &st.documents,
                    cfg,
                )
                .await;
                for doc in report.documents {
                    st.documents.insert(doc);
                }
            }
            Stage::Filtering => {
                self.announce(stage, &id, json!({"documents": st.documents.len()}))
                    .await;
                let decoded = filter::filter(self.llm.as_ref(), st.documents.as_slice(), &st.query, cfg).await;
                if decoded.is_fallback() {
                    st.note_fallback("filter");
                }
                let out = decoded.into_inner();
                tracing::info!(
                    total = out.total_original,
                    kept = out.documents.len(),
                    filtered_out = out.filtered_out,
                    "documents filtered"
                );
                st.filtered = out.documents;
                st.filtered_out = out.filtered_out;
            }
            Stage::Synthesizing => {
                self.announce(stage, &id, json!({"sources": st.filtered.len()}))
                    .await;
                match synthesize::synthesize(self.llm.as_ref(), &st.query, &st.filtered, &st.history, cfg)
                    .await
                {
                    Ok(decoded) => {
                        if decoded.is_fallback() {
                            st.note_fallback("synthesize");
                        }
                        st.answer = Some(decoded.into_inner());
                    }
                    Err(e) => {
                        tracing::warn!(stage = "synthesize", error = %e, "synthesis failed");
                        let answer = recover_answer(st.answer.take(), &st.query, &st.filtered).ok_or(e)?;
                        st.note_fallback("synthesize");
                        st.answer = Some(answer);
                    }
                }
            }
            Stage::QualityCheck => {
                self.announce(stage, &id, json!({"iteration": st.iteration}))
                    .await;
                let answer = st.answer.clone().unwrap_or_default();
                let intent = st
                    .plan
                    .as_ref()
                    .map(|p| p.elaborated_intent.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(st.query.as_str());
                let decoded = quality::evaluate(
                    self.llm.as_ref(),
                    &st.query,
                    intent,
                    &answer,
                    st.filtered.len(),
                    st.mode,
                    cfg,
                )
                .await;
                if decoded.is_fallback() {
                    st.note_fallback("quality");
                }
                st.verdict = Some(decoded.into_inner());
            }
            Stage::Reformatting => {
                self.announce(stage, &id, json!({})).await;
                let (Some(answer), Some(verdict)) = (st.answer.as_ref(), st.verdict.as_ref()) else {
                    return Ok(());
                };
                let decoded =
                    reformat::reformat(self.llm.as_ref(), &st.query, answer, verdict, &st.filtered, cfg)
                        .await;
                if decoded.is_fallback() {
                    st.note_fallback("reformat");
                }
                st.answer = Some(decoded.into_inner());
            }
            Stage::Titling => {
                let existing = match self.store.title(&id).await {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(stage = "title", error = %e, "title lookup failed");
                        None
                    }
                };
                if existing.is_some() {
                    st.title = existing;
                    return Ok(());
                }
                let text = st.answer.as_ref().map(|a| a.text.as_str()).unwrap_or("");
                let decoded = title::generate_title(self.llm.as_ref(), &st.query, text, cfg).await;
                if decoded.is_fallback() {
                    st.note_fallback("title");
                }
                let t = decoded.into_inner();
                if let Err(e) = self.store.set_title(&id, &t).await {
                    tracing::warn!(stage = "title", error = %e, "title not persisted");
                }
                st.title = Some(t);
            }
            Stage::Done => {}
        }
        Ok(())
    }

    async fn finish(&self, st: PipelineState, started: Instant) -> Result<RunOutcome> {
        let Some(mut answer) = st.answer.clone() else {
            return Err(Error::Run("no answer produced".to_string()));
        };
        if answer.text.trim().is_empty() {
            return Err(Error::Run("no answer produced".to_string()));
        }
        answer.text = reformat::with_sources_section(&answer, &st.filtered);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let metadata = json!({
            "mode": st.mode.as_str(),
            "iterations": st.iteration,
            "plan_query_count": st.plan.as_ref().map(|p| p.search_queries.len()).unwrap_or(0),
            "needs_search": st.needs_search(),
            "raw_documents": st.documents.len(),
            "filtered_documents": st.filtered.len(),
            "filtered_out": st.filtered_out,
            "quality_score": st.verdict.as_ref().map(|v| v.quality_score),
            "context_only": answer.context_only,
            "fallbacks": st.fallbacks,
            "elapsed_ms": elapsed_ms,
        });
        let turn = Turn::assistant(
            answer.text.clone(),
            answer.cited_urls.clone(),
            now_epoch_s(),
            metadata.clone(),
        );
        if let Err(e) = self.store.append(&st.conversation_id, turn).await {
            tracing::warn!(conversation_id = %st.conversation_id, error = %e, "assistant turn not persisted");
        }
        self.announce(
            Stage::Done,
            &st.conversation_id,
            json!({"citations": answer.cited_urls.len(), "elapsed_ms": elapsed_ms}),
        )
        .await;
        tracing::info!(
            conversation_id = %st.conversation_id,
            iterations = st.iteration,
            citations = answer.cited_urls.len(),
            elapsed_ms,
            "run complete"
        );
        Ok(RunOutcome {
            conversation_id: st.conversation_id,
            answer,
            title: st.title,
            iterations: st.iteration,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait::async_trait]
    impl LlmClient for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn complete(&self, _req: &LlmRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn ask_model_times_out() {
        let err = ask_model(&Slow, LlmTask::Plan, "p".to_string(), 20)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(20)));
    }
}
