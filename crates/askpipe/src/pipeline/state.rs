//! Controller states and the transition table.
//!
//! Transitions are a pure function of the current stage and a small snapshot of
//! run state, so every branch can be tested without collaborators.

use askpipe_core::{
    normalize_url, Answer, Document, FilteredDocument, Mode, QaVerdict, RetrievalPlan, StageKind,
    Turn,
};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Planning,
    Retrieving,
    Filtering,
    Synthesizing,
    QualityCheck,
    Reformatting,
    Titling,
    Done,
}

impl Stage {
    /// Progress event announced when the stage starts, if any.
    pub fn event_kind(self) -> Option<StageKind> {
        match self {
            Stage::Planning => Some(StageKind::Thinking),
            Stage::Retrieving => Some(StageKind::Searching),
            Stage::Filtering => Some(StageKind::Distilling),
            Stage::Synthesizing => Some(StageKind::Synthesizing),
            Stage::QualityCheck => Some(StageKind::QaEvaluating),
            Stage::Reformatting => Some(StageKind::Reformatting),
            Stage::Titling => None,
            Stage::Done => Some(StageKind::Complete),
        }
    }
}

/// What the transition table looks at.
#[derive(Debug, Clone, Copy)]
pub struct TransitionInput<'a> {
    pub mode: Mode,
    pub iteration: u32,
    pub needs_search: bool,
    pub verdict: Option<&'a QaVerdict>,
}

pub fn next_stage(stage: Stage, input: TransitionInput<'_>) -> Stage {
    match stage {
        Stage::Planning if input.needs_search => Stage::Retrieving,
        Stage::Planning => Stage::Synthesizing,
        Stage::Retrieving => Stage::Filtering,
        Stage::Filtering => Stage::Synthesizing,
        Stage::Synthesizing => Stage::QualityCheck,
        Stage::QualityCheck => {
            let Some(v) = input.verdict else {
                return Stage::Titling;
            };
            if v.needs_more_data && input.iteration < input.mode.max_iterations() {
                Stage::Retrieving
            } else if v.should_reformat {
                Stage::Reformatting
            } else {
                Stage::Titling
            }
        }
        Stage::Reformatting => Stage::Titling,
        Stage::Titling | Stage::Done => Stage::Done,
    }
}

/// Documents keyed by normalized URL, in discovery order. First insert wins.
#[derive(Debug, Clone, Default)]
pub struct DocumentSet {
    keys: HashSet<String>,
    docs: Vec<Document>,
}

impl DocumentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a document with the same normalized URL is already present.
    pub fn insert(&mut self, doc: Document) -> bool {
        if !self.keys.insert(normalize_url(&doc.url)) {
            return false;
        }
        self.docs.push(doc);
        true
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.keys.contains(&normalize_url(url))
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn as_slice(&self) -> &[Document] {
        &self.docs
    }

    pub fn into_vec(self) -> Vec<Document> {
        self.docs
    }
}

/// Mutable record threaded through one run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub conversation_id: String,
    pub query: String,
    pub mode: Mode,
    /// Turns before this run's user turn.
    pub history: Vec<Turn>,
    pub plan: Option<RetrievalPlan>,
    /// Iteration the current plan was made for.
    pub plan_iteration: u32,
    pub documents: DocumentSet,
    pub filtered: Vec<FilteredDocument>,
    pub filtered_out: usize,
    pub answer: Option<Answer>,
    pub verdict: Option<QaVerdict>,
    pub iteration: u32,
    pub title: Option<String>,
    /// Stages that fell back to deterministic behavior, in order.
    pub fallbacks: Vec<&'static str>,
}

impl PipelineState {
    pub fn new(conversation_id: &str, query: &str, mode: Mode, history: Vec<Turn>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            query: query.to_string(),
            mode,
            history,
            plan: None,
            plan_iteration: 0,
            documents: DocumentSet::new(),
            filtered: Vec::new(),
            filtered_out: 0,
            answer: None,
            verdict: None,
            iteration: 0,
            title: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn needs_search(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| p.needs_search)
    }

    pub fn transition_input(&self) -> TransitionInput<'_> {
        TransitionInput {
            mode: self.mode,
            iteration: self.iteration,
            needs_search: self.needs_search(),
            verdict: self.verdict.as_ref(),
        }
    }

    pub fn note_fallback(&mut self, stage: &'static str) {
        if !self.fallbacks.contains(&stage) {
            self.fallbacks.push(stage);
        }
    }
}
