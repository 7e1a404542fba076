use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Run-wide setting controlling fan-out width, minimum answer length and retrieval rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Fast,
    Thorough,
}

impl Mode {
    /// Additional retrieval rounds the quality gate may trigger.
    pub fn max_iterations(self) -> u32 {
        match self {
            Mode::Fast => 0,
            Mode::Thorough => 2,
        }
    }

    /// Desired number of search queries per plan: (min, max).
    pub fn query_bounds(self) -> (usize, usize) {
        match self {
            Mode::Fast => (3, 5),
            Mode::Thorough => (7, 10),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Thorough => "thorough",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "thorough" => Ok(Mode::Thorough),
            other => Err(format!("unknown mode: {other} (expected fast|thorough)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub needs_search: bool,
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub context_analysis: String,
    #[serde(default)]
    pub elaborated_intent: String,
}

/// A retrieved page. `url` is unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub title: String,
    pub content: String,
    /// The search query that discovered this document.
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredDocument {
    pub url: String,
    pub title: String,
    /// Bounded excerpt of the document content.
    pub excerpt: String,
    /// In `[0, 1]`.
    pub relevance_score: f64,
    pub quality_tier: QualityTier,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Subset of the supplied filtered URLs whose markers appear in `text`, by marker number.
    pub cited_urls: Vec<String>,
    /// True when the answer was synthesized from conversation context only.
    #[serde(default)]
    pub context_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub needs_more_data: bool,
    pub should_reformat: bool,
    /// In `[0, 1]`.
    pub quality_score: f64,
    #[serde(default)]
    pub refined_query: Option<String>,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub timestamp_epoch_s: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Turn {
    pub fn user(content: impl Into<String>, timestamp_epoch_s: u64) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            citations: Vec::new(),
            timestamp_epoch_s,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        citations: Vec<String>,
        timestamp_epoch_s: u64,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            citations,
            timestamp_epoch_s,
            metadata,
        }
    }
}

/// Named pipeline progress events, consumable by any UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Thinking,
    Searching,
    Distilling,
    Synthesizing,
    QaEvaluating,
    Reformatting,
    Complete,
    Error,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Thinking => "thinking",
            StageKind::Searching => "searching",
            StageKind::Distilling => "distilling",
            StageKind::Synthesizing => "synthesizing",
            StageKind::QaEvaluating => "qa_evaluating",
            StageKind::Reformatting => "reformatting",
            StageKind::Complete => "complete",
            StageKind::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageKind::Complete | StageKind::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub conversation_id: String,
    pub kind: StageKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: StageKind,
    pub step: u32,
    pub payload: serde_json::Value,
    pub at_epoch_s: u64,
}

/// Progress record for one conversation's current (or last) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: StageKind,
    pub step: u32,
    pub is_active: bool,
    pub error: Option<String>,
    pub started_at_epoch_s: u64,
    pub updated_at_epoch_s: u64,
    pub history: Vec<StatusEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub title: Option<String>,
    pub turn_count: usize,
    pub updated_at_epoch_s: u64,
    pub last_message_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            max_results: Some(max_results),
            language: None,
            country: None,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub provider: String,
}

/// Extracted page text. Fetch failures are reported as `Err`, not as an empty page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub title: String,
    pub content: String,
}

/// Which call site a model request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmTask {
    Plan,
    Filter,
    Synthesize,
    QualityCheck,
    Reformat,
    Title,
}

impl LlmTask {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmTask::Plan => "plan",
            LlmTask::Filter => "filter",
            LlmTask::Synthesize => "synthesize",
            LlmTask::QualityCheck => "quality_check",
            LlmTask::Reformat => "reformat",
            LlmTask::Title => "title",
        }
    }

    /// Sampling temperature per call site.
    pub fn temperature(self) -> f64 {
        match self {
            LlmTask::Plan => 0.2,
            LlmTask::Synthesize | LlmTask::Title => 0.3,
            LlmTask::Filter | LlmTask::QualityCheck | LlmTask::Reformat => 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub task: LlmTask,
    pub prompt: String,
}

impl LlmRequest {
    pub fn new(task: LlmTask, prompt: impl Into<String>) -> Self {
        Self {
            task,
            prompt: prompt.into(),
        }
    }
}
