use crate::env;
use askpipe_core::{Error, LlmClient, LlmRequest, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are a careful research assistant. Follow the output format requested in the user message exactly.";

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_ms: u64,
}

impl OpenAiCompatClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            timeout_ms,
        }
    }

    /// `ASKPIPE_OPENAI_BASE_URL` (or `OPENAI_BASE_URL`) plus a model name; the key is optional
    /// so local servers work.
    pub fn from_env(
        client: reqwest::Client,
        model_override: Option<String>,
        timeout_ms: u64,
    ) -> Result<Self> {
        let api_key = env("ASKPIPE_OPENAI_API_KEY").or_else(|| env("OPENAI_API_KEY"));
        let base_url = env("ASKPIPE_OPENAI_BASE_URL")
            .or_else(|| env("OPENAI_BASE_URL"))
            .or_else(|| api_key.as_ref().map(|_| "https://api.openai.com".to_string()))
            .ok_or_else(|| {
                Error::NotConfigured(
                    "missing ASKPIPE_OPENAI_BASE_URL (or ASKPIPE_OPENAI_API_KEY)".to_string(),
                )
            })?;
        let model = model_override
            .or_else(|| env("ASKPIPE_OPENAI_MODEL"))
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        Ok(Self::new(client, base_url, api_key, model, timeout_ms))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_chat_completions(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        "openai_compat"
    }

    async fn complete(&self, req: &LlmRequest) -> Result<String> {
        let body = ChatCompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: req.prompt.clone(),
                },
            ],
            temperature: req.task.temperature(),
            stream: false,
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(Duration::from_millis(self.timeout_ms))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout_ms)
            } else {
                Error::Llm(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "openai_compat chat.completions HTTP {status}"
            )));
        }
        let parsed: ChatCompletionsResponse =
            resp.json().await.map_err(|e| Error::Llm(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        tracing::debug!(task = req.task.as_str(), chars = text.len(), "llm completion");
        Ok(text)
    }
}
