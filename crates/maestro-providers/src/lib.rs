use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use maestro_types::CoreError;

/// Provider failure classes surfaced to the fallback layer
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unknown: {0}")]
    Unknown(String),
}

impl From<LlmError> for CoreError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Transport(msg) => CoreError::Transport(msg),
            LlmError::RateLimited(msg) => CoreError::RateLimited(msg),
            LlmError::InvalidRequest(msg) => CoreError::InvalidParameters(msg),
            LlmError::Timeout(_) => CoreError::Timeout(30_000),
            LlmError::Unknown(msg) => CoreError::Internal(msg),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling options, passed through to the wire verbatim. Unset fields are
/// omitted from the request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Streaming token producer. `complete` is the concatenation of `stream`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: &LlmOptions,
        cancel: CancellationToken,
    ) -> Result<TokenStream, LlmError>;

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: &LlmOptions,
        cancel: CancellationToken,
    ) -> Result<String, LlmError> {
        let mut stream = self.stream(messages, options, cancel).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

// ============================================================================
// OpenAI-compatible provider
// ============================================================================

/// Chat-completion provider speaking the OpenAI-compatible SSE protocol.
pub struct OpenAiCompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: normalize_base(&base_url.into()),
            api_key,
            model: model.into(),
            client: Client::new(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], options: &LlmOptions) -> serde_json::Value {
        let wire_messages = messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
            "stream": true,
        });
        if let Ok(extra) = serde_json::to_value(options) {
            if let (Some(body_map), Some(extra_map)) = (body.as_object_mut(), extra.as_object()) {
                for (key, value) in extra_map {
                    if key != "stream" {
                        body_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: &LlmOptions,
        cancel: CancellationToken,
    ) -> Result<TokenStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&self.request_body(&messages, options));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = truncate_for_error(&text, 500);
            return Err(match status.as_u16() {
                429 => LlmError::RateLimited(detail),
                400..=499 => LlmError::InvalidRequest(format!("status {status}: {detail}")),
                _ => LlmError::Transport(format!("status {status}: {detail}")),
            });
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    break;
                }

                let chunk = chunk.map_err(LlmError::from)?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };

                        if let Some(detail) = extract_wire_error(&value) {
                            Err(LlmError::Transport(detail))?;
                        }

                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            if let Some(text) = choice
                                .get("delta")
                                .and_then(|d| d.get("content"))
                                .and_then(|v| v.as_str())
                            {
                                if !text.is_empty() {
                                    yield text.to_string();
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_wire_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

// ============================================================================
// Scripted provider (tests and offline runs)
// ============================================================================

/// One programmed provider turn
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Respond with this text, streamed in small chunks
    Text(String),
    /// Fail the call with this error
    Fail(LlmError),
}

/// Deterministic provider: pops one programmed turn per call. An exhausted
/// script is a test bug and surfaces as an `Unknown` error.
pub struct ScriptedProvider {
    turns: StdMutex<VecDeque<ScriptedTurn>>,
    chunk_size: usize,
    calls: StdMutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: StdMutex::new(turns.into()),
            chunk_size: 16,
            calls: StdMutex::new(Vec::new()),
        }
    }

    pub fn text(responses: &[&str]) -> Self {
        Self::new(
            responses
                .iter()
                .map(|r| ScriptedTurn::Text((*r).to_string()))
                .collect(),
        )
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().expect("script lock").push_back(turn);
    }

    /// Prompts observed so far, for assertions on prompt construction
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.calls.lock().expect("call lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().expect("script lock").len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _options: &LlmOptions,
        cancel: CancellationToken,
    ) -> Result<TokenStream, LlmError> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.calls.lock().expect("call lock").push(prompt);

        let turn = self
            .turns
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| LlmError::Unknown("scripted provider exhausted".to_string()))?;

        match turn {
            ScriptedTurn::Fail(err) => Err(err),
            ScriptedTurn::Text(text) => {
                let chunks = text
                    .as_bytes()
                    .chunks(self.chunk_size.max(1))
                    .map(|c| String::from_utf8_lossy(c).to_string())
                    .collect::<Vec<_>>();
                let stream = futures::stream::iter(chunks.into_iter().map(Ok::<String, LlmError>)).take_while(
                    move |_| {
                        let open = !cancel.is_cancelled();
                        async move { open }
                    },
                );
                Ok(Box::pin(stream))
            }
        }
    }
}
