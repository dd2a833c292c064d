//! LLM gateway adapter.
//!
//! The runtime never talks to a provider directly. Everything goes through
//! [`LlmGateway`], which resolves model aliases against the catalog, applies
//! a per-gateway circuit breaker, and normalizes responses (native tool
//! calls, token usage, reasoning extraction). The actual transport lives
//! behind the [`LlmBackend`] trait so tests can substitute deterministic
//! mock backends; the default implementation, [`HttpBackend`], speaks the
//! OpenAI-compatible chat-completions wire format of a LiteLLM proxy.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::aria::catalog::ModelCatalog;
use crate::aria::error::EngineError;
use crate::aria::types::{ChatMessage, MessageRole, ToolCall};

/// Consecutive failures that trip the breaker.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the breaker stays open once tripped.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

lazy_static! {
    /// Shared HTTP client with persistent connection pooling. A single
    /// client keeps TLS sessions and DNS lookups warm across the many
    /// concurrent requests a busy pool issues.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::ClientBuilder::new()
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(300))
        .build()
        .expect("http client");

    static ref THINK_TAG: Regex =
        Regex::new(r"(?s)<think>(.*?)</think>").expect("static think pattern");
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Provider-agnostic tool schema forwarded with a request.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters: serde_json::Value,
}

/// A fully-specified completion request. `model` is an alias until the
/// gateway resolves it.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tools: Option<Vec<ToolSchema>>,
    pub enable_thinking: bool,
}

/// Normalized provider response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    /// Reasoning text, either from a dedicated response field or extracted
    /// from inline `<think>` tags.
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
    /// Billing figure when the proxy reports one; 0.0 otherwise.
    pub cost: f64,
}

/// One incremental piece of a streaming response.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    pub thinking: String,
    pub finish_reason: Option<String>,
}

/// Stream of chunks compatible with `Send` executors.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, EngineError>> + Send>>;

/// Transport abstraction for a concrete LLM service.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Blocking request/response completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError>;

    /// Streaming completion. Backends without streaming support inherit the
    /// default, which resolves to `Ok(None)`; callers then fall back to
    /// [`complete`](LlmBackend::complete).
    async fn stream(
        &self,
        _request: &CompletionRequest,
    ) -> Result<Option<ChunkStream>, EngineError> {
        Ok(None)
    }
}

/// Split inline `<think>` reasoning out of response content.
///
/// Returns the content with all think blocks removed plus the captured
/// reasoning, if any block was present.
pub fn extract_thinking(content: &str) -> (String, Option<String>) {
    if !THINK_TAG.is_match(content) {
        return (content.to_string(), None);
    }
    let mut thinking = String::new();
    for captures in THINK_TAG.captures_iter(content) {
        if !thinking.is_empty() {
            thinking.push('\n');
        }
        thinking.push_str(captures[1].trim());
    }
    let stripped = THINK_TAG.replace_all(content, "").trim().to_string();
    (stripped, Some(thinking))
}

#[derive(Debug)]
struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
        }
    }

    fn check(&mut self) -> Result<(), EngineError> {
        if let Some(until) = self.open_until {
            if Instant::now() < until {
                return Err(EngineError::CircuitOpen);
            }
            // Cooldown elapsed: half-open, let the next call probe.
            self.open_until = None;
            self.consecutive_failures = 0;
        }
        Ok(())
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BREAKER_THRESHOLD {
            warn!(
                "llm gateway circuit opened after {} consecutive failures",
                self.consecutive_failures
            );
            self.open_until = Some(Instant::now() + BREAKER_COOLDOWN);
        }
    }
}

/// Gateway wrapper: alias resolution + circuit breaking + normalization.
pub struct LlmGateway {
    backend: Arc<dyn LlmBackend>,
    catalog: ModelCatalog,
    breaker: Mutex<CircuitBreaker>,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn LlmBackend>, catalog: ModelCatalog) -> Self {
        Self {
            backend,
            catalog,
            breaker: Mutex::new(CircuitBreaker::new()),
        }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Whether the breaker currently admits calls. The heartbeat subsystem
    /// reads this as the gateway health flag.
    pub async fn is_healthy(&self) -> bool {
        let breaker = self.breaker.lock().await;
        match breaker.open_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    /// Run a blocking completion through the breaker, then extract inline
    /// reasoning if the backend did not surface a dedicated field.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        self.breaker.lock().await.check()?;

        let resolved = self.resolve(request);
        debug!("llm complete: model={} messages={}", resolved.model, resolved.messages.len());

        match self.backend.complete(&resolved).await {
            Ok(mut response) => {
                self.breaker.lock().await.record_success();
                if response.thinking.is_none() {
                    let (content, thinking) = extract_thinking(&response.content);
                    if thinking.is_some() {
                        response.content = content;
                        response.thinking = thinking;
                    }
                }
                Ok(response)
            }
            Err(e) => {
                self.breaker.lock().await.record_failure();
                Err(e)
            }
        }
    }

    /// Open a streaming completion through the breaker. Returns `None` when
    /// the backend cannot stream; callers fall back to [`complete`].
    pub async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<Option<ChunkStream>, EngineError> {
        self.breaker.lock().await.check()?;

        let resolved = self.resolve(request);
        match self.backend.stream(&resolved).await {
            Ok(stream) => {
                self.breaker.lock().await.record_success();
                Ok(stream)
            }
            Err(e) => {
                self.breaker.lock().await.record_failure();
                Err(e)
            }
        }
    }

    fn resolve(&self, request: &CompletionRequest) -> CompletionRequest {
        let mut resolved = request.clone();
        resolved.model = self.catalog.resolve(&request.model).to_string();
        resolved
    }
}

/// Serialize messages into the OpenAI-compatible wire shape. Coordination
/// roles (`round-N`, `swarm-N`, `synthesis`, `consensus`) travel as
/// assistant messages — their provenance lives in the persisted transcript,
/// not on the wire.
pub fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|message| {
            let role = match &message.role {
                MessageRole::User => "user",
                MessageRole::System => "system",
                MessageRole::Tool => "tool",
                _ => "assistant",
            };
            let mut wire = serde_json::json!({
                "role": role,
                "content": message.content,
            });
            if let Some(call_id) = &message.tool_call_id {
                wire["tool_call_id"] = serde_json::json!(call_id);
            }
            if !message.tool_calls.is_empty() {
                wire["tool_calls"] = serde_json::json!(message
                    .tool_calls
                    .iter()
                    .map(|tc| serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    }))
                    .collect::<Vec<_>>());
            }
            wire
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HTTP backend (LiteLLM / OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
    #[serde(default)]
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
}

/// Backend speaking the OpenAI-compatible chat completions surface of a
/// LiteLLM proxy over the shared pooled HTTP client.
pub struct HttpBackend {
    base_url: String,
    api_key: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            api_key: api_key.into(),
        }
    }

    fn request_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": wire_messages(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::json!(tools
                    .iter()
                    .map(|t| serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    }))
                    .collect::<Vec<_>>());
            }
        }
        if request.enable_thinking {
            body["enable_thinking"] = serde_json::json!(true);
        }
        body
    }

    fn builder(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut builder = SHARED_HTTP_CLIENT
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        builder
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        let body = self.request_body(request, false);
        let response = self
            .builder(&body)
            .send()
            .await
            .map_err(|e| EngineError::Llm(format!("gateway request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Llm(format!(
                "gateway returned {}: {}",
                status, detail
            )));
        }

        let completion: WireCompletion = response
            .json()
            .await
            .map_err(|e| EngineError::Llm(format!("unparseable gateway response: {}", e)))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Llm("gateway response had no choices".to_string()))?;

        let usage = completion.usage.unwrap_or(WireUsage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: None,
        });

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            thinking: choice.message.reasoning_content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: tc.function.arguments,
                })
                .collect(),
            model: completion.model.unwrap_or_else(|| request.model.clone()),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
            cost: usage.cost.unwrap_or(0.0),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<Option<ChunkStream>, EngineError> {
        let body = self.request_body(request, true);
        let response = self
            .builder(&body)
            .send()
            .await
            .map_err(|e| EngineError::Llm(format!("gateway stream request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Llm(format!(
                "gateway returned {}: {}",
                status, detail
            )));
        }

        struct SseState {
            body: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
            buffer: String,
            done: bool,
        }

        let state = SseState {
            body: Box::pin(response.bytes_stream()),
            buffer: String::new(),
            done: false,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                // Drain complete SSE lines already buffered.
                if let Some(newline) = state.buffer.find('\n') {
                    let line = state.buffer[..newline].trim().to_string();
                    state.buffer.drain(..=newline);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        state.done = true;
                        return None;
                    }
                    match serde_json::from_str::<WireStreamEvent>(data) {
                        Ok(event) => {
                            let Some(choice) = event.choices.into_iter().next() else {
                                continue;
                            };
                            let delta = choice.delta.unwrap_or(WireDelta {
                                content: None,
                                reasoning_content: None,
                            });
                            let chunk = StreamChunk {
                                content: delta.content.unwrap_or_default(),
                                thinking: delta.reasoning_content.unwrap_or_default(),
                                finish_reason: choice.finish_reason,
                            };
                            return Some((Ok(chunk), state));
                        }
                        Err(e) => {
                            return Some((
                                Err(EngineError::Llm(format!("bad stream event: {}", e))),
                                state,
                            ));
                        }
                    }
                }
                // Need more bytes.
                match state.body.next().await {
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(EngineError::Llm(format!("stream interrupted: {}", e))),
                            state,
                        ));
                    }
                    None => return None,
                }
            }
        });

        Ok(Some(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aria::types::ChatMessage;
    use uuid::Uuid;

    struct FlakyBackend {
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LlmBackend for FlakyBackend {
        async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EngineError::Llm("backend down".to_string()));
            }
            Ok(LlmResponse {
                content: "ok".to_string(),
                thinking: None,
                tool_calls: Vec::new(),
                model: request.model.clone(),
                finish_reason: "stop".to_string(),
                usage: TokenUsage::default(),
                cost: 0.0,
            })
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage::new(Uuid::new_v4(), MessageRole::User, "hi")],
            model: "main".to_string(),
            temperature: 0.7,
            max_tokens: 256,
            tools: None,
            enable_thinking: false,
        }
    }

    #[test]
    fn extracts_inline_thinking() {
        let (content, thinking) =
            extract_thinking("<think>weighing options</think>The answer is 4.");
        assert_eq!(content, "The answer is 4.");
        assert_eq!(thinking.as_deref(), Some("weighing options"));
    }

    #[test]
    fn leaves_plain_content_alone() {
        let (content, thinking) = extract_thinking("just an answer");
        assert_eq!(content, "just an answer");
        assert!(thinking.is_none());
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold() {
        let backend = Arc::new(FlakyBackend {
            fail: std::sync::atomic::AtomicBool::new(true),
        });
        let gateway = LlmGateway::new(backend.clone(), ModelCatalog::empty());

        for _ in 0..BREAKER_THRESHOLD {
            let err = gateway.complete(&request()).await.unwrap_err();
            assert!(matches!(err, EngineError::Llm(_)));
        }
        // Breaker is now open: the backend is no longer consulted.
        backend.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        let err = gateway.complete(&request()).await.unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen));
        assert!(!gateway.is_healthy().await);
    }

    #[tokio::test]
    async fn success_resets_the_breaker() {
        let backend = Arc::new(FlakyBackend {
            fail: std::sync::atomic::AtomicBool::new(true),
        });
        let gateway = LlmGateway::new(backend.clone(), ModelCatalog::empty());

        for _ in 0..(BREAKER_THRESHOLD - 1) {
            let _ = gateway.complete(&request()).await;
        }
        backend.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(gateway.complete(&request()).await.is_ok());
        assert!(gateway.is_healthy().await);
    }

    #[test]
    fn wire_messages_carry_tool_plumbing() {
        let session = Uuid::new_v4();
        let mut assistant = ChatMessage::new(session, MessageRole::Assistant, "");
        assistant.tool_calls = vec![ToolCall {
            id: "call_1".to_string(),
            name: "memory__search".to_string(),
            arguments: "{\"query\":\"x\"}".to_string(),
        }];
        let mut tool = ChatMessage::new(session, MessageRole::Tool, "{\"hits\":[]}");
        tool.tool_call_id = Some("call_1".to_string());

        let wire = wire_messages(&[assistant, tool]);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "memory__search");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn coordination_roles_travel_as_assistant() {
        let session = Uuid::new_v4();
        let wire = wire_messages(&[ChatMessage::new(session, MessageRole::Round(2), "turn")]);
        assert_eq!(wire[0]["role"], "assistant");
    }
}
