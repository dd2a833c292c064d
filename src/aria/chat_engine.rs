//! Chat engine: one full non-streaming message turn, plus session CRUD.
//!
//! A turn is: load the session, take its advisory lock, dedup-guard the
//! input, persist the user message, assemble a repaired context from the
//! database, then loop the LLM with tools (bounded iterations, per-tool
//! failure caps, fallback chain on gateway errors) and persist everything
//! as it happens. Counters are updated in a separate transaction afterwards
//! so a deadlock on the session row can never roll back a message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, warn};
use serde_json::json;
use uuid::Uuid;

use crate::aria::config::EngineConfig;
use crate::aria::context::{assemble, repair_tool_ordering};
use crate::aria::error::EngineError;
use crate::aria::gateway::{CompletionRequest, LlmGateway, LlmResponse};
use crate::aria::protection::SessionProtection;
use crate::aria::router::Router;
use crate::aria::store::{SessionFilter, SessionStore};
use crate::aria::tools::ToolBroker;
use crate::aria::types::{
    ChatMessage, ChatOutcome, MessageRole, Session, SessionStatus, SessionType,
};

/// Maximum LLM calls per turn.
pub const TOOL_LOOP_MAX: usize = 10;
/// Executions of one tool per turn before further calls are refused.
pub const TOOL_USE_CAP: usize = 3;
/// Identical user messages inside this window are rejected.
const DEDUP_WINDOW: Duration = Duration::from_secs(5);
/// Token budget available for assembled context; the session's
/// `max_tokens` is reserved out of it for the response.
const CONTEXT_TOKEN_BUDGET: usize = 16_384;
/// Auto-titles are capped at this many characters.
const TITLE_MAX: usize = 80;

/// Parameters for creating a session; unset fields take engine defaults.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub agent_id: String,
    pub session_type: Option<SessionType>,
    pub title: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub context_window: Option<u32>,
    pub system_prompt: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

pub struct ChatEngine {
    store: Arc<SessionStore>,
    gateway: Arc<LlmGateway>,
    broker: Arc<ToolBroker>,
    router: Arc<Router>,
    protection: Arc<SessionProtection>,
    defaults: EngineConfig,
}

impl ChatEngine {
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<LlmGateway>,
        broker: Arc<ToolBroker>,
        router: Arc<Router>,
        protection: Arc<SessionProtection>,
        defaults: EngineConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            broker,
            router,
            protection,
            defaults,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    // -----------------------------------------------------------------
    // Session CRUD
    // -----------------------------------------------------------------

    pub async fn create_session(&self, request: NewSession) -> Result<Session, EngineError> {
        if request.agent_id.is_empty() {
            return Err(EngineError::Validation("agent_id is required".to_string()));
        }
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            agent_id: request.agent_id,
            session_type: request.session_type.unwrap_or(SessionType::Chat),
            title: request.title,
            model: request.model,
            temperature: request
                .temperature
                .unwrap_or(self.defaults.default_temperature),
            max_tokens: request.max_tokens.unwrap_or(self.defaults.default_max_tokens),
            context_window: request
                .context_window
                .unwrap_or(self.defaults.default_context_window),
            system_prompt: request.system_prompt,
            status: SessionStatus::Active,
            message_count: 0,
            total_tokens: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
            ended_at: None,
            metadata: request.metadata.unwrap_or(serde_json::Value::Null),
        };
        self.store.create_session(&session).await?;
        Ok(session)
    }

    /// Load a session together with its full history.
    pub async fn resume_session(
        &self,
        session_id: Uuid,
    ) -> Result<(Session, Vec<ChatMessage>), EngineError> {
        let session = self.store.require_session(session_id).await?;
        let messages = self.store.get_messages(session_id).await?;
        Ok((session, messages))
    }

    /// Soft-end a session; history stays.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), EngineError> {
        self.store
            .set_session_status(session_id, SessionStatus::Ended)
            .await
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), EngineError> {
        self.store.delete_session(session_id).await
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, EngineError> {
        self.store.list_sessions(filter).await
    }

    // -----------------------------------------------------------------
    // The turn
    // -----------------------------------------------------------------

    /// Run one non-streaming message turn.
    pub async fn send_message(
        &self,
        session_id: Uuid,
        content: &str,
        enable_thinking: bool,
        enable_tools: bool,
    ) -> Result<ChatOutcome, EngineError> {
        let session = self.store.require_session(session_id).await?;

        // Serialize turns within a session.
        let lock = self.protection.session_lock(session_id).await;
        let _guard = lock.lock().await;

        if self
            .store
            .recent_duplicate_exists(session_id, content, DEDUP_WINDOW)
            .await?
        {
            return Err(EngineError::Validation(
                "duplicate message within dedup window".to_string(),
            ));
        }

        let message_count = self.store.count_messages(session_id).await?;
        let sanitized = self
            .protection
            .preflight(session_id, &session.agent_id, "user", content, message_count)
            .await?;
        let first_user_message = message_count == 0;

        let user_message = ChatMessage::new(session_id, MessageRole::User, sanitized.clone());
        self.store.insert_message(&user_message).await?;

        // Build the outbound context from the database, including the user
        // message just flushed.
        let history = self.store.get_messages(session_id).await?;
        let window = session.context_window.max(1) as usize;
        let recent = if history.len() > window {
            history[history.len() - window..].to_vec()
        } else {
            history
        };
        let model_for_counting = session.model.as_deref().unwrap_or("default");
        // Never let an oversized response reservation zero out the context.
        let budget = CONTEXT_TOKEN_BUDGET.max(session.max_tokens as usize * 2);
        let assembled = assemble(
            &recent,
            model_for_counting,
            budget,
            session.max_tokens as usize,
        )?;
        let mut outbound = repair_tool_ordering(assembled);
        if let Some(prompt) = &session.system_prompt {
            if !outbound.iter().any(|m| m.role == MessageRole::System) {
                outbound.insert(
                    0,
                    ChatMessage::new(session_id, MessageRole::System, prompt.clone()),
                );
            }
        }

        let turn_started = Instant::now();
        let mut tool_iterations = 0usize;
        let mut persisted_in_turn: i64 = 1; // the user message
        let mut tool_uses: HashMap<String, usize> = HashMap::new();
        let mut collected_tool_calls = Vec::new();
        let mut collected_results: HashMap<String, serde_json::Value> = HashMap::new();
        let mut total_input: i64 = 0;
        let mut total_output: i64 = 0;
        let mut total_cost: f64 = 0.0;

        let schemas = if enable_tools {
            let schemas = self.broker.schemas().await;
            if schemas.is_empty() {
                None
            } else {
                Some(schemas)
            }
        } else {
            None
        };

        let mut final_response: Option<(LlmResponse, String)> = None;

        for llm_call in 0..TOOL_LOOP_MAX {
            let request = CompletionRequest {
                messages: outbound.clone(),
                model: String::new(), // filled per fallback-chain entry
                temperature: session.temperature,
                max_tokens: session.max_tokens,
                tools: schemas.clone(),
                enable_thinking,
            };
            let (response, model_used) = self.complete_with_fallback(&session, request).await?;

            total_input += response.usage.input_tokens as i64;
            total_output += response.usage.output_tokens as i64;
            total_cost += response.cost;

            let wants_tools = response.finish_reason == "tool_calls"
                && !response.tool_calls.is_empty()
                && enable_tools;
            if !wants_tools || llm_call == TOOL_LOOP_MAX - 1 {
                final_response = Some((response, model_used));
                break;
            }

            tool_iterations += 1;

            // Persist the intermediate assistant message so its results are
            // never orphaned.
            let mut assistant = ChatMessage::new(
                session_id,
                MessageRole::Assistant,
                response.content.clone(),
            );
            assistant.thinking = response.thinking.clone();
            assistant.tool_calls = response.tool_calls.clone();
            assistant.model = Some(model_used.clone());
            assistant.tokens_input = response.usage.input_tokens as i64;
            assistant.tokens_output = response.usage.output_tokens as i64;
            self.store.insert_message(&assistant).await?;
            persisted_in_turn += 1;
            outbound.push(assistant);

            for call in &response.tool_calls {
                collected_tool_calls.push(call.clone());
                let uses = tool_uses.entry(call.name.clone()).or_insert(0);
                let outcome = if *uses >= TOOL_USE_CAP {
                    // Synthesize a refusal; do not run the tool again.
                    crate::aria::tools::ToolOutcome {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        content: json!({
                            "error": format!(
                                "tool {} already ran {} times this turn; do not call it again",
                                call.name, TOOL_USE_CAP
                            )
                        })
                        .to_string(),
                        success: false,
                        duration_ms: 0,
                    }
                } else {
                    *uses += 1;
                    self.broker.dispatch(call).await
                };

                collected_results.insert(
                    call.id.clone(),
                    serde_json::from_str(&outcome.content)
                        .unwrap_or(serde_json::Value::String(outcome.content.clone())),
                );

                let mut tool_message =
                    ChatMessage::new(session_id, MessageRole::Tool, outcome.content.clone());
                tool_message.tool_call_id = Some(call.id.clone());
                tool_message.latency_ms = outcome.duration_ms as i64;
                self.store.insert_message(&tool_message).await?;
                persisted_in_turn += 1;
                outbound.push(tool_message);
            }
        }

        let (response, model_used) = final_response
            .ok_or_else(|| EngineError::Llm("tool loop produced no response".to_string()))?;
        let latency_ms = turn_started.elapsed().as_millis() as i64;

        let mut assistant = ChatMessage::new(session_id, MessageRole::Assistant, response.content.clone());
        assistant.thinking = response.thinking.clone();
        assistant.model = Some(model_used.clone());
        assistant.tool_results = collected_results.clone();
        assistant.tokens_input = response.usage.input_tokens as i64;
        assistant.tokens_output = response.usage.output_tokens as i64;
        assistant.cost = response.cost;
        assistant.latency_ms = latency_ms;
        self.store.insert_message(&assistant).await?;
        persisted_in_turn += 1;

        // Counters run in their own transaction: message persistence above
        // must survive even if this update deadlocks.
        if let Err(e) = self
            .store
            .update_session_counters(
                session_id,
                persisted_in_turn,
                total_input + total_output,
                total_cost,
            )
            .await
        {
            warn!("counter update failed for session {}: {}", session_id, e);
        }

        if first_user_message {
            self.maybe_auto_title(&session, &sanitized).await?;
        }

        debug!(
            "turn complete: session={} iterations={} latency={}ms",
            session_id, tool_iterations, latency_ms
        );

        Ok(ChatOutcome {
            message_id: assistant.id,
            content: response.content,
            thinking: response.thinking,
            tool_calls: collected_tool_calls,
            tool_results: collected_results,
            model: model_used,
            tokens_input: total_input,
            tokens_output: total_output,
            cost: total_cost,
            latency_ms,
            finish_reason: response.finish_reason,
        })
    }

    /// The model a session's turns start with: its own override, or the
    /// head of the owning agent's fallback chain.
    pub(crate) async fn primary_model(&self, session: &Session) -> Result<String, EngineError> {
        if let Some(model) = &session.model {
            return Ok(model.clone());
        }
        let chain = self.router.fallback_chain(&session.agent_id).await?;
        Ok(chain[0].1.clone())
    }

    /// Call the gateway, walking the router's fallback chain on error. The
    /// session's model override is always tried first.
    pub(crate) async fn complete_with_fallback(
        &self,
        session: &Session,
        mut request: CompletionRequest,
    ) -> Result<(LlmResponse, String), EngineError> {
        let mut models: Vec<String> = Vec::new();
        if let Some(model) = &session.model {
            models.push(model.clone());
        }
        match self.router.fallback_chain(&session.agent_id).await {
            Ok(chain) => {
                for (_, model) in chain {
                    if !models.contains(&model) {
                        models.push(model);
                    }
                }
            }
            Err(e) => {
                if models.is_empty() {
                    return Err(e);
                }
            }
        }

        let mut last_error = None;
        for model in models {
            request.model = model.clone();
            match self.gateway.complete(&request).await {
                Ok(response) => return Ok((response, model)),
                Err(EngineError::CircuitOpen) => return Err(EngineError::CircuitOpen),
                Err(e) => {
                    warn!("model {} failed, trying next in chain: {}", model, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::Llm("fallback chain exhausted".to_string())))
    }

    // -----------------------------------------------------------------
    // Auto-title
    // -----------------------------------------------------------------

    /// Set a derived title on an untitled session. Sessions that already
    /// carry a real (non-placeholder) title are left alone.
    pub(crate) async fn maybe_auto_title(
        &self,
        session: &Session,
        first_user_content: &str,
    ) -> Result<(), EngineError> {
        if let Some(existing) = &session.title {
            if !existing.starts_with("Session ") {
                return Ok(());
            }
        }
        let title = derive_title(first_user_content);
        self.store.set_session_title(session.id, &title).await
    }
}

/// Derive a session title from the first user message: first line, trimmed,
/// whitespace collapsed, capped at 80 characters with an ellipsis. Empty
/// input falls back to a timestamp placeholder.
pub fn derive_title(content: &str) -> String {
    let first_line = content.trim().lines().next().unwrap_or("");
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return format!("Session {}", Utc::now().format("%Y-%m-%d %H:%M"));
    }
    if collapsed.chars().count() > TITLE_MAX {
        let truncated: String = collapsed.chars().take(TITLE_MAX).collect();
        format!("{}…", truncated.trim_end())
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_takes_first_line_and_collapses_whitespace() {
        assert_eq!(
            derive_title("  Deploy   the\tservice\nand then some"),
            "Deploy the service"
        );
    }

    #[test]
    fn title_caps_at_eighty_chars_with_ellipsis() {
        let long = "word ".repeat(40);
        let title = derive_title(&long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= TITLE_MAX + 1);
    }

    #[test]
    fn empty_input_falls_back_to_timestamp_placeholder() {
        assert!(derive_title("   \n  ").starts_with("Session "));
    }
}
