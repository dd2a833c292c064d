//! Streaming chat protocol.
//!
//! Implements the per-session streaming turn behind a transport-agnostic
//! [`EventSink`]: the WebSocket (or any other) transport parses client
//! frames into [`ClientMessage`]s, hands them to the manager, and forwards
//! [`StreamEvent`]s back to the wire. The manager owns the protocol rules:
//! per-session turn locks, keepalive pongs, chunk forwarding, the
//! fall-back to a blocking completion when a stream ends in tool calls, and
//! the guarantee that partial assistant content is persisted even when the
//! client goes away mid-stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aria::chat_engine::{ChatEngine, TOOL_LOOP_MAX, TOOL_USE_CAP};
use crate::aria::context::estimate_tokens;
use crate::aria::error::EngineError;
use crate::aria::gateway::{CompletionRequest, LlmGateway};
use crate::aria::protection::SessionProtection;
use crate::aria::store::SessionStore;
use crate::aria::tools::{ToolBroker, ToolOutcome};
use crate::aria::types::{ChatMessage, MessageRole, Session, SessionStatus};

const DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Message {
        content: String,
        #[serde(default)]
        enable_thinking: bool,
        #[serde(default = "default_true")]
        enable_tools: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Server → client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart {
        session_id: Uuid,
    },
    Content {
        delta: String,
    },
    Thinking {
        delta: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        success: bool,
        content: String,
    },
    StreamEnd {
        message_id: Uuid,
        finish_reason: String,
        model: String,
        tokens_input: i64,
        tokens_output: i64,
        cost: f64,
    },
    Error {
        message: String,
    },
    Pong,
}

/// Where events go. Implemented over a concrete socket by the transport
/// layer; send failures mean the client is gone.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: StreamEvent) -> Result<(), EngineError>;
}

pub struct StreamingManager {
    store: Arc<SessionStore>,
    gateway: Arc<LlmGateway>,
    broker: Arc<ToolBroker>,
    chat: Arc<ChatEngine>,
    protection: Arc<SessionProtection>,
    ping_interval: Duration,
}

impl StreamingManager {
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<LlmGateway>,
        broker: Arc<ToolBroker>,
        chat: Arc<ChatEngine>,
        protection: Arc<SessionProtection>,
        ping_interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            broker,
            chat,
            protection,
            ping_interval,
        }
    }

    /// Validate the session at connection time. Ended sessions are
    /// reactivated so reconnects keep working.
    pub async fn prepare_session(&self, session_id: Uuid) -> Result<Session, EngineError> {
        let session = self.store.require_session(session_id).await?;
        if session.status == SessionStatus::Ended {
            debug!("reactivating ended session {} for reconnect", session_id);
            self.store
                .set_session_status(session_id, SessionStatus::Active)
                .await?;
            return self.store.require_session(session_id).await;
        }
        Ok(session)
    }

    /// Spawn the keepalive task: a pong every ping interval for as long as
    /// the connection lives. The caller aborts the handle on disconnect.
    pub fn spawn_keepalive(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let interval = self.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if sink.send(StreamEvent::Pong).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Handle one parsed client frame. Protocol errors are reported through
    /// the sink and the connection stays open.
    pub async fn handle_message(
        &self,
        session_id: Uuid,
        message: ClientMessage,
        sink: Arc<dyn EventSink>,
    ) -> Result<(), EngineError> {
        match message {
            ClientMessage::Ping => sink.send(StreamEvent::Pong).await,
            ClientMessage::Message {
                content,
                enable_thinking,
                enable_tools,
            } => {
                // One turn at a time per session, across all connections.
                let lock = self.protection.session_lock(session_id).await;
                let _guard = lock.lock().await;
                match self
                    .stream_turn(session_id, &content, enable_thinking, enable_tools, &sink)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("stream turn failed for session {}: {}", session_id, e);
                        sink.send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await
                    }
                }
            }
        }
    }

    async fn stream_turn(
        &self,
        session_id: Uuid,
        content: &str,
        enable_thinking: bool,
        enable_tools: bool,
        sink: &Arc<dyn EventSink>,
    ) -> Result<(), EngineError> {
        let session = self.store.require_session(session_id).await?;

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

        sink.send(StreamEvent::StreamStart { session_id }).await?;

        let turn_started = Instant::now();
        let mut outbound = self.build_outbound(&session).await?;
        let mut persisted: i64 = 1;
        let mut tool_uses: HashMap<String, usize> = HashMap::new();
        let mut total_input: i64 = 0;
        let mut total_output: i64 = 0;
        let mut total_cost: f64 = 0.0;
        let mut model_used = self
            .chat
            .primary_model(&session)
            .await
            .unwrap_or_default();
        let mut finish_reason = "stop".to_string();
        let mut final_content = String::new();
        let mut final_thinking: Option<String> = None;
        let mut client_gone = false;

        let schemas = if enable_tools {
            let schemas = self.broker.schemas().await;
            (!schemas.is_empty()).then_some(schemas)
        } else {
            None
        };

        for llm_call in 0..TOOL_LOOP_MAX {
            let request = CompletionRequest {
                messages: outbound.clone(),
                model: String::new(),
                temperature: session.temperature,
                max_tokens: session.max_tokens,
                tools: schemas.clone(),
                enable_thinking,
            };

            // Stream when the backend can; fall back to blocking otherwise.
            let mut streamed_content = String::new();
            let mut streamed_thinking = String::new();
            let mut stream_finish: Option<String> = None;
            let mut streamed = false;

            let stream_request = {
                let mut r = request.clone();
                r.model = model_used.clone();
                r
            };
            if !stream_request.model.is_empty() {
                if let Ok(Some(mut chunks)) = self.gateway.stream(&stream_request).await {
                    streamed = true;
                    model_used = stream_request.model.clone();
                    while let Some(chunk) = chunks.next().await {
                        match chunk {
                            Ok(chunk) => {
                                if !chunk.content.is_empty() {
                                    streamed_content.push_str(&chunk.content);
                                    if !client_gone
                                        && sink
                                            .send(StreamEvent::Content {
                                                delta: chunk.content,
                                            })
                                            .await
                                            .is_err()
                                    {
                                        // Client disconnected: keep consuming
                                        // so the turn persists.
                                        client_gone = true;
                                    }
                                }
                                if !chunk.thinking.is_empty() {
                                    streamed_thinking.push_str(&chunk.thinking);
                                    if !client_gone {
                                        let _ = sink
                                            .send(StreamEvent::Thinking {
                                                delta: chunk.thinking,
                                            })
                                            .await;
                                    }
                                }
                                if let Some(reason) = chunk.finish_reason {
                                    stream_finish = Some(reason);
                                }
                            }
                            Err(e) => {
                                warn!("stream interrupted: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            let wants_tools = stream_finish.as_deref() == Some("tool_calls");
            if streamed && !wants_tools {
                total_output += estimate_tokens(&streamed_content) as i64;
                finish_reason = stream_finish.unwrap_or_else(|| "stop".to_string());
                final_content = streamed_content;
                final_thinking =
                    (!streamed_thinking.is_empty()).then_some(streamed_thinking);
                break;
            }

            // Either streaming was unavailable or the stream ended in tool
            // calls: run a blocking completion to get structured calls.
            let (response, model) = self.chat.complete_with_fallback(&session, request).await?;
            model_used = model;
            total_input += response.usage.input_tokens as i64;
            total_output += response.usage.output_tokens as i64;
            total_cost += response.cost;

            let has_tools = response.finish_reason == "tool_calls"
                && !response.tool_calls.is_empty()
                && enable_tools;
            if !has_tools || llm_call == TOOL_LOOP_MAX - 1 {
                finish_reason = response.finish_reason;
                final_content = response.content;
                final_thinking = response.thinking;
                if !client_gone && !final_content.is_empty() {
                    let _ = sink
                        .send(StreamEvent::Content {
                            delta: final_content.clone(),
                        })
                        .await;
                }
                break;
            }

            // Intermediate assistant message lands before any tool runs so
            // results are never orphaned if the session dies mid-loop.
            let mut assistant =
                ChatMessage::new(session_id, MessageRole::Assistant, response.content.clone());
            assistant.thinking = response.thinking.clone();
            assistant.tool_calls = response.tool_calls.clone();
            assistant.model = Some(model_used.clone());
            self.store.insert_message(&assistant).await?;
            persisted += 1;
            outbound.push(assistant);

            for call in &response.tool_calls {
                if !client_gone {
                    let _ = sink
                        .send(StreamEvent::ToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .await;
                }

                let uses = tool_uses.entry(call.name.clone()).or_insert(0);
                let outcome = if *uses >= TOOL_USE_CAP {
                    ToolOutcome {
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

                if !client_gone {
                    let _ = sink
                        .send(StreamEvent::ToolResult {
                            tool_call_id: outcome.tool_call_id.clone(),
                            name: outcome.name.clone(),
                            success: outcome.success,
                            content: outcome.content.clone(),
                        })
                        .await;
                }

                let mut tool_message =
                    ChatMessage::new(session_id, MessageRole::Tool, outcome.content.clone());
                tool_message.tool_call_id = Some(call.id.clone());
                tool_message.latency_ms = outcome.duration_ms as i64;
                self.store.insert_message(&tool_message).await?;
                persisted += 1;
                outbound.push(tool_message);
            }
        }

        // Persist the final assistant message — including partial content
        // from an interrupted stream. Writes are never abandoned.
        let latency_ms = turn_started.elapsed().as_millis() as i64;
        let mut assistant = ChatMessage::new(session_id, MessageRole::Assistant, final_content);
        assistant.thinking = final_thinking;
        assistant.model = Some(model_used.clone());
        assistant.tokens_input = total_input;
        assistant.tokens_output = total_output;
        assistant.cost = total_cost;
        assistant.latency_ms = latency_ms;
        self.store.insert_message(&assistant).await?;
        persisted += 1;

        if let Err(e) = self
            .store
            .update_session_counters(session_id, persisted, total_input + total_output, total_cost)
            .await
        {
            warn!("counter update failed for session {}: {}", session_id, e);
        }

        if first_user_message {
            self.chat.maybe_auto_title(&session, &sanitized).await?;
        }

        if !client_gone {
            sink.send(StreamEvent::StreamEnd {
                message_id: assistant.id,
                finish_reason,
                model: model_used,
                tokens_input: total_input,
                tokens_output: total_output,
                cost: total_cost,
            })
            .await?;
        }
        Ok(())
    }

    async fn build_outbound(&self, session: &Session) -> Result<Vec<ChatMessage>, EngineError> {
        use crate::aria::context::{assemble, repair_tool_ordering};

        let history = self.store.get_messages(session.id).await?;
        let window = session.context_window.max(1) as usize;
        let recent = if history.len() > window {
            history[history.len() - window..].to_vec()
        } else {
            history
        };
        let budget = 16_384usize.max(session.max_tokens as usize * 2);
        let assembled = assemble(
            &recent,
            session.model.as_deref().unwrap_or("default"),
            budget,
            session.max_tokens as usize,
        )?;
        let mut outbound = repair_tool_ordering(assembled);
        if let Some(prompt) = &session.system_prompt {
            if !outbound.iter().any(|m| m.role == MessageRole::System) {
                outbound.insert(
                    0,
                    ChatMessage::new(session.id, MessageRole::System, prompt.clone()),
                );
            }
        }
        Ok(outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_deserialize() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let message: ClientMessage = serde_json::from_str(
            r#"{"type":"message","content":"hi","enable_thinking":true}"#,
        )
        .unwrap();
        match message {
            ClientMessage::Message {
                content,
                enable_thinking,
                enable_tools,
            } => {
                assert_eq!(content, "hi");
                assert!(enable_thinking);
                assert!(enable_tools); // defaulted
            }
            _ => panic!("expected message frame"),
        }
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = StreamEvent::Content {
            delta: "hel".to_string(),
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["type"], "content");
        assert_eq!(raw["delta"], "hel");

        let end = StreamEvent::StreamEnd {
            message_id: Uuid::nil(),
            finish_reason: "stop".to_string(),
            model: "main".to_string(),
            tokens_input: 10,
            tokens_output: 5,
            cost: 0.0,
        };
        let raw = serde_json::to_value(&end).unwrap();
        assert_eq!(raw["type"], "stream_end");
        assert_eq!(raw["finish_reason"], "stop");
    }

    #[test]
    fn unknown_client_frame_is_a_parse_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }
}
