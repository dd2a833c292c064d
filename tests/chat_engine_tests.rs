use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use aria::catalog::ModelCatalog;
use aria::chat_engine::{ChatEngine, NewSession};
use aria::config::EngineConfig;
use aria::error::EngineError;
use aria::gateway::{CompletionRequest, LlmBackend, LlmGateway, LlmResponse, TokenUsage};
use aria::protection::SessionProtection;
use aria::router::Router;
use aria::store::SessionStore;
use aria::tools::{InMemorySkillRegistry, SkillMethod, ToolBroker};
use aria::types::{AgentState, MessageRole, ToolCall};

/// Backend that always demands the same tool, forever.
struct ToolHungryBackend {
    llm_calls: AtomicUsize,
}

#[async_trait]
impl LlmBackend for ToolHungryBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        let call_number = self.llm_calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmResponse {
            content: format!("still need the lookup (call {})", call_number),
            thinking: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{}", call_number),
                name: "memory__lookup".to_string(),
                arguments: json!({"query": "state"}).to_string(),
            }],
            model: request.model.clone(),
            finish_reason: "tool_calls".to_string(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            },
            cost: 0.0,
        })
    }
}

/// Backend that answers plainly.
struct PlainBackend {
    reply: String,
}

#[async_trait]
impl LlmBackend for PlainBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        Ok(LlmResponse {
            content: self.reply.clone(),
            thinking: None,
            tool_calls: Vec::new(),
            model: request.model.clone(),
            finish_reason: "stop".to_string(),
            usage: TokenUsage {
                input_tokens: 8,
                output_tokens: 4,
                total_tokens: 12,
            },
            cost: 0.001,
        })
    }
}

/// Backend that fails for one model and succeeds for another.
struct PickyBackend {
    bad_model: String,
}

#[async_trait]
impl LlmBackend for PickyBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        if request.model == self.bad_model {
            return Err(EngineError::Llm(format!("{} is down", request.model)));
        }
        Ok(LlmResponse {
            content: format!("answered by {}", request.model),
            thinking: None,
            tool_calls: Vec::new(),
            model: request.model.clone(),
            finish_reason: "stop".to_string(),
            usage: TokenUsage::default(),
            cost: 0.0,
        })
    }
}

struct Harness {
    store: Arc<SessionStore>,
    chat: Arc<ChatEngine>,
    tool_executions: Arc<AtomicUsize>,
}

async fn harness(backend: Arc<dyn LlmBackend>) -> Harness {
    let store = Arc::new(SessionStore::connect("sqlite::memory:").await.unwrap());

    let mut main_agent = AgentState::new("main", "Main", "mock-model");
    main_agent.fallback_model = Some("mock-fallback".to_string());
    store.upsert_agent(&main_agent).await.unwrap();

    let registry = InMemorySkillRegistry::new();
    let tool_executions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&tool_executions);
    registry
        .register(
            SkillMethod {
                skill: "memory".to_string(),
                method: "lookup".to_string(),
                description: "Look up stored state".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            Arc::new(move |_args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"found": true}))
            }),
        )
        .await;

    let gateway = Arc::new(LlmGateway::new(backend, ModelCatalog::empty()));
    let broker = Arc::new(ToolBroker::new(Arc::new(registry)));
    let router = Arc::new(Router::new(Arc::clone(&store)));
    let protection = Arc::new(SessionProtection::new());
    let chat = Arc::new(ChatEngine::new(
        Arc::clone(&store),
        gateway,
        broker,
        router,
        protection,
        EngineConfig::default(),
    ));

    Harness {
        store,
        chat,
        tool_executions,
    }
}

#[tokio::test]
async fn tool_loop_terminates_with_caps() {
    let backend = Arc::new(ToolHungryBackend {
        llm_calls: AtomicUsize::new(0),
    });
    let h = harness(backend.clone()).await;

    let session = h
        .chat
        .create_session(NewSession {
            agent_id: "main".to_string(),
            ..NewSession::default()
        })
        .await
        .unwrap();

    let outcome = h
        .chat
        .send_message(session.id, "look everything up", false, true)
        .await
        .unwrap();

    // Exactly ten LLM calls, exactly three real tool executions; every
    // further request got a synthesized refusal.
    assert_eq!(backend.llm_calls.load(Ordering::SeqCst), 10);
    assert_eq!(h.tool_executions.load(Ordering::SeqCst), 3);
    assert!(outcome.content.contains("call 9"));

    // Final assistant message is persisted with the last content.
    let messages = h.store.get_messages(session.id).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, MessageRole::Assistant);
    assert!(last.content.contains("call 9"));
    // user + 9 × (assistant + tool result) + final assistant
    assert_eq!(messages.len(), 20);

    let refreshed = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(refreshed.message_count, 20);
    assert!(refreshed.updated_at >= refreshed.created_at);
}

#[tokio::test]
async fn plain_turn_persists_and_titles() {
    let h = harness(Arc::new(PlainBackend {
        reply: "The build is green.".to_string(),
    }))
    .await;

    let session = h
        .chat
        .create_session(NewSession {
            agent_id: "main".to_string(),
            ..NewSession::default()
        })
        .await
        .unwrap();

    let outcome = h
        .chat
        .send_message(session.id, "Is the build green?", false, true)
        .await
        .unwrap();
    assert_eq!(outcome.content, "The build is green.");
    assert_eq!(outcome.finish_reason, "stop");
    assert_eq!(outcome.model, "mock-model");

    let refreshed = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(refreshed.title.as_deref(), Some("Is the build green?"));
    assert_eq!(refreshed.message_count, 2);
    assert_eq!(refreshed.total_tokens, 12);
}

#[tokio::test]
async fn existing_titles_are_not_overwritten() {
    let h = harness(Arc::new(PlainBackend {
        reply: "ok".to_string(),
    }))
    .await;

    let session = h
        .chat
        .create_session(NewSession {
            agent_id: "main".to_string(),
            title: Some("Handpicked title".to_string()),
            ..NewSession::default()
        })
        .await
        .unwrap();
    h.chat
        .send_message(session.id, "first message", false, false)
        .await
        .unwrap();

    let refreshed = h.store.get_session(session.id).await.unwrap().unwrap();
    assert_eq!(refreshed.title.as_deref(), Some("Handpicked title"));
}

#[tokio::test]
async fn duplicate_messages_are_rejected_inside_the_window() {
    let h = harness(Arc::new(PlainBackend {
        reply: "ok".to_string(),
    }))
    .await;

    let session = h
        .chat
        .create_session(NewSession {
            agent_id: "main".to_string(),
            ..NewSession::default()
        })
        .await
        .unwrap();

    h.chat
        .send_message(session.id, "ping the deploy", false, false)
        .await
        .unwrap();
    let err = h
        .chat
        .send_message(session.id, "ping the deploy", false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn unknown_session_fails_cleanly() {
    let h = harness(Arc::new(PlainBackend {
        reply: "ok".to_string(),
    }))
    .await;
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        h.chat.send_message(missing, "hello", false, false).await,
        Err(EngineError::SessionNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn llm_errors_walk_the_fallback_chain() {
    let h = harness(Arc::new(PickyBackend {
        bad_model: "mock-model".to_string(),
    }))
    .await;

    let session = h
        .chat
        .create_session(NewSession {
            agent_id: "main".to_string(),
            ..NewSession::default()
        })
        .await
        .unwrap();

    let outcome = h
        .chat
        .send_message(session.id, "who answers this?", false, false)
        .await
        .unwrap();
    assert_eq!(outcome.model, "mock-fallback");
    assert_eq!(outcome.content, "answered by mock-fallback");
}
