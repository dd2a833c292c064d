use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use aria::agent_pool::AgentPool;
use aria::catalog::ModelCatalog;
use aria::error::EngineError;
use aria::gateway::{CompletionRequest, LlmBackend, LlmGateway, LlmResponse, TokenUsage};
use aria::router::Router;
use aria::store::SessionStore;
use aria::swarm::{Swarm, SwarmConfig};
use aria::types::{AgentState, MessageRole};

/// Votes agree with high confidence on every call; writes a plain merge
/// when asked for the consensus.
struct AgreeableBackend {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmBackend for AgreeableBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let consensus_turn = request
            .messages
            .iter()
            .any(|m| m.content.contains("writing the consensus"));
        let content = if consensus_turn {
            "Consensus: ship today, monitor error budgets closely.".to_string()
        } else {
            "Ship it. [VOTE: agree] [CONFIDENCE: 0.9]".to_string()
        };
        Ok(LlmResponse {
            content,
            thinking: None,
            tool_calls: Vec::new(),
            model: request.model.clone(),
            finish_reason: "stop".to_string(),
            usage: TokenUsage::default(),
            cost: 0.0,
        })
    }
}

struct BrokenBackend;

#[async_trait]
impl LlmBackend for BrokenBackend {
    async fn complete(&self, _request: &CompletionRequest) -> Result<LlmResponse, EngineError> {
        Err(EngineError::Llm("model host unreachable".to_string()))
    }
}

async fn fixture(backend: Arc<dyn LlmBackend>, agents: &[&str]) -> (Swarm, Arc<SessionStore>) {
    let store = Arc::new(SessionStore::connect("sqlite::memory:").await.unwrap());
    for agent_id in agents {
        store
            .upsert_agent(&AgentState::new(*agent_id, *agent_id, "mock-model"))
            .await
            .unwrap();
    }
    let gateway = Arc::new(LlmGateway::new(backend, ModelCatalog::empty()));
    let pool = Arc::new(AgentPool::new(Arc::clone(&store), gateway, 5, 8));
    pool.load_all().await.unwrap();
    let router = Arc::new(Router::new(Arc::clone(&store)));
    let swarm = Swarm::new(pool, Arc::clone(&store), router);
    (swarm, store)
}

#[tokio::test]
async fn unanimous_agreement_converges_in_one_iteration() {
    let (swarm, store) = fixture(
        Arc::new(AgreeableBackend {
            calls: AtomicUsize::new(0),
        }),
        &["a1", "a2", "a3"],
    )
    .await;

    let mut config = SwarmConfig::new(
        "Ship today?",
        vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
    );
    config.consensus_threshold = 0.7;
    config.max_iterations = 5;

    let result = swarm.execute(config, None).await.unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations, 1);
    // 0.6·1.0 + 0.4·0.9
    assert!((result.consensus_score - 0.96).abs() < 1e-9);
    assert_eq!(result.votes.len(), 3);
    assert!(result.consensus.contains("Consensus"));
    assert!(result.synthesizer_id.is_some());

    // Transcript: three swarm-1 votes and exactly one consensus, last.
    let messages = store.get_messages(result.session_id).await.unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.role == MessageRole::Swarm(1))
            .count(),
        3
    );
    assert_eq!(messages.last().unwrap().role, MessageRole::Consensus);

    // Confident voters count the run as a success.
    for agent_id in ["a1", "a2", "a3"] {
        let agent = store.get_agent(agent_id).await.unwrap().unwrap();
        assert!(agent.pheromone_score > 0.5);
    }
}

#[tokio::test]
async fn silent_swarm_falls_back_to_deterministic_consensus() {
    let (swarm, _store) = fixture(Arc::new(BrokenBackend), &["a1", "a2"]).await;

    let mut config = SwarmConfig::new("Anyone there?", vec!["a1".to_string(), "a2".to_string()]);
    config.max_iterations = 2;

    let result = swarm.execute(config, None).await.unwrap();
    assert!(!result.converged);
    assert_eq!(result.consensus_score, 0.0);
    assert_eq!(result.iterations, 2);
    assert!(result.votes.is_empty());
    assert!(result.synthesizer_id.is_none());
    assert!(result.consensus.contains("consensus unavailable"));
}

#[tokio::test]
async fn vote_callback_sees_every_vote() {
    let (swarm, _store) = fixture(
        Arc::new(AgreeableBackend {
            calls: AtomicUsize::new(0),
        }),
        &["a1", "a2"],
    )
    .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let config = SwarmConfig::new("Count votes", vec!["a1".to_string(), "a2".to_string()]);
    swarm
        .execute(
            config,
            Some(Arc::new(move |_vote| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn bounds_are_validated() {
    let (swarm, _store) = fixture(Arc::new(BrokenBackend), &["a1"]).await;

    let config = SwarmConfig::new("solo", vec!["a1".to_string()]);
    assert!(matches!(
        swarm.execute(config, None).await,
        Err(EngineError::Validation(_))
    ));

    let mut config = SwarmConfig::new("bad threshold", vec!["a1".to_string(), "a2".to_string()]);
    config.consensus_threshold = 0.1;
    assert!(matches!(
        swarm.execute(config, None).await,
        Err(EngineError::Validation(_))
    ));
}
