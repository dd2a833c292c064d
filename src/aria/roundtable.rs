//! Roundtable: structured multi-agent discussion.
//!
//! A fixed number of rounds, each fanned out to every participant in
//! parallel under per-agent and whole-discussion deadlines, followed by a
//! synthesis turn from a designated agent. Every turn is persisted with a
//! positional `round-N` role; agents that time out or error contribute a
//! placeholder turn and the round carries on without them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::aria::agent_pool::{AgentPool, ProcessOptions};
use crate::aria::chat_engine::derive_title;
use crate::aria::error::EngineError;
use crate::aria::router::Router;
use crate::aria::store::SessionStore;
use crate::aria::types::{
    ChatMessage, MessageRole, Session, SessionStatus, SessionType,
};

pub const MIN_AGENTS: usize = 2;
pub const MAX_AGENTS: usize = 10;
pub const MAX_ROUNDS: u32 = 10;
/// Prior turns are trimmed to this many characters in round context.
const CONTEXT_SNIPPET: usize = 300;

#[derive(Debug, Clone)]
pub struct RoundtableConfig {
    pub topic: String,
    pub agent_ids: Vec<String>,
    pub rounds: u32,
    pub synthesizer_id: String,
    pub agent_timeout: Duration,
    pub total_timeout: Duration,
}

impl RoundtableConfig {
    pub fn new(
        topic: impl Into<String>,
        agent_ids: Vec<String>,
        rounds: u32,
        synthesizer_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            agent_ids,
            rounds,
            synthesizer_id: synthesizer_id.into(),
            agent_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(300),
        }
    }
}

/// One contribution to the discussion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoundTurn {
    pub agent_id: String,
    pub round: u32,
    pub content: String,
    pub duration_ms: u64,
    pub failed: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoundtableResult {
    pub session_id: Uuid,
    pub topic: String,
    pub turns: Vec<RoundTurn>,
    pub synthesis: String,
    pub rounds_completed: u32,
    pub duration_ms: u64,
}

/// Invoked after every completed turn; the WebSocket streamer uses this to
/// forward turns live.
pub type TurnCallback = Arc<dyn Fn(&RoundTurn) + Send + Sync>;

pub struct Roundtable {
    pool: Arc<AgentPool>,
    store: Arc<SessionStore>,
    router: Arc<Router>,
}

impl Roundtable {
    pub fn new(pool: Arc<AgentPool>, store: Arc<SessionStore>, router: Arc<Router>) -> Self {
        Self {
            pool,
            store,
            router,
        }
    }

    /// Run a full discussion. See the module docs for the shape.
    pub async fn discuss(
        &self,
        config: RoundtableConfig,
        on_turn: Option<TurnCallback>,
    ) -> Result<RoundtableResult, EngineError> {
        if config.agent_ids.len() < MIN_AGENTS || config.agent_ids.len() > MAX_AGENTS {
            return Err(EngineError::Validation(format!(
                "roundtable needs {}..={} agents, got {}",
                MIN_AGENTS,
                MAX_AGENTS,
                config.agent_ids.len()
            )));
        }
        if config.rounds == 0 || config.rounds > MAX_ROUNDS {
            return Err(EngineError::Validation(format!(
                "roundtable rounds must be 1..={}, got {}",
                MAX_ROUNDS, config.rounds
            )));
        }

        let session = self.create_session(&config).await?;
        let started = Instant::now();
        let deadline = started + config.total_timeout;

        let mut turns: Vec<RoundTurn> = Vec::new();
        let mut rounds_completed = 0;

        for round in 1..=config.rounds {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("roundtable {} hit total timeout at round {}", session.id, round);
                break;
            };
            if remaining.is_zero() {
                break;
            }

            let context = format_turn_context(&turns);
            let prompt = round_prompt(&config, round, &context);
            let per_agent = config.agent_timeout.min(remaining);

            let round_turns = self
                .run_round(&config.agent_ids, round, &prompt, per_agent)
                .await;

            for turn in &round_turns {
                let mut message =
                    ChatMessage::new(session.id, MessageRole::Round(round), turn.content.clone());
                message.latency_ms = turn.duration_ms as i64;
                message.metadata = serde_json::json!({"agent_id": turn.agent_id, "failed": turn.failed});
                self.store.insert_message(&message).await?;
                if let Some(callback) = &on_turn {
                    callback(turn);
                }
            }
            turns.extend(round_turns);
            rounds_completed = round;
        }

        let synthesis = self.synthesize(&config, &session, &turns).await;
        let synthesis_message =
            ChatMessage::new(session.id, MessageRole::Synthesis, synthesis.clone());
        self.store.insert_message(&synthesis_message).await?;
        self.store
            .update_session_counters(session.id, turns.len() as i64 + 1, 0, 0.0)
            .await?;
        self.store
            .set_session_status(session.id, SessionStatus::Ended)
            .await?;

        // One score update per participant, averaged over its turns.
        let mut durations: HashMap<String, Vec<u64>> = HashMap::new();
        for turn in turns.iter().filter(|t| !t.failed) {
            durations
                .entry(turn.agent_id.clone())
                .or_default()
                .push(turn.duration_ms);
        }
        for (agent_id, samples) in &durations {
            let avg = samples.iter().sum::<u64>() / samples.len() as u64;
            if let Err(e) = self.router.update_scores(agent_id, true, avg, 0.0).await {
                warn!("score update failed for {}: {}", agent_id, e);
            }
        }

        info!(
            "roundtable {} finished: {} turns over {} rounds",
            session.id,
            turns.len(),
            rounds_completed
        );
        Ok(RoundtableResult {
            session_id: session.id,
            topic: config.topic,
            turns,
            synthesis,
            rounds_completed,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn create_session(&self, config: &RoundtableConfig) -> Result<Session, EngineError> {
        let now = chrono::Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            agent_id: config.synthesizer_id.clone(),
            session_type: SessionType::Roundtable,
            title: Some(derive_title(&config.topic)),
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
            context_window: 50,
            system_prompt: None,
            status: SessionStatus::Active,
            message_count: 0,
            total_tokens: 0,
            total_cost: 0.0,
            created_at: now,
            updated_at: now,
            ended_at: None,
            metadata: serde_json::json!({
                "participants": config.agent_ids,
                "rounds": config.rounds,
            }),
        };
        self.store.create_session(&session).await?;
        Ok(session)
    }

    /// Fan one round out to every participant in parallel. Failures and
    /// timeouts become placeholder turns.
    async fn run_round(
        &self,
        agent_ids: &[String],
        round: u32,
        prompt: &str,
        per_agent: Duration,
    ) -> Vec<RoundTurn> {
        let mut set = JoinSet::new();
        for agent_id in agent_ids {
            let pool = Arc::clone(&self.pool);
            let agent_id = agent_id.clone();
            let prompt = prompt.to_string();
            set.spawn(async move {
                let started = Instant::now();
                let options = ProcessOptions::default().with_timeout(per_agent);
                let result = pool.process_with(&agent_id, &prompt, &options).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                match result {
                    Ok(reply) => RoundTurn {
                        agent_id,
                        round,
                        content: reply.content,
                        duration_ms: reply.latency_ms,
                        failed: false,
                    },
                    Err(EngineError::Timeout { .. }) => {
                        warn!("agent {} timed out in round {}", agent_id, round);
                        RoundTurn {
                            content: format!("[{} timed out]", agent_id),
                            agent_id,
                            round,
                            duration_ms,
                            failed: true,
                        }
                    }
                    Err(e) => {
                        warn!("agent {} errored in round {}: {}", agent_id, round, e);
                        RoundTurn {
                            content: format!("[{} error]", agent_id),
                            agent_id,
                            round,
                            duration_ms,
                            failed: true,
                        }
                    }
                }
            });
        }

        // Collected in arrival order; persistence preserves it.
        let mut turns = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!("round task join failure: {}", e),
            }
        }
        turns
    }

    async fn synthesize(
        &self,
        config: &RoundtableConfig,
        session: &Session,
        turns: &[RoundTurn],
    ) -> String {
        let prompt = synthesis_prompt(&config.topic, turns);
        match self
            .pool
            .process_with(&config.synthesizer_id, &prompt, &ProcessOptions::default())
            .await
        {
            Ok(reply) => reply.content,
            Err(e) => {
                warn!(
                    "synthesizer {} failed for roundtable {}: {}",
                    config.synthesizer_id, session.id, e
                );
                fallback_synthesis(turns)
            }
        }
    }
}

fn trim_snippet(content: &str) -> String {
    if content.chars().count() <= CONTEXT_SNIPPET {
        content.to_string()
    } else {
        let cut: String = content.chars().take(CONTEXT_SNIPPET).collect();
        format!("{}…", cut)
    }
}

fn format_turn_context(turns: &[RoundTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("[round {}] {}: {}", t.round, t.agent_id, trim_snippet(&t.content)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn phase_name(round: u32) -> &'static str {
    match round {
        1 => "EXPLORE",
        2 => "WORK",
        _ => "VALIDATE",
    }
}

fn round_prompt(config: &RoundtableConfig, round: u32, context: &str) -> String {
    let mut prompt = format!(
        "Roundtable discussion — phase {} (round {} of {}).\n\
         Topic: {}\n\
         Participants: {}\n",
        phase_name(round),
        round,
        config.rounds,
        config.topic,
        config.agent_ids.join(", "),
    );
    if !context.is_empty() {
        prompt.push_str("\nWhat has been said so far:\n");
        prompt.push_str(context);
        prompt.push('\n');
    }
    prompt.push_str(match phase_name(round) {
        "EXPLORE" => "\nLay out your initial position and the angles worth exploring.",
        "WORK" => "\nBuild on the strongest ideas so far and work the problem concretely.",
        _ => "\nValidate or challenge the emerging direction; flag risks and gaps.",
    });
    prompt
}

fn synthesis_prompt(topic: &str, turns: &[RoundTurn]) -> String {
    format!(
        "You are synthesizing a roundtable discussion.\n\
         Topic: {}\n\nAll turns:\n{}\n\n\
         Produce a coherent, actionable synthesis: highlight points of \
         agreement, resolve conflicts explicitly, and end with concrete next steps.",
        topic,
        format_turn_context(turns)
    )
}

/// Deterministic synthesis used when the synthesizer itself fails: the
/// final round's turns under a banner.
fn fallback_synthesis(turns: &[RoundTurn]) -> String {
    let last_round = turns.iter().map(|t| t.round).max().unwrap_or(0);
    let mut out = String::from("[synthesis unavailable — final round positions follow]\n");
    for turn in turns.iter().filter(|t| t.round == last_round && !t.failed) {
        out.push_str(&format!("{}: {}\n", turn.agent_id, trim_snippet(&turn.content)));
    }
    out
}
