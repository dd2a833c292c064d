//! Concurrent agent pool.
//!
//! Owns one transient [`RuntimeAgent`] handle per registered agent. A
//! pool-wide semaphore bounds concurrent [`process_with`] executions at the
//! configured capacity (default 5); the handle set itself is bounded
//! separately so a misbehaving caller cannot spawn without limit. Each
//! agent's status follows the state machine `idle ⇄ busy`, `busy → error`
//! after three consecutive failures, `error → idle` on any success, and
//! `→ disabled` on terminate.
//!
//! [`process_with`]: AgentPool::process_with

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::aria::error::EngineError;
use crate::aria::gateway::{CompletionRequest, LlmGateway, TokenUsage};
use crate::aria::store::SessionStore;
use crate::aria::types::{AgentState, AgentStatus, ChatMessage, MessageRole, ToolCall};

/// Most runtime-agent handles the pool will hold at once.
pub const MAX_AGENTS: usize = 16;
/// Consecutive failures before an agent is flagged `error`.
const FAILURE_THRESHOLD: u32 = 3;
/// How much of the incoming message lands in `current_task`.
const TASK_PREVIEW: usize = 200;

/// Options for one `process` call.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub system_prompt: Option<String>,
    /// How many trailing context entries go out with the request.
    pub context_window: usize,
    pub model_override: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub enable_thinking: bool,
    /// Deadline for the LLM call. Applied inside `process` so the status
    /// machine and failure counters still run on expiry.
    pub timeout: Option<std::time::Duration>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            context_window: 50,
            model_override: None,
            temperature: 0.7,
            max_tokens: 4096,
            enable_thinking: false,
            timeout: None,
        }
    }
}

impl ProcessOptions {
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What one agent turn produced.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub agent_id: String,
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
    pub latency_ms: u64,
}

/// One entry of a [`AgentPool::run_parallel`] batch.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub agent_id: String,
    pub message: String,
    pub options: ProcessOptions,
}

/// Pool-wide status summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStatus {
    pub counts: HashMap<String, usize>,
    pub agents: Vec<AgentSummary>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub display_name: String,
    pub status: AgentStatus,
    pub pheromone_score: f64,
    pub current_task: Option<String>,
    pub consecutive_failures: u32,
}

/// Transient in-memory handle for one registered agent.
pub struct RuntimeAgent {
    state: RwLock<AgentState>,
    /// Rolling in-memory conversation, bounded by the configured context
    /// limit. Distinct from the per-session DB history the chat engine uses.
    context: Mutex<Vec<ChatMessage>>,
    gateway: Arc<LlmGateway>,
    store: Arc<SessionStore>,
    cancel: Notify,
    context_limit: usize,
}

impl std::fmt::Debug for RuntimeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeAgent").finish_non_exhaustive()
    }
}

impl RuntimeAgent {
    fn new(
        state: AgentState,
        gateway: Arc<LlmGateway>,
        store: Arc<SessionStore>,
        context_limit: usize,
    ) -> Self {
        Self {
            state: RwLock::new(state),
            context: Mutex::new(Vec::new()),
            gateway,
            store,
            cancel: Notify::new(),
            context_limit,
        }
    }

    pub async fn state(&self) -> AgentState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> AgentStatus {
        self.state.read().await.status
    }

    /// Reset an errored agent back to idle.
    pub async fn reset(&self) -> Result<(), EngineError> {
        let snapshot = {
            let mut state = self.state.write().await;
            if state.status == AgentStatus::Error {
                state.status = AgentStatus::Idle;
                state.consecutive_failures = 0;
            }
            state.clone()
        };
        self.store.upsert_agent(&snapshot).await
    }

    /// Run one message through this agent.
    pub async fn process(
        &self,
        message: &str,
        options: &ProcessOptions,
    ) -> Result<AgentReply, EngineError> {
        let (agent_id, model) = {
            let mut state = self.state.write().await;
            match state.status {
                AgentStatus::Disabled | AgentStatus::Terminated => {
                    return Err(EngineError::Agent(format!(
                        "agent {} is disabled",
                        state.agent_id
                    )));
                }
                _ => {}
            }
            state.status = AgentStatus::Busy;
            state.current_task = Some(truncate_chars(message, TASK_PREVIEW));
            (state.agent_id.clone(), state.model.clone())
        };

        let session_marker = Uuid::nil();
        {
            let mut context = self.context.lock().await;
            context.push(ChatMessage::new(session_marker, MessageRole::User, message));
            trim_context(&mut context, self.context_limit);
        }

        let outbound = {
            let context = self.context.lock().await;
            let mut outbound = Vec::new();
            if let Some(prompt) = &options.system_prompt {
                outbound.push(ChatMessage::new(session_marker, MessageRole::System, prompt.clone()));
            }
            let window = options.context_window.max(1);
            let start = context.len().saturating_sub(window);
            outbound.extend(context[start..].iter().cloned());
            outbound
        };

        let request = CompletionRequest {
            messages: outbound,
            model: options.model_override.clone().unwrap_or(model),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            tools: None,
            enable_thinking: options.enable_thinking,
        };

        let started = Instant::now();
        let call = async {
            match options.timeout {
                Some(limit) => match tokio::time::timeout(limit, self.gateway.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::Timeout {
                        millis: limit.as_millis() as u64,
                    }),
                },
                None => self.gateway.complete(&request).await,
            }
        };
        let result = tokio::select! {
            response = call => response,
            _ = self.cancel.notified() => Err(EngineError::Agent(format!(
                "agent {} terminated mid-task", agent_id
            ))),
        };

        match result {
            Ok(response) => {
                {
                    let mut context = self.context.lock().await;
                    let mut reply =
                        ChatMessage::new(session_marker, MessageRole::Assistant, response.content.clone());
                    reply.thinking = response.thinking.clone();
                    context.push(reply);
                    trim_context(&mut context, self.context_limit);
                }
                let snapshot = {
                    let mut state = self.state.write().await;
                    state.consecutive_failures = 0;
                    state.status = AgentStatus::Idle;
                    state.current_task = None;
                    state.last_active_at = Some(Utc::now());
                    state.clone()
                };
                self.store.upsert_agent(&snapshot).await?;
                Ok(AgentReply {
                    agent_id,
                    content: response.content,
                    thinking: response.thinking,
                    tool_calls: response.tool_calls,
                    model: response.model,
                    usage: response.usage,
                    cost: response.cost,
                    latency_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                let snapshot = {
                    let mut state = self.state.write().await;
                    state.consecutive_failures += 1;
                    state.status = if state.consecutive_failures >= FAILURE_THRESHOLD {
                        AgentStatus::Error
                    } else {
                        AgentStatus::Idle
                    };
                    state.current_task = None;
                    state.clone()
                };
                if snapshot.status == AgentStatus::Error {
                    warn!(
                        "agent {} flagged error after {} consecutive failures",
                        snapshot.agent_id, snapshot.consecutive_failures
                    );
                }
                self.store.upsert_agent(&snapshot).await?;
                Err(e)
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn trim_context(context: &mut Vec<ChatMessage>, limit: usize) {
    if context.len() > limit {
        let excess = context.len() - limit;
        context.drain(..excess);
    }
}

/// The bounded pool of runtime agents.
pub struct AgentPool {
    agents: RwLock<HashMap<String, Arc<RuntimeAgent>>>,
    semaphore: Arc<Semaphore>,
    store: Arc<SessionStore>,
    gateway: Arc<LlmGateway>,
    context_limit: usize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl AgentPool {
    pub fn new(
        store: Arc<SessionStore>,
        gateway: Arc<LlmGateway>,
        capacity: usize,
        context_limit: usize,
    ) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            store,
            gateway,
            context_limit: context_limit.max(2),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Hydrate handles for every enabled agent row.
    pub async fn load_all(&self) -> Result<usize, EngineError> {
        let rows = self.store.list_agents().await?;
        let mut agents = self.agents.write().await;
        let mut loaded = 0;
        for state in rows {
            if !state.enabled {
                continue;
            }
            if agents.len() >= MAX_AGENTS {
                warn!("agent pool handle cap reached, skipping {}", state.agent_id);
                break;
            }
            agents.entry(state.agent_id.clone()).or_insert_with(|| {
                loaded += 1;
                Arc::new(RuntimeAgent::new(
                    state,
                    Arc::clone(&self.gateway),
                    Arc::clone(&self.store),
                    self.context_limit,
                ))
            });
        }
        info!("agent pool hydrated {} agents", loaded);
        Ok(loaded)
    }

    /// Register (or re-register) an agent and create its handle.
    pub async fn spawn(&self, state: AgentState) -> Result<Arc<RuntimeAgent>, EngineError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&state.agent_id) {
            return Err(EngineError::Agent(format!(
                "agent {} already spawned",
                state.agent_id
            )));
        }
        if agents.len() >= MAX_AGENTS {
            return Err(EngineError::Agent(format!(
                "agent pool is full ({} handles)",
                MAX_AGENTS
            )));
        }
        self.store.upsert_agent(&state).await?;
        let handle = Arc::new(RuntimeAgent::new(
            state.clone(),
            Arc::clone(&self.gateway),
            Arc::clone(&self.store),
            self.context_limit,
        ));
        agents.insert(state.agent_id.clone(), Arc::clone(&handle));
        info!("spawned agent {}", state.agent_id);
        Ok(handle)
    }

    /// Cancel any in-flight task, mark the agent disabled, persist, and drop
    /// the handle.
    pub async fn terminate(&self, agent_id: &str) -> Result<(), EngineError> {
        let handle = {
            let mut agents = self.agents.write().await;
            agents.remove(agent_id)
        };
        let Some(handle) = handle else {
            return Err(EngineError::Agent(format!("unknown agent: {}", agent_id)));
        };
        handle.cancel.notify_waiters();
        let snapshot = {
            let mut state = handle.state.write().await;
            state.status = AgentStatus::Disabled;
            state.current_task = None;
            state.clone()
        };
        self.store.upsert_agent(&snapshot).await?;
        info!("terminated agent {}", agent_id);
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<RuntimeAgent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Run one message through one agent under the pool-wide semaphore.
    pub async fn process_with(
        &self,
        agent_id: &str,
        message: &str,
        options: &ProcessOptions,
    ) -> Result<AgentReply, EngineError> {
        let handle = self
            .get(agent_id)
            .await
            .ok_or_else(|| EngineError::Agent(format!("unknown agent: {}", agent_id)))?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Engine("agent pool is shut down".to_string()))?;

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let result = handle.process(message, options).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Fan a batch out concurrently. A failing task yields an error in its
    /// slot; the batch itself always completes.
    pub async fn run_parallel(
        &self,
        batch: Vec<BatchRequest>,
    ) -> Vec<Result<AgentReply, EngineError>> {
        let mut set = JoinSet::new();
        for (slot, request) in batch.into_iter().enumerate() {
            let handle = self.get(&request.agent_id).await;
            let semaphore = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let result = match handle {
                    Some(agent) => match semaphore.acquire().await {
                        Ok(_permit) => agent.process(&request.message, &request.options).await,
                        Err(_) => Err(EngineError::Engine("agent pool is shut down".to_string())),
                    },
                    None => Err(EngineError::Agent(format!(
                        "unknown agent: {}",
                        request.agent_id
                    ))),
                };
                (slot, result)
            });
        }

        let mut results: Vec<Option<Result<AgentReply, EngineError>>> = Vec::new();
        results.resize_with(set.len(), || None);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((slot, result)) => results[slot] = Some(result),
                Err(e) => warn!("batch task join failure: {}", e),
            }
        }
        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(EngineError::Engine("batch task vanished".to_string())))
            })
            .collect()
    }

    /// Counts by status plus a per-agent summary.
    pub async fn status(&self) -> PoolStatus {
        let agents = self.agents.read().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut summaries = Vec::with_capacity(agents.len());
        for handle in agents.values() {
            let state = handle.state.read().await;
            *counts.entry(state.status.as_str().to_string()).or_default() += 1;
            summaries.push(AgentSummary {
                agent_id: state.agent_id.clone(),
                display_name: state.display_name.clone(),
                status: state.status,
                pheromone_score: state.pheromone_score,
                current_task: state.current_task.clone(),
                consecutive_failures: state.consecutive_failures,
            });
        }
        summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        PoolStatus {
            counts,
            agents: summaries,
        }
    }

    /// Highest concurrent `process_with` count observed. Exists so tests can
    /// assert the semaphore actually bounds parallelism.
    pub fn max_observed_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}
