//! Pheromone-weighted router.
//!
//! Given a message and candidate agents, combines four signals — persisted
//! pheromone score, specialty keyword match, current load, and recent
//! success rate — into a single ranking and picks the argmax. The router
//! also owns the per-agent performance ring buffers (bounded at 200,
//! replaced wholesale on write so concurrent readers always see a
//! consistent snapshot) and the fallback chain walk used on LLM errors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use tokio::sync::RwLock;

use crate::aria::error::EngineError;
use crate::aria::scoring::{load_score, pheromone_score, specialty_match};
use crate::aria::store::SessionStore;
use crate::aria::types::PerformanceRecord;

/// Ring buffer capacity per agent.
pub const RING_CAPACITY: usize = 200;
/// How many trailing records feed the recency signal.
const RECENCY_WINDOW: usize = 10;

const WEIGHT_PHEROMONE: f64 = 0.35;
const WEIGHT_SPECIALTY: f64 = 0.30;
const WEIGHT_LOAD: f64 = 0.20;
const WEIGHT_RECENCY: f64 = 0.15;

/// Per-agent metrics snapshot for the monitoring surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub pheromone_score: f64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub record_count: usize,
}

pub struct Router {
    store: Arc<SessionStore>,
    /// Snapshot-replaced ring buffers: writers clone-push-trim and swap the
    /// `Arc`, readers clone the `Arc` and never block a writer.
    records: RwLock<HashMap<String, Arc<Vec<PerformanceRecord>>>>,
}

impl Router {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Pick the best agent for a message.
    ///
    /// A single candidate short-circuits; an empty list is an error. Agents
    /// the store does not know are skipped.
    pub async fn route(&self, message: &str, candidates: &[String]) -> Result<String, EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::NoCandidates);
        }
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }

        let mut best: Option<(String, f64)> = None;
        for agent_id in candidates {
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                continue;
            };
            let specialty = specialty_match(message, agent.focus_type);
            let load = load_score(agent.status, agent.consecutive_failures);
            let recency = self.recency(agent_id).await;
            let combined = WEIGHT_PHEROMONE * agent.pheromone_score
                + WEIGHT_SPECIALTY * specialty
                + WEIGHT_LOAD * load
                + WEIGHT_RECENCY * recency;
            debug!(
                "route score {}: pheromone={:.3} specialty={:.3} load={:.3} recency={:.3} => {:.3}",
                agent_id, agent.pheromone_score, specialty, load, recency, combined
            );
            match &best {
                Some((_, top)) if combined <= *top => {}
                _ => best = Some((agent_id.clone(), combined)),
            }
        }

        best.map(|(agent_id, _)| agent_id)
            .ok_or(EngineError::NoCandidates)
    }

    /// Fraction of successes over the last ten records; 0.5 with no history.
    async fn recency(&self, agent_id: &str) -> f64 {
        let snapshot = self.snapshot(agent_id).await;
        let recent: Vec<_> = snapshot.iter().rev().take(RECENCY_WINDOW).collect();
        if recent.is_empty() {
            return 0.5;
        }
        let successes = recent.iter().filter(|r| r.success).count();
        successes as f64 / recent.len() as f64
    }

    /// Walk the `(model → fallback_model → parent…)` chain for an agent.
    ///
    /// Parent pointers can form cycles in bad config; a visited set
    /// terminates the walk on revisit. Consecutive duplicate entries are
    /// collapsed so the chat engine never retries the identical pair.
    pub async fn fallback_chain(
        &self,
        agent_id: &str,
    ) -> Result<Vec<(String, String)>, EngineError> {
        let mut chain: Vec<(String, String)> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor = Some(agent_id.to_string());

        while let Some(current_id) = cursor {
            if !visited.insert(current_id.clone()) {
                break;
            }
            let Some(agent) = self.store.get_agent(&current_id).await? else {
                break;
            };
            for model in [Some(agent.model.clone()), agent.fallback_model.clone()]
                .into_iter()
                .flatten()
            {
                let entry = (current_id.clone(), model);
                if chain.last() != Some(&entry) && !chain.contains(&entry) {
                    chain.push(entry);
                }
            }
            cursor = agent.parent_agent_id.clone();
        }

        if chain.is_empty() {
            return Err(EngineError::Agent(format!(
                "no models available for agent {}",
                agent_id
            )));
        }
        Ok(chain)
    }

    /// Append a performance record, trim the ring, recompute the pheromone
    /// score and persist it atomically. Returns the new score.
    pub async fn update_scores(
        &self,
        agent_id: &str,
        success: bool,
        duration_ms: u64,
        token_cost: f64,
    ) -> Result<f64, EngineError> {
        let record = PerformanceRecord {
            success,
            speed_score: (1.0 - duration_ms as f64 / 30_000.0).max(0.0),
            cost_score: (1.0 - token_cost.min(1.0)).max(0.0),
            duration_ms,
            created_at: Utc::now(),
            task_type: None,
        };

        let snapshot = {
            let mut rings = self.records.write().await;
            let ring = rings.entry(agent_id.to_string()).or_default();
            let mut next: Vec<PerformanceRecord> = ring.as_ref().clone();
            next.push(record);
            if next.len() > RING_CAPACITY {
                let excess = next.len() - RING_CAPACITY;
                next.drain(..excess);
            }
            let next = Arc::new(next);
            *ring = Arc::clone(&next);
            next
        };

        let score = pheromone_score(&snapshot, Utc::now());
        self.store.set_pheromone(agent_id, score).await?;
        Ok(score)
    }

    /// Consistent snapshot of an agent's ring buffer.
    pub async fn snapshot(&self, agent_id: &str) -> Arc<Vec<PerformanceRecord>> {
        self.records
            .read()
            .await
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn metrics(&self, agent_id: &str) -> Result<AgentMetrics, EngineError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| EngineError::Agent(format!("unknown agent: {}", agent_id)))?;
        let snapshot = self.snapshot(agent_id).await;
        let (successes, total_ms) = snapshot.iter().fold((0usize, 0u64), |(s, ms), r| {
            (s + usize::from(r.success), ms + r.duration_ms)
        });
        let count = snapshot.len();
        Ok(AgentMetrics {
            agent_id: agent.agent_id,
            pheromone_score: agent.pheromone_score,
            success_rate: if count == 0 {
                0.0
            } else {
                successes as f64 / count as f64
            },
            avg_duration_ms: if count == 0 {
                0.0
            } else {
                total_ms as f64 / count as f64
            },
            record_count: count,
        })
    }
}
