//! Swarm: emergent coordination through iterative voting.
//!
//! Each iteration, every participant reads the stigmergy trail — all prior
//! votes sorted by the voters' pheromone scores and marked by authority —
//! and contributes a tagged vote (`[VOTE: …]` / `[CONFIDENCE: …]`).
//! Untagged responses are scored heuristically from polarity words. The
//! swarm converges when `0.6·majority-fraction + 0.4·majority-confidence`
//! clears the threshold; the consensus author is then chosen dynamically by
//! pheromone weight and vote confidence rather than fixed up front.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::aria::agent_pool::{AgentPool, ProcessOptions};
use crate::aria::chat_engine::derive_title;
use crate::aria::error::EngineError;
use crate::aria::router::Router;
use crate::aria::store::SessionStore;
use crate::aria::types::{ChatMessage, MessageRole, Session, SessionStatus, SessionType};

pub const MIN_AGENTS: usize = 2;
pub const MAX_AGENTS: usize = 12;
pub const MAX_ITERATIONS: u32 = 10;
const TRAIL_SNIPPET: usize = 300;

lazy_static! {
    static ref VOTE_TAG: Regex =
        Regex::new(r"(?i)\[VOTE:\s*(agree|disagree|extend|pivot)\s*\]").unwrap();
    static ref CONFIDENCE_TAG: Regex =
        Regex::new(r"(?i)\[CONFIDENCE:\s*([01](?:\.\d+)?)\s*\]").unwrap();
    static ref AGREEMENT_WORDS: Regex =
        Regex::new(r"(?i)\b(agree|yes|correct|right|support|exactly|sound)\b").unwrap();
    static ref DISSENT_WORDS: Regex =
        Regex::new(r"(?i)\b(disagree|no|wrong|object|flawed|risky|concern)\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Agree,
    Disagree,
    Extend,
    Pivot,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteKind::Agree => "agree",
            VoteKind::Disagree => "disagree",
            VoteKind::Extend => "extend",
            VoteKind::Pivot => "pivot",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SwarmVote {
    pub agent_id: String,
    pub iteration: u32,
    pub content: String,
    pub vote: VoteKind,
    pub confidence: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub topic: String,
    pub agent_ids: Vec<String>,
    pub max_iterations: u32,
    /// Convergence threshold in [0.3, 1.0].
    pub consensus_threshold: f64,
    pub agent_timeout: Duration,
    pub total_timeout: Duration,
}

impl SwarmConfig {
    pub fn new(topic: impl Into<String>, agent_ids: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            agent_ids,
            max_iterations: 5,
            consensus_threshold: 0.7,
            agent_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SwarmResult {
    pub session_id: Uuid,
    pub topic: String,
    pub converged: bool,
    pub iterations: u32,
    pub consensus_score: f64,
    pub consensus: String,
    pub synthesizer_id: Option<String>,
    pub votes: Vec<SwarmVote>,
    pub duration_ms: u64,
}

/// Invoked after every vote lands; used by the WebSocket streamer.
pub type VoteCallback = Arc<dyn Fn(&SwarmVote) + Send + Sync>;

/// Parse the vote and confidence tags out of a response. Missing tags fall
/// back to polarity-word counting with confidence clamped into [0.5, 0.9];
/// a response with no polarity signal at all defaults to `extend`.
pub fn parse_vote(content: &str) -> (VoteKind, f64) {
    let tagged_vote = VOTE_TAG.captures(content).map(|c| {
        match c[1].to_lowercase().as_str() {
            "agree" => VoteKind::Agree,
            "disagree" => VoteKind::Disagree,
            "pivot" => VoteKind::Pivot,
            _ => VoteKind::Extend,
        }
    });
    let tagged_confidence = CONFIDENCE_TAG
        .captures(content)
        .and_then(|c| c[1].parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0));

    match (tagged_vote, tagged_confidence) {
        (Some(vote), Some(confidence)) => (vote, confidence),
        (Some(vote), None) => (vote, 0.7),
        (None, confidence) => {
            let agreement = AGREEMENT_WORDS.find_iter(content).count() as i64;
            let dissent = DISSENT_WORDS.find_iter(content).count() as i64;
            let vote = if agreement > dissent {
                VoteKind::Agree
            } else if dissent > agreement {
                VoteKind::Disagree
            } else {
                VoteKind::Extend
            };
            let heuristic =
                (0.5 + 0.05 * (agreement - dissent).unsigned_abs() as f64).clamp(0.5, 0.9);
            (vote, confidence.unwrap_or(heuristic))
        }
    }
}

/// Per-iteration consensus: 60% majority fraction, 40% mean confidence of
/// the majority voters. No votes at all scores 0.
pub fn consensus_score(votes: &[SwarmVote]) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<VoteKind, Vec<f64>> = HashMap::new();
    for vote in votes {
        counts.entry(vote.vote).or_default().push(vote.confidence);
    }
    let (_, majority_confidences) = counts
        .into_iter()
        .max_by_key(|(_, confidences)| confidences.len())
        .expect("non-empty votes");
    let majority_fraction = majority_confidences.len() as f64 / votes.len() as f64;
    let mean_confidence =
        majority_confidences.iter().sum::<f64>() / majority_confidences.len() as f64;
    0.6 * majority_fraction + 0.4 * mean_confidence
}

fn authority_marker(pheromone: f64) -> char {
    if pheromone > 0.7 {
        '★'
    } else if pheromone > 0.4 {
        '●'
    } else {
        '○'
    }
}

fn trim_snippet(content: &str) -> String {
    if content.chars().count() <= TRAIL_SNIPPET {
        content.to_string()
    } else {
        let cut: String = content.chars().take(TRAIL_SNIPPET).collect();
        format!("{}…", cut)
    }
}

/// Render the stigmergy trail: every prior vote, highest-pheromone voters
/// first, each line marked by the voter's authority tier.
fn format_trail(votes: &[SwarmVote], pheromones: &HashMap<String, f64>) -> String {
    let mut ordered: Vec<&SwarmVote> = votes.iter().collect();
    ordered.sort_by(|a, b| {
        let pa = pheromones.get(&a.agent_id).copied().unwrap_or(0.5);
        let pb = pheromones.get(&b.agent_id).copied().unwrap_or(0.5);
        pb.total_cmp(&pa)
    });
    ordered
        .iter()
        .map(|v| {
            let pheromone = pheromones.get(&v.agent_id).copied().unwrap_or(0.5);
            format!(
                "{} {} [{} {:.2}]: {}",
                authority_marker(pheromone),
                v.agent_id,
                v.vote.as_str(),
                v.confidence,
                trim_snippet(&v.content)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn iteration_phase(iteration: u32, max_iterations: u32) -> &'static str {
    if iteration == 1 {
        "EXPLORE"
    } else if iteration >= max_iterations {
        "FINALIZE"
    } else {
        "CONVERGE"
    }
}

fn iteration_prompt(config: &SwarmConfig, iteration: u32, trail: &str) -> String {
    let mut prompt = format!(
        "Swarm deliberation — phase {} (iteration {} of {}).\n\
         Topic: {}\n",
        iteration_phase(iteration, config.max_iterations),
        iteration,
        config.max_iterations,
        config.topic,
    );
    if !trail.is_empty() {
        prompt.push_str("\nThe trail so far (higher authority first):\n");
        prompt.push_str(trail);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nContribute your position. You MUST end your response with two tags:\n\
         [VOTE: agree|disagree|extend|pivot]\n\
         [CONFIDENCE: 0.0-1.0]\n",
    );
    prompt
}

fn consensus_prompt(topic: &str, trail: &str) -> String {
    format!(
        "You are writing the consensus for a swarm deliberation.\n\
         Topic: {}\n\nFull trail (higher authority first):\n{}\n\n\
         Merge the positions, weighting higher-authority voices more \
         heavily, and note any remaining dissent explicitly.",
        topic, trail
    )
}

/// Deterministic consensus used when the chosen synthesizer fails: the
/// final iteration's vote distribution plus its strongest snippets.
fn fallback_consensus(votes: &[SwarmVote]) -> String {
    let last = votes.iter().map(|v| v.iteration).max().unwrap_or(0);
    let final_votes: Vec<&SwarmVote> = votes.iter().filter(|v| v.iteration == last).collect();
    let mut counts: HashMap<VoteKind, usize> = HashMap::new();
    for vote in &final_votes {
        *counts.entry(vote.vote).or_default() += 1;
    }
    let mut distribution: Vec<String> = counts
        .iter()
        .map(|(kind, count)| format!("{}: {}", kind.as_str(), count))
        .collect();
    distribution.sort();

    let mut strongest: Vec<&&SwarmVote> = final_votes.iter().collect();
    strongest.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let snippets: Vec<String> = strongest
        .iter()
        .take(3)
        .map(|v| format!("{}: {}", v.agent_id, trim_snippet(&v.content)))
        .collect();

    format!(
        "[consensus unavailable — final vote distribution: {}]\n{}",
        distribution.join(", "),
        snippets.join("\n")
    )
}

pub struct Swarm {
    pool: Arc<AgentPool>,
    store: Arc<SessionStore>,
    router: Arc<Router>,
}

impl Swarm {
    pub fn new(pool: Arc<AgentPool>, store: Arc<SessionStore>, router: Arc<Router>) -> Self {
        Self {
            pool,
            store,
            router,
        }
    }

    pub async fn execute(
        &self,
        config: SwarmConfig,
        on_vote: Option<VoteCallback>,
    ) -> Result<SwarmResult, EngineError> {
        if config.agent_ids.len() < MIN_AGENTS || config.agent_ids.len() > MAX_AGENTS {
            return Err(EngineError::Validation(format!(
                "swarm needs {}..={} agents, got {}",
                MIN_AGENTS,
                MAX_AGENTS,
                config.agent_ids.len()
            )));
        }
        if config.max_iterations == 0 || config.max_iterations > MAX_ITERATIONS {
            return Err(EngineError::Validation(format!(
                "swarm iterations must be 1..={}, got {}",
                MAX_ITERATIONS, config.max_iterations
            )));
        }
        if !(0.3..=1.0).contains(&config.consensus_threshold) {
            return Err(EngineError::Validation(format!(
                "consensus threshold must be in [0.3, 1.0], got {}",
                config.consensus_threshold
            )));
        }

        let session = self.create_session(&config).await?;
        let started = Instant::now();
        let deadline = started + config.total_timeout;

        let mut votes: Vec<SwarmVote> = Vec::new();
        let mut converged = false;
        let mut iterations = 0;
        let mut score = 0.0;

        for iteration in 1..=config.max_iterations {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("swarm {} hit total timeout at iteration {}", session.id, iteration);
                break;
            };
            if remaining.is_zero() {
                break;
            }
            iterations = iteration;

            let pheromones = self.load_pheromones(&config.agent_ids).await;
            let trail = format_trail(&votes, &pheromones);
            let prompt = iteration_prompt(&config, iteration, &trail);
            let per_agent = config.agent_timeout.min(remaining);

            let iteration_votes = self
                .run_iteration(&config.agent_ids, iteration, &prompt, per_agent)
                .await;

            for vote in &iteration_votes {
                let mut message = ChatMessage::new(
                    session.id,
                    MessageRole::Swarm(iteration),
                    vote.content.clone(),
                );
                message.latency_ms = vote.duration_ms as i64;
                message.metadata = serde_json::json!({
                    "agent_id": vote.agent_id,
                    "vote": vote.vote.as_str(),
                    "confidence": vote.confidence,
                });
                self.store.insert_message(&message).await?;
                if let Some(callback) = &on_vote {
                    callback(vote);
                }
            }

            score = consensus_score(&iteration_votes);
            votes.extend(iteration_votes);
            info!(
                "swarm {} iteration {}: consensus score {:.3} (threshold {:.2})",
                session.id, iteration, score, config.consensus_threshold
            );
            if score >= config.consensus_threshold {
                converged = true;
                break;
            }
        }

        let pheromones = self.load_pheromones(&config.agent_ids).await;
        let synthesizer = choose_synthesizer(&config.agent_ids, &votes, &pheromones);
        let consensus = match &synthesizer {
            Some(agent_id) => {
                let trail = format_trail(&votes, &pheromones);
                match self
                    .pool
                    .process_with(
                        agent_id,
                        &consensus_prompt(&config.topic, &trail),
                        &ProcessOptions::default(),
                    )
                    .await
                {
                    Ok(reply) => reply.content,
                    Err(e) => {
                        warn!("consensus author {} failed: {}", agent_id, e);
                        fallback_consensus(&votes)
                    }
                }
            }
            None => fallback_consensus(&votes),
        };

        let consensus_message =
            ChatMessage::new(session.id, MessageRole::Consensus, consensus.clone());
        self.store.insert_message(&consensus_message).await?;
        self.store
            .update_session_counters(session.id, votes.len() as i64 + 1, 0, 0.0)
            .await?;
        self.store
            .set_session_status(session.id, SessionStatus::Ended)
            .await?;

        // Success follows from conviction: agents whose votes averaged above
        // 0.5 confidence count this as a win.
        let mut per_agent: HashMap<String, (Vec<f64>, Vec<u64>)> = HashMap::new();
        for vote in &votes {
            let entry = per_agent.entry(vote.agent_id.clone()).or_default();
            entry.0.push(vote.confidence);
            entry.1.push(vote.duration_ms);
        }
        for (agent_id, (confidences, durations)) in &per_agent {
            let mean_confidence = confidences.iter().sum::<f64>() / confidences.len() as f64;
            let mean_duration = durations.iter().sum::<u64>() / durations.len() as u64;
            if let Err(e) = self
                .router
                .update_scores(agent_id, mean_confidence > 0.5, mean_duration, 0.0)
                .await
            {
                warn!("score update failed for {}: {}", agent_id, e);
            }
        }

        Ok(SwarmResult {
            session_id: session.id,
            topic: config.topic,
            converged,
            iterations,
            consensus_score: score,
            consensus,
            synthesizer_id: synthesizer,
            votes,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn create_session(&self, config: &SwarmConfig) -> Result<Session, EngineError> {
        let now = chrono::Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            agent_id: config
                .agent_ids
                .first()
                .cloned()
                .unwrap_or_else(|| "swarm".to_string()),
            session_type: SessionType::Swarm,
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
                "threshold": config.consensus_threshold,
            }),
        };
        self.store.create_session(&session).await?;
        Ok(session)
    }

    async fn load_pheromones(&self, agent_ids: &[String]) -> HashMap<String, f64> {
        let mut pheromones = HashMap::new();
        for agent_id in agent_ids {
            let score = match self.store.get_agent(agent_id).await {
                Ok(Some(agent)) => agent.pheromone_score,
                _ => 0.5,
            };
            pheromones.insert(agent_id.clone(), score);
        }
        pheromones
    }

    async fn run_iteration(
        &self,
        agent_ids: &[String],
        iteration: u32,
        prompt: &str,
        per_agent: Duration,
    ) -> Vec<SwarmVote> {
        let mut set = JoinSet::new();
        for agent_id in agent_ids {
            let pool = Arc::clone(&self.pool);
            let agent_id = agent_id.clone();
            let prompt = prompt.to_string();
            set.spawn(async move {
                let options = ProcessOptions::default().with_timeout(per_agent);
                match pool.process_with(&agent_id, &prompt, &options).await {
                    Ok(reply) => {
                        let (vote, confidence) = parse_vote(&reply.content);
                        Some(SwarmVote {
                            agent_id,
                            iteration,
                            content: reply.content,
                            vote,
                            confidence,
                            duration_ms: reply.latency_ms,
                        })
                    }
                    Err(e) => {
                        warn!("agent {} failed in iteration {}: {}", agent_id, iteration, e);
                        None
                    }
                }
            });
        }

        let mut votes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(vote)) => votes.push(vote),
                Ok(None) => {}
                Err(e) => warn!("iteration task join failure: {}", e),
            }
        }
        votes
    }
}

/// Pick the consensus author: `0.6·pheromone + 0.4·best-confidence` across
/// participants. Returns `None` when nobody voted.
fn choose_synthesizer(
    agent_ids: &[String],
    votes: &[SwarmVote],
    pheromones: &HashMap<String, f64>,
) -> Option<String> {
    if votes.is_empty() {
        return None;
    }
    agent_ids
        .iter()
        .map(|agent_id| {
            let best_confidence = votes
                .iter()
                .filter(|v| &v.agent_id == agent_id)
                .map(|v| v.confidence)
                .fold(0.0f64, f64::max);
            let pheromone = pheromones.get(agent_id).copied().unwrap_or(0.5);
            (agent_id.clone(), 0.6 * pheromone + 0.4 * best_confidence)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(agent_id, _)| agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(agent: &str, iteration: u32, kind: VoteKind, confidence: f64) -> SwarmVote {
        SwarmVote {
            agent_id: agent.to_string(),
            iteration,
            content: format!("[VOTE: {}][CONFIDENCE: {}]", kind.as_str(), confidence),
            vote: kind,
            confidence,
            duration_ms: 100,
        }
    }

    #[test]
    fn tagged_votes_parse_exactly() {
        let (kind, confidence) = parse_vote("Ship it. [VOTE: agree] [CONFIDENCE: 0.9]");
        assert_eq!(kind, VoteKind::Agree);
        assert!((confidence - 0.9).abs() < f64::EPSILON);

        let (kind, _) = parse_vote("Needs rework [vote: PIVOT][confidence: 0.4]");
        assert_eq!(kind, VoteKind::Pivot);
    }

    #[test]
    fn untagged_votes_fall_back_to_polarity() {
        let (kind, confidence) = parse_vote("Yes, I agree, this is correct and sound.");
        assert_eq!(kind, VoteKind::Agree);
        assert!((0.5..=0.9).contains(&confidence));

        let (kind, _) = parse_vote("This is wrong and flawed, I disagree.");
        assert_eq!(kind, VoteKind::Disagree);

        let (kind, confidence) = parse_vote("Some further thoughts on architecture.");
        assert_eq!(kind, VoteKind::Extend);
        assert!((confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unanimous_high_confidence_converges_immediately() {
        let votes = vec![
            vote("a1", 1, VoteKind::Agree, 0.9),
            vote("a2", 1, VoteKind::Agree, 0.9),
            vote("a3", 1, VoteKind::Agree, 0.9),
        ];
        let score = consensus_score(&votes);
        assert!((score - 0.96).abs() < 1e-9);
    }

    #[test]
    fn no_votes_scores_zero() {
        assert_eq!(consensus_score(&[]), 0.0);
    }

    #[test]
    fn split_votes_score_below_unanimity() {
        let votes = vec![
            vote("a1", 1, VoteKind::Agree, 0.9),
            vote("a2", 1, VoteKind::Disagree, 0.9),
            vote("a3", 1, VoteKind::Agree, 0.9),
            vote("a4", 1, VoteKind::Pivot, 0.9),
        ];
        let score = consensus_score(&votes);
        assert!(score < 0.8);
    }

    #[test]
    fn authority_markers_tier_by_pheromone() {
        assert_eq!(authority_marker(0.9), '★');
        assert_eq!(authority_marker(0.5), '●');
        assert_eq!(authority_marker(0.2), '○');
    }

    #[test]
    fn trail_sorts_by_pheromone_descending() {
        let votes = vec![
            vote("weak", 1, VoteKind::Agree, 0.6),
            vote("strong", 1, VoteKind::Agree, 0.6),
        ];
        let mut pheromones = HashMap::new();
        pheromones.insert("weak".to_string(), 0.2);
        pheromones.insert("strong".to_string(), 0.9);
        let trail = format_trail(&votes, &pheromones);
        let strong_at = trail.find("strong").unwrap();
        let weak_at = trail.find("weak").unwrap();
        assert!(strong_at < weak_at);
        assert!(trail.starts_with('★'));
    }

    #[test]
    fn synthesizer_balances_pheromone_and_confidence() {
        let agent_ids = vec!["veteran".to_string(), "newcomer".to_string()];
        let votes = vec![
            vote("veteran", 1, VoteKind::Agree, 0.5),
            vote("newcomer", 1, VoteKind::Agree, 0.95),
        ];
        let mut pheromones = HashMap::new();
        // 0.6*0.9 + 0.4*0.5 = 0.74 vs 0.6*0.5 + 0.4*0.95 = 0.68
        pheromones.insert("veteran".to_string(), 0.9);
        pheromones.insert("newcomer".to_string(), 0.5);
        assert_eq!(
            choose_synthesizer(&agent_ids, &votes, &pheromones),
            Some("veteran".to_string())
        );
    }

    #[test]
    fn fallback_consensus_reports_distribution() {
        let votes = vec![
            vote("a1", 2, VoteKind::Agree, 0.8),
            vote("a2", 2, VoteKind::Agree, 0.7),
            vote("a3", 2, VoteKind::Disagree, 0.6),
        ];
        let consensus = fallback_consensus(&votes);
        assert!(consensus.contains("agree: 2"));
        assert!(consensus.contains("disagree: 1"));
    }

    #[test]
    fn phases_progress_explore_converge_finalize() {
        assert_eq!(iteration_phase(1, 5), "EXPLORE");
        assert_eq!(iteration_phase(3, 5), "CONVERGE");
        assert_eq!(iteration_phase(5, 5), "FINALIZE");
    }
}
