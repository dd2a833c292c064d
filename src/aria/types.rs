//! Core data model shared across the runtime.
//!
//! The durable shapes here mirror the persistence layout one-to-one: a
//! [`Session`] owns an ordered list of [`ChatMessage`]s, an [`AgentState`]
//! row exists per registered agent, and a [`CronJob`] row per schedule. The
//! transient shapes ([`PerformanceRecord`], [`ChatOutcome`]) never hit the
//! database directly — records are folded into the persisted pheromone score
//! and outcomes are what a finished turn hands back to the caller.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// What kind of conversation a session holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Chat,
    Roundtable,
    Swarm,
    Cron,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Chat => "chat",
            SessionType::Roundtable => "roundtable",
            SessionType::Swarm => "swarm",
            SessionType::Cron => "cron",
        }
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(SessionType::Chat),
            "roundtable" => Ok(SessionType::Roundtable),
            "swarm" => Ok(SessionType::Swarm),
            "cron" => Ok(SessionType::Cron),
            other => Err(format!("unknown session type: {}", other)),
        }
    }
}

/// Lifecycle state of a session. Ended sessions keep their history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "ended" => Ok(SessionStatus::Ended),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// A conversation owned by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub agent_id: String,
    pub session_type: SessionType,
    pub title: Option<String>,
    /// Per-session model override; `None` falls through to the agent's model.
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// How many recent messages the context assembler may consider.
    pub context_window: u32,
    pub system_prompt: Option<String>,
    pub status: SessionStatus,
    pub message_count: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Role of a message within a session.
///
/// Coordination protocols persist their turns with positional roles
/// (`round-3`, `swarm-2`) so the transcript of a discussion can be replayed
/// in order; `synthesis` and `consensus` appear at most once per session and
/// always after every contributing turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    Round(u32),
    Swarm(u32),
    Synthesis,
    Consensus,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
            MessageRole::Tool => write!(f, "tool"),
            MessageRole::Round(n) => write!(f, "round-{}", n),
            MessageRole::Swarm(n) => write!(f, "swarm-{}", n),
            MessageRole::Synthesis => write!(f, "synthesis"),
            MessageRole::Consensus => write!(f, "consensus"),
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => return Ok(MessageRole::User),
            "assistant" => return Ok(MessageRole::Assistant),
            "system" => return Ok(MessageRole::System),
            "tool" => return Ok(MessageRole::Tool),
            "synthesis" => return Ok(MessageRole::Synthesis),
            "consensus" => return Ok(MessageRole::Consensus),
            _ => {}
        }
        if let Some(n) = s.strip_prefix("round-") {
            return n
                .parse::<u32>()
                .map(MessageRole::Round)
                .map_err(|_| format!("bad round role: {}", s));
        }
        if let Some(n) = s.strip_prefix("swarm-") {
            return n
                .parse::<u32>()
                .map(MessageRole::Swarm)
                .map_err(|_| format!("bad swarm role: {}", s));
        }
        Err(format!("unknown message role: {}", s))
    }
}

impl Serialize for MessageRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A tool invocation requested by the model.
///
/// `arguments` is the raw JSON string as the provider returned it; parsing is
/// deferred to dispatch so malformed arguments can fall back gracefully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One turn inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Extracted reasoning, when the model produced any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Tool calls attached to an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `tool` messages: which assistant tool call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool outputs keyed by tool_call_id, recorded on the assistant message
    /// that requested them.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tool_results: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost: f64,
    pub latency_ms: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Embedding vector for cross-session recall; absent until embedded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a bare message with sane zero counters. Callers fill in the
    /// bookkeeping fields they track.
    pub fn new(session_id: Uuid, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.into(),
            thinking: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_results: HashMap::new(),
            model: None,
            tokens_input: 0,
            tokens_output: 0,
            cost: 0.0,
            latency_ms: 0,
            metadata: serde_json::Value::Null,
            embedding: None,
            created_at: Utc::now(),
        }
    }
}

/// Specialty category used for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusType {
    Social,
    Devops,
    Analysis,
    Creative,
    Research,
}

impl FocusType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FocusType::Social => "social",
            FocusType::Devops => "devops",
            FocusType::Analysis => "analysis",
            FocusType::Creative => "creative",
            FocusType::Research => "research",
        }
    }

    /// Parse a stored focus string. Unknown strings yield `None`, which the
    /// scoring core treats the same as a declared generalist.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "social" => Some(FocusType::Social),
            "devops" => Some(FocusType::Devops),
            "analysis" => Some(FocusType::Analysis),
            "creative" => Some(FocusType::Creative),
            "research" => Some(FocusType::Research),
            _ => None,
        }
    }
}

/// Runtime status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Disabled,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Disabled => "disabled",
            AgentStatus::Terminated => "terminated",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "error" => Ok(AgentStatus::Error),
            "disabled" => Ok(AgentStatus::Disabled),
            "terminated" => Ok(AgentStatus::Terminated),
            other => Err(format!("unknown agent status: {}", other)),
        }
    }
}

/// Durable record of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Stable slug, e.g. `aria-devops`.
    pub agent_id: String,
    pub display_name: String,
    pub agent_type: String,
    /// `None` marks a generalist.
    pub focus_type: Option<FocusType>,
    pub model: String,
    pub fallback_model: Option<String>,
    /// Start of the fallback chain walked on LLM errors.
    pub parent_agent_id: Option<String>,
    pub enabled: bool,
    pub status: AgentStatus,
    /// Time-decayed performance score in [0, 1]; 0.5 is the cold start.
    pub pheromone_score: f64,
    pub consecutive_failures: u32,
    pub current_session_id: Option<Uuid>,
    pub current_task: Option<String>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub skills: Vec<String>,
    pub metadata: serde_json::Value,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            agent_type: "assistant".to_string(),
            focus_type: None,
            model: model.into(),
            fallback_model: None,
            parent_agent_id: None,
            enabled: true,
            status: AgentStatus::Idle,
            pheromone_score: 0.5,
            consecutive_failures: 0,
            current_session_id: None,
            current_task: None,
            last_active_at: None,
            skills: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// One performance sample for an agent. Held in the router's per-agent ring
/// buffer (bounded at 200) and never persisted — the persisted artifact is
/// the recomputed pheromone score.
#[derive(Debug, Clone)]
pub struct PerformanceRecord {
    pub success: bool,
    /// In [0, 1]; 1.0 means instantaneous, 0.0 means 30s or slower.
    pub speed_score: f64,
    /// In [0, 1]; derived from normalized token cost.
    pub cost_score: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub task_type: Option<String>,
}

/// What a cron job carries as work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Prompt,
    Skill,
    Pipeline,
}

impl PayloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadType::Prompt => "prompt",
            PayloadType::Skill => "skill",
            PayloadType::Pipeline => "pipeline",
        }
    }
}

impl FromStr for PayloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(PayloadType::Prompt),
            "skill" => Ok(PayloadType::Skill),
            "pipeline" => Ok(PayloadType::Pipeline),
            other => Err(format!("unknown payload type: {}", other)),
        }
    }
}

/// How a cron job's prompt runs map onto sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Fresh `cron` session per fire.
    Isolated,
    /// One session per job, reused across fires.
    Shared,
    /// The agent's designated long-lived session.
    Persistent,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Isolated => "isolated",
            SessionMode::Shared => "shared",
            SessionMode::Persistent => "persistent",
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "isolated" => Ok(SessionMode::Isolated),
            "shared" => Ok(SessionMode::Shared),
            "persistent" => Ok(SessionMode::Persistent),
            other => Err(format!("unknown session mode: {}", other)),
        }
    }
}

/// Durable record of a scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    /// `15m`-style interval shorthand, 5-field cron, or 6-field cron.
    pub schedule: String,
    pub agent_id: String,
    pub enabled: bool,
    pub payload_type: PayloadType,
    /// Opaque to the scheduler; interpreted by the dispatch target.
    pub payload: serde_json::Value,
    pub session_mode: SessionMode,
    pub max_duration_seconds: u32,
    pub retry_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub created_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        agent_id: impl Into<String>,
        payload_type: PayloadType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.into(),
            agent_id: agent_id.into(),
            enabled: true,
            payload_type,
            payload,
            session_mode: SessionMode::Isolated,
            max_duration_seconds: 300,
            retry_count: 0,
            last_run_at: None,
            last_status: None,
            last_duration_ms: None,
            last_error: None,
            next_run_at: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Result of one completed chat turn, streaming or not.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub message_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tool_results: HashMap<String, serde_json::Value>,
    pub model: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost: f64,
    pub latency_ms: i64,
    pub finish_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_role_round_trips_through_strings() {
        let roles = [
            MessageRole::User,
            MessageRole::Tool,
            MessageRole::Round(3),
            MessageRole::Swarm(10),
            MessageRole::Synthesis,
            MessageRole::Consensus,
        ];
        for role in roles {
            let s = role.to_string();
            let parsed: MessageRole = s.parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn message_role_rejects_garbage() {
        assert!("round-".parse::<MessageRole>().is_err());
        assert!("swarm-x".parse::<MessageRole>().is_err());
        assert!("moderator".parse::<MessageRole>().is_err());
    }

    #[test]
    fn focus_type_parse_is_total() {
        assert_eq!(FocusType::parse("devops"), Some(FocusType::Devops));
        assert_eq!(FocusType::parse("unknown-kind"), None);
    }

    #[test]
    fn message_role_serde_uses_string_form() {
        let json = serde_json::to_string(&MessageRole::Round(2)).unwrap();
        assert_eq!(json, "\"round-2\"");
        let back: MessageRole = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MessageRole::Round(2));
    }
}
