//! Engine-wide error taxonomy.
//!
//! Every fallible operation in the runtime returns [`EngineError`]. The
//! variants map one-to-one onto the conceptual failure kinds the transport
//! layer translates into HTTP statuses or WebSocket `error` events: LLM
//! failures become 502, rate limits 429 with a `retry_after` hint, validation
//! problems 400, and so on. Tool failures deliberately do **not** travel as
//! errors through the tool loop — they are folded into unsuccessful tool
//! results so the model can see them (see [`crate::aria::tools`]).

use std::error::Error;
use std::fmt;

use uuid::Uuid;

/// Unified error type for the orchestration runtime.
#[derive(Debug)]
pub enum EngineError {
    /// Catch-all for internal failures that fit no other kind.
    Engine(String),
    /// The external LLM gateway failed, timed out, or returned garbage.
    Llm(String),
    /// The gateway circuit breaker is open; no call was attempted.
    CircuitOpen,
    /// No session exists with the given id.
    SessionNotFound(Uuid),
    /// The session exists but is in the wrong state for the operation.
    Session(String),
    /// A schedule string could not be parsed.
    InvalidSchedule(String),
    /// Scheduler-level failure (missing agent, job not found, ...).
    Scheduler(String),
    /// Agent pool failure: pool full, duplicate spawn, disabled agent.
    Agent(String),
    /// The router was handed an empty candidate list.
    NoCandidates,
    /// The context budget cannot fit even the pinned messages.
    Context(String),
    /// Tool dispatch failed outside the tool loop (unknown skill, bad id).
    Tool(String),
    /// An operation exceeded its deadline.
    Timeout { millis: u64 },
    /// A sliding-window rate limit was breached.
    RateLimited {
        /// Seconds until the oldest counted event leaves the window.
        retry_after_secs: u64,
    },
    /// Input failed schema or constraint validation.
    Validation(String),
    /// The session hit its message cap.
    SessionFull { limit: usize },
    /// Persistence layer failure.
    Database(sqlx::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Engine(msg) => write!(f, "engine error: {}", msg),
            EngineError::Llm(msg) => write!(f, "llm error: {}", msg),
            EngineError::CircuitOpen => write!(f, "llm circuit breaker is open"),
            EngineError::SessionNotFound(id) => write!(f, "session not found: {}", id),
            EngineError::Session(msg) => write!(f, "session error: {}", msg),
            EngineError::InvalidSchedule(s) => write!(f, "invalid schedule: {}", s),
            EngineError::Scheduler(msg) => write!(f, "scheduler error: {}", msg),
            EngineError::Agent(msg) => write!(f, "agent error: {}", msg),
            EngineError::NoCandidates => write!(f, "no candidate agents to route to"),
            EngineError::Context(msg) => write!(f, "context error: {}", msg),
            EngineError::Tool(msg) => write!(f, "tool error: {}", msg),
            EngineError::Timeout { millis } => write!(f, "timed out after {}ms", millis),
            EngineError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            EngineError::Validation(msg) => write!(f, "validation error: {}", msg),
            EngineError::SessionFull { limit } => {
                write!(f, "session is full ({} message cap)", limit)
            }
            EngineError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EngineError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Database(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(format!("bad json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_retry_hint() {
        let err = EngineError::RateLimited {
            retry_after_secs: 12,
        };
        assert!(err.to_string().contains("12s"));
    }

    #[test]
    fn session_not_found_carries_id() {
        let id = Uuid::new_v4();
        let err = EngineError::SessionNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
