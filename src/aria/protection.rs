//! Session protection: pre-flight checks for every message insertion.
//!
//! Validates roles and lengths, sanitizes control characters, watches for
//! prompt-injection patterns (log-and-continue, never blocking), enforces
//! sliding-window rate limits per session and per agent, caps session size,
//! and hands out the per-session advisory locks that serialize turns. The
//! locks are in-process; a multi-process deployment would swap the map for
//! DB advisory locks behind the same interface.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::aria::error::EngineError;
use crate::aria::store::SESSION_MESSAGE_CAP;

/// Sliding-window limits per session.
pub const SESSION_PER_MINUTE: usize = 20;
pub const SESSION_PER_HOUR: usize = 200;
/// Per-agent per-minute defaults.
pub const MAIN_AGENT_PER_MINUTE: usize = 30;
pub const SPECIALIST_PER_MINUTE: usize = 15;

pub const MAX_CONTENT_LENGTH: usize = 100_000;

const VALID_ROLES: &[&str] = &["user", "assistant", "system", "tool", "function"];

lazy_static! {
    static ref INJECTION_PATTERNS: Vec<(&'static str, Regex)> = vec![
        (
            "instruction-override",
            Regex::new(r"(?i)\b(ignore|disregard|forget)\b.{0,40}\b(previous|prior|above|all)\b.{0,40}\b(instructions?|prompts?|rules?)").unwrap(),
        ),
        (
            "role-override",
            Regex::new(r"(?i)\byou are now\b|\bpretend to be\b|\bact as (the )?system\b").unwrap(),
        ),
        (
            "system-impersonation",
            Regex::new(r"(?im)^\s*(system|assistant)\s*:").unwrap(),
        ),
        (
            "delimiter-escape",
            Regex::new(r"<\|im_(start|end)\|>|\[/?(INST|SYS)\]").unwrap(),
        ),
        (
            "prompt-extraction",
            Regex::new(r"(?i)\b(reveal|print|show|repeat)\b.{0,40}\b(system prompt|initial instructions)\b").unwrap(),
        ),
    ];
}

#[derive(Default)]
struct SlidingWindow {
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Record an event if the window admits it; on breach return how long
    /// until the oldest counted event expires.
    fn admit(&mut self, now: Instant, window: Duration, limit: usize) -> Result<(), u64> {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= limit {
            let oldest = *self.events.front().expect("non-empty window");
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.as_secs().max(1));
        }
        self.events.push_back(now);
        Ok(())
    }
}

pub struct SessionProtection {
    session_minute: Mutex<HashMap<Uuid, SlidingWindow>>,
    session_hour: Mutex<HashMap<Uuid, SlidingWindow>>,
    agent_minute: Mutex<HashMap<String, SlidingWindow>>,
    /// Per-agent per-minute overrides; anything absent uses the specialist
    /// default.
    agent_limits: HashMap<String, usize>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Default for SessionProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProtection {
    pub fn new() -> Self {
        let mut agent_limits = HashMap::new();
        agent_limits.insert("main".to_string(), MAIN_AGENT_PER_MINUTE);
        Self {
            session_minute: Mutex::new(HashMap::new()),
            session_hour: Mutex::new(HashMap::new()),
            agent_minute: Mutex::new(HashMap::new()),
            agent_limits,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_agent_limit(mut self, agent_id: impl Into<String>, per_minute: usize) -> Self {
        self.agent_limits.insert(agent_id.into(), per_minute);
        self
    }

    /// Advisory lock for a session. Hold it across the whole turn so two
    /// connections to the same session cannot interleave writes.
    pub async fn session_lock(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(session_id).or_default())
    }

    pub fn validate_role(&self, role: &str) -> Result<(), EngineError> {
        if VALID_ROLES.contains(&role) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!("invalid role: {}", role)))
        }
    }

    /// Strip control characters (keeping `\n`, `\t`, `\r`), trim, and
    /// enforce the length bounds.
    pub fn sanitize(&self, content: &str) -> Result<String, EngineError> {
        let cleaned: String = content
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
            .collect();
        let cleaned = cleaned.trim().to_string();
        if cleaned.is_empty() {
            return Err(EngineError::Validation("empty message content".to_string()));
        }
        if cleaned.len() > MAX_CONTENT_LENGTH {
            return Err(EngineError::Validation(format!(
                "message content exceeds {} bytes",
                MAX_CONTENT_LENGTH
            )));
        }
        Ok(cleaned)
    }

    /// Scan for prompt-injection patterns. Detection is advisory: the hit is
    /// logged and the first matching pattern name returned, but the message
    /// is never blocked.
    pub fn detect_injection(&self, session_id: Uuid, content: &str) -> Option<&'static str> {
        for (name, pattern) in INJECTION_PATTERNS.iter() {
            if pattern.is_match(content) {
                warn!(
                    "possible prompt injection ({}) in session {}",
                    name, session_id
                );
                return Some(name);
            }
        }
        None
    }

    /// Enforce the session and agent sliding windows.
    pub async fn check_rate_limits(
        &self,
        session_id: Uuid,
        agent_id: &str,
    ) -> Result<(), EngineError> {
        let now = Instant::now();

        {
            let mut windows = self.session_minute.lock().await;
            windows
                .entry(session_id)
                .or_default()
                .admit(now, Duration::from_secs(60), SESSION_PER_MINUTE)
                .map_err(|retry_after_secs| EngineError::RateLimited { retry_after_secs })?;
        }
        {
            let mut windows = self.session_hour.lock().await;
            windows
                .entry(session_id)
                .or_default()
                .admit(now, Duration::from_secs(3600), SESSION_PER_HOUR)
                .map_err(|retry_after_secs| EngineError::RateLimited { retry_after_secs })?;
        }
        {
            let limit = self
                .agent_limits
                .get(agent_id)
                .copied()
                .unwrap_or(SPECIALIST_PER_MINUTE);
            let mut windows = self.agent_minute.lock().await;
            windows
                .entry(agent_id.to_string())
                .or_default()
                .admit(now, Duration::from_secs(60), limit)
                .map_err(|retry_after_secs| EngineError::RateLimited { retry_after_secs })?;
        }
        Ok(())
    }

    pub fn check_session_size(&self, message_count: i64) -> Result<(), EngineError> {
        if message_count >= SESSION_MESSAGE_CAP as i64 {
            return Err(EngineError::SessionFull {
                limit: SESSION_MESSAGE_CAP,
            });
        }
        Ok(())
    }

    /// Full pre-flight for a message insertion: role, sanitization,
    /// injection scan, rate limits, session cap. Returns the sanitized
    /// content.
    pub async fn preflight(
        &self,
        session_id: Uuid,
        agent_id: &str,
        role: &str,
        content: &str,
        message_count: i64,
    ) -> Result<String, EngineError> {
        self.validate_role(role)?;
        let sanitized = self.sanitize(content)?;
        self.detect_injection(session_id, &sanitized);
        self.check_rate_limits(session_id, agent_id).await?;
        self.check_session_size(message_count)?;
        Ok(sanitized)
    }
}
