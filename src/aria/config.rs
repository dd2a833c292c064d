//! Runtime configuration.
//!
//! All knobs live on [`EngineConfig`] with their defaults in plain sight.
//! `from_env()` reads the documented environment keys; everything is also
//! constructible by hand for tests. No config-file parsing happens here —
//! the only file the runtime reads is the model catalog (see
//! [`crate::aria::catalog`]).

use std::env;
use std::time::Duration;

use log::warn;

/// Process-wide configuration with documented defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `DATABASE_URL`. Default: `sqlite:aria.db`.
    pub database_url: String,
    /// `LITELLM_BASE_URL`. Default: `http://localhost:4000`.
    pub litellm_base_url: String,
    /// `LITELLM_MASTER_KEY`. Default: empty (gateway sends no auth header).
    pub litellm_master_key: String,
    /// `ARIA_API_KEY`. `None` means dev mode: endpoints fail open.
    pub api_key: Option<String>,
    /// `ARIA_ADMIN_KEY`. `None` means dev mode for privileged endpoints.
    pub admin_key: Option<String>,
    /// `AGENT_CONTEXT_LIMIT`: in-memory context entries a runtime agent
    /// retains between turns. Default: 8. Distinct from the per-session
    /// `context_window` (default 50) used when assembling from the database.
    pub agent_context_limit: usize,
    /// Maximum concurrent `process_with` executions in the agent pool.
    /// Default: 5.
    pub pool_capacity: usize,
    /// Maximum concurrent scheduler job executions. Default: 5.
    pub max_concurrent_jobs: usize,
    /// WebSocket keepalive interval. Default: 30s.
    pub ping_interval: Duration,
    /// Default per-session context window (messages). Default: 50.
    pub default_context_window: u32,
    /// Default per-session sampling temperature. Default: 0.7.
    pub default_temperature: f64,
    /// Default per-session max response tokens. Default: 4096.
    pub default_max_tokens: u32,
    /// Sessions with zero messages older than this are ghost-purged.
    /// Default: 15 minutes.
    pub ghost_session_age: Duration,
    /// Cosine similarity cutoff for cross-session recall. Default: 0.75.
    pub recall_similarity_cutoff: f32,
    /// Path to the YAML model catalog, if any.
    pub model_catalog_path: Option<String>,
    /// `ARIA_DEBUG`: verbose logging flag. Default: false.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:aria.db".to_string(),
            litellm_base_url: "http://localhost:4000".to_string(),
            litellm_master_key: String::new(),
            api_key: None,
            admin_key: None,
            agent_context_limit: 8,
            pool_capacity: 5,
            max_concurrent_jobs: 5,
            ping_interval: Duration::from_secs(30),
            default_context_window: 50,
            default_temperature: 0.7,
            default_max_tokens: 4096,
            ghost_session_age: Duration::from_secs(15 * 60),
            recall_similarity_cutoff: 0.75,
            model_catalog_path: None,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the environment, falling back to the
    /// documented defaults. Missing auth keys log a dev-mode warning once,
    /// at startup, rather than failing.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_key = env::var("ARIA_API_KEY").ok().filter(|k| !k.is_empty());
        let admin_key = env::var("ARIA_ADMIN_KEY").ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!("ARIA_API_KEY is not set; API authentication fails open (dev mode)");
        }
        if admin_key.is_none() {
            warn!("ARIA_ADMIN_KEY is not set; admin endpoints fail open (dev mode)");
        }

        Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            litellm_base_url: env::var("LITELLM_BASE_URL").unwrap_or(defaults.litellm_base_url),
            litellm_master_key: env::var("LITELLM_MASTER_KEY").unwrap_or_default(),
            api_key,
            admin_key,
            agent_context_limit: parse_env("AGENT_CONTEXT_LIMIT", defaults.agent_context_limit),
            pool_capacity: parse_env("ARIA_POOL_CAPACITY", defaults.pool_capacity),
            max_concurrent_jobs: parse_env("ARIA_MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs),
            ping_interval: Duration::from_secs(parse_env("ARIA_PING_INTERVAL_SECS", 30u64)),
            default_context_window: parse_env("ARIA_CONTEXT_WINDOW", defaults.default_context_window),
            default_temperature: parse_env("ARIA_TEMPERATURE", defaults.default_temperature),
            default_max_tokens: parse_env("ARIA_MAX_TOKENS", defaults.default_max_tokens),
            ghost_session_age: Duration::from_secs(60 * parse_env("ARIA_GHOST_SESSION_MINUTES", 15u64)),
            recall_similarity_cutoff: parse_env("ARIA_RECALL_CUTOFF", defaults.recall_similarity_cutoff),
            model_catalog_path: env::var("ARIA_MODEL_CATALOG").ok(),
            debug: env::var("ARIA_DEBUG").map(|v| v == "1" || v == "true").unwrap_or(false),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("ignoring unparseable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.agent_context_limit, 8);
        assert_eq!(cfg.pool_capacity, 5);
        assert_eq!(cfg.max_concurrent_jobs, 5);
        assert_eq!(cfg.default_context_window, 50);
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.ghost_session_age, Duration::from_secs(900));
    }
}
