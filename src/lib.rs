// src/lib.rs

// Import the top-level `aria` module.
pub mod aria;

// Re-export the component modules at the crate root so downstream code and
// tests reach them as `aria::router` instead of `aria::aria::router`.
pub use aria::{
    agent_pool, catalog, chat_engine, config, context, engine, error, gateway, protection,
    roundtable, router, scheduler, scoring, store, streaming, swarm, tools, types,
};

// Re-exporting key items for easier external access.
pub use aria::config::EngineConfig;
pub use aria::engine::Engine;
pub use aria::error::EngineError;
pub use aria::gateway::{LlmBackend, LlmGateway, LlmResponse, TokenUsage};
pub use aria::types::{AgentState, ChatMessage, CronJob, MessageRole, Session};
