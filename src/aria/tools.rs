//! Tool registry adapter.
//!
//! Skills live outside the runtime behind the [`SkillRegistry`] trait. The
//! [`ToolBroker`] presents them to the model as OpenAI-style function
//! schemas (named `<skill>__<method>`) and dispatches tool calls back with a
//! timeout. Dispatch never returns an error to the tool loop: failures,
//! timeouts and unknown tools all become unsuccessful [`ToolOutcome`]s whose
//! content is an error JSON the model can read and react to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;
use serde_json::json;
use tokio::sync::RwLock;

use crate::aria::error::EngineError;
use crate::aria::gateway::ToolSchema;
use crate::aria::types::ToolCall;

/// Default per-call execution timeout.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Separator between skill and method in wire-facing tool names.
const NAME_SEPARATOR: &str = "__";

/// One callable method exported by a skill.
#[derive(Debug, Clone)]
pub struct SkillMethod {
    pub skill: String,
    pub method: String,
    pub description: String,
    /// JSON Schema for the method arguments, straight from the manifest.
    pub parameters: serde_json::Value,
}

/// External skill collaborator: list what exists, execute by name.
#[async_trait]
pub trait SkillRegistry: Send + Sync {
    async fn list(&self) -> Vec<SkillMethod>;

    async fn execute(
        &self,
        skill: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError>;
}

/// Result of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub name: String,
    /// JSON-stringified output or error document.
    pub content: String,
    pub success: bool,
    pub duration_ms: u64,
}

impl ToolOutcome {
    fn failure(call: &ToolCall, error: impl Into<String>, started: Instant) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content: json!({"error": error.into()}).to_string(),
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Adapter between the LLM's function-calling surface and the skill
/// registry.
pub struct ToolBroker {
    registry: Arc<dyn SkillRegistry>,
    timeout: Duration,
}

impl ToolBroker {
    pub fn new(registry: Arc<dyn SkillRegistry>) -> Self {
        Self {
            registry,
            timeout: TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the schema list handed to the gateway with a request.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .list()
            .await
            .into_iter()
            .map(|m| ToolSchema {
                name: format!("{}{}{}", m.skill, NAME_SEPARATOR, m.method),
                description: m.description,
                parameters: m.parameters,
            })
            .collect()
    }

    /// Execute one tool call. Infallible by contract: every failure mode is
    /// folded into an unsuccessful outcome.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        let started = Instant::now();

        let Some((skill, method)) = call.name.split_once(NAME_SEPARATOR) else {
            return ToolOutcome::failure(
                call,
                format!("unknown tool name shape: {}", call.name),
                started,
            );
        };

        // Malformed arguments degrade to a raw-input envelope rather than a
        // refusal; many skills accept free text.
        let args = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
            Ok(value) if value.is_object() => value,
            _ => json!({"input": call.arguments}),
        };

        let result = tokio::time::timeout(
            self.timeout,
            self.registry.execute(skill, method, args),
        )
        .await;

        match result {
            Ok(Ok(output)) => ToolOutcome {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: output.to_string(),
                success: true,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(e)) => {
                warn!("tool {} failed: {}", call.name, e);
                ToolOutcome::failure(call, e.to_string(), started)
            }
            Err(_) => {
                warn!("tool {} timed out after {:?}", call.name, self.timeout);
                ToolOutcome::failure(
                    call,
                    format!("timed out after {}s", self.timeout.as_secs()),
                    started,
                )
            }
        }
    }
}

/// Handler signature for [`InMemorySkillRegistry`] methods.
pub type SkillHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, String> + Send + Sync>;

/// Simple in-process registry. Useful for wiring local skills and as the
/// test double for everything that exercises the tool loop.
#[derive(Default)]
pub struct InMemorySkillRegistry {
    methods: RwLock<HashMap<(String, String), (SkillMethod, SkillHandler)>>,
}

impl InMemorySkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, method: SkillMethod, handler: SkillHandler) {
        let key = (method.skill.clone(), method.method.clone());
        self.methods.write().await.insert(key, (method, handler));
    }
}

#[async_trait]
impl SkillRegistry for InMemorySkillRegistry {
    async fn list(&self) -> Vec<SkillMethod> {
        let mut methods: Vec<_> = self
            .methods
            .read()
            .await
            .values()
            .map(|(m, _)| m.clone())
            .collect();
        methods.sort_by(|a, b| (&a.skill, &a.method).cmp(&(&b.skill, &b.method)));
        methods
    }

    async fn execute(
        &self,
        skill: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        let handler = {
            let methods = self.methods.read().await;
            methods
                .get(&(skill.to_string(), method.to_string()))
                .map(|(_, h)| Arc::clone(h))
        };
        match handler {
            Some(handler) => handler(args).map_err(EngineError::Tool),
            None => Err(EngineError::Tool(format!(
                "skill not found: {}.{}",
                skill, method
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_echo() -> ToolBroker {
        let registry = InMemorySkillRegistry::new();
        registry
            .register(
                SkillMethod {
                    skill: "memory".to_string(),
                    method: "echo".to_string(),
                    description: "Echo the arguments back".to_string(),
                    parameters: json!({"type": "object", "properties": {}}),
                },
                Arc::new(|args| Ok(json!({"echo": args}))),
            )
            .await;
        ToolBroker::new(Arc::new(registry))
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn schemas_join_skill_and_method() {
        let broker = broker_with_echo().await;
        let schemas = broker.schemas().await;
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "memory__echo");
    }

    #[tokio::test]
    async fn dispatch_round_trips_arguments() {
        let broker = broker_with_echo().await;
        let outcome = broker.dispatch(&call("memory__echo", r#"{"q": 1}"#)).await;
        assert!(outcome.success);
        assert!(outcome.content.contains("\"q\":1"));
        assert_eq!(outcome.tool_call_id, "call_1");
    }

    #[tokio::test]
    async fn malformed_arguments_become_raw_input() {
        let broker = broker_with_echo().await;
        let outcome = broker.dispatch(&call("memory__echo", "not json at all")).await;
        assert!(outcome.success);
        assert!(outcome.content.contains("not json at all"));
    }

    #[tokio::test]
    async fn unknown_skill_is_an_unsuccessful_outcome() {
        let broker = broker_with_echo().await;
        let outcome = broker.dispatch(&call("ghost__walk", "{}")).await;
        assert!(!outcome.success);
        assert!(outcome.content.contains("skill not found"));
    }

    #[tokio::test]
    async fn bad_name_shape_is_an_unsuccessful_outcome() {
        let broker = broker_with_echo().await;
        let outcome = broker.dispatch(&call("plainname", "{}")).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn timeout_is_an_unsuccessful_outcome() {
        struct SlowRegistry;

        #[async_trait]
        impl SkillRegistry for SlowRegistry {
            async fn list(&self) -> Vec<SkillMethod> {
                Vec::new()
            }
            async fn execute(
                &self,
                _skill: &str,
                _method: &str,
                _args: serde_json::Value,
            ) -> Result<serde_json::Value, EngineError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            }
        }

        let broker =
            ToolBroker::new(Arc::new(SlowRegistry)).with_timeout(Duration::from_millis(20));
        let outcome = broker.dispatch(&call("slow__poke", "{}")).await;
        assert!(!outcome.success);
        assert!(outcome.content.contains("timed out"));
    }
}
