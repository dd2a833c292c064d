//! Model catalog: alias → provider model resolution.
//!
//! The catalog is a small YAML document keyed by model alias. Each entry
//! names the provider-qualified model string the gateway should put on the
//! wire and an optional cost tier used to build the generic fallback chain
//! (`local` → `free` → `paid`).
//!
//! ```yaml
//! models:
//!   main:
//!     provider: "openai/gpt-4o"
//!     tier: paid
//!   scout:
//!     provider: "ollama/qwen2.5"
//!     tier: local
//! ```
//!
//! Unknown aliases resolve to themselves so deployments can bypass the
//! catalog entirely and put provider strings straight into agent config.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::aria::error::EngineError;

/// Cost tier of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Local,
    Free,
    Paid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    /// Provider-qualified model string sent to the gateway.
    pub provider: String,
    #[serde(default)]
    pub tier: Option<ModelTier>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    models: HashMap<String, ModelEntry>,
}

impl ModelCatalog {
    /// Empty catalog: every alias resolves to itself.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Validation(format!("bad model catalog: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Engine(format!("cannot read model catalog: {}", e)))?;
        Self::from_yaml(&raw)
    }

    /// Resolve an alias to its provider model string. Unknown aliases pass
    /// through unchanged.
    pub fn resolve<'a>(&'a self, alias: &'a str) -> &'a str {
        self.models
            .get(alias)
            .map(|entry| entry.provider.as_str())
            .unwrap_or(alias)
    }

    /// The generic fallback chain: one representative per tier, cheapest
    /// first (`local`, then `free`, then `paid`). Entries without a tier are
    /// skipped. Within a tier the lexicographically first alias wins so the
    /// chain is deterministic across restarts.
    pub fn generic_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        for tier in [ModelTier::Local, ModelTier::Free, ModelTier::Paid] {
            let mut candidates: Vec<_> = self
                .models
                .iter()
                .filter(|(_, entry)| entry.tier == Some(tier))
                .map(|(alias, _)| alias.clone())
                .collect();
            candidates.sort();
            if let Some(alias) = candidates.into_iter().next() {
                chain.push(alias);
            }
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
models:
  main:
    provider: "openai/gpt-4o"
    tier: paid
  scout:
    provider: "ollama/qwen2.5"
    tier: local
  budget:
    provider: "groq/llama-3.1-8b"
    tier: free
  plain:
    provider: "openai/gpt-4o-mini"
"#;

    #[test]
    fn resolves_known_aliases() {
        let catalog = ModelCatalog::from_yaml(CATALOG).unwrap();
        assert_eq!(catalog.resolve("main"), "openai/gpt-4o");
        assert_eq!(catalog.resolve("scout"), "ollama/qwen2.5");
    }

    #[test]
    fn unknown_alias_passes_through() {
        let catalog = ModelCatalog::from_yaml(CATALOG).unwrap();
        assert_eq!(catalog.resolve("anthropic/claude-3-5-haiku"), "anthropic/claude-3-5-haiku");
    }

    #[test]
    fn generic_chain_orders_by_tier() {
        let catalog = ModelCatalog::from_yaml(CATALOG).unwrap();
        assert_eq!(catalog.generic_chain(), vec!["scout", "budget", "main"]);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(ModelCatalog::from_yaml("models: [not, a, map]").is_err());
    }
}
