//! Wires one `ProviderAdapter` instance per `ProviderKind`. The pool/retry engine look
//! adapters up by kind rather than matching on it themselves.

use std::collections::HashMap;
use std::sync::Arc;

use switchboard_core::security::ProviderKind;

use crate::adapter::ProviderAdapter;
use crate::api_key::{ApiKeyAdapter, ANTHROPIC, GITHUB_MODELS, OPENAI, OPENROUTER};
use crate::codex::CodexAdapter;
use crate::copilot::CopilotAdapter;
use crate::google::GoogleAdapter;

pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    /// Kept as a concrete type alongside the trait-object map so callers needing Google's
    /// project-discovery method (not part of the general `ProviderAdapter` trait) don't have
    /// to downcast.
    google: Arc<GoogleAdapter>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let google = Arc::new(GoogleAdapter::new());
        let mut adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(ProviderKind::Anthropic, Arc::new(ApiKeyAdapter::new(ANTHROPIC)));
        adapters.insert(ProviderKind::OpenAi, Arc::new(ApiKeyAdapter::new(OPENAI)));
        adapters.insert(ProviderKind::OpenRouter, Arc::new(ApiKeyAdapter::new(OPENROUTER)));
        adapters.insert(ProviderKind::GithubModels, Arc::new(ApiKeyAdapter::new(GITHUB_MODELS)));
        adapters.insert(ProviderKind::Google, google.clone());
        adapters.insert(ProviderKind::Copilot, Arc::new(CopilotAdapter::new()));
        adapters.insert(ProviderKind::Codex, Arc::new(CodexAdapter::new()));
        Self { adapters, google }
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<dyn ProviderAdapter> {
        self.adapters
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| panic!("no adapter registered for provider kind {kind}"))
    }

    pub fn google(&self) -> Arc<GoogleAdapter> {
        self.google.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_all_seven_providers() {
        let registry = AdapterRegistry::new();
        for kind in [
            ProviderKind::Google,
            ProviderKind::Anthropic,
            ProviderKind::OpenAi,
            ProviderKind::GithubModels,
            ProviderKind::Copilot,
            ProviderKind::OpenRouter,
            ProviderKind::Codex,
        ] {
            assert_eq!(registry.get(kind).kind(), kind);
        }
    }
}
