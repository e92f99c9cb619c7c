//! LLM provider implementations.
//!
//! Use [`create_provider`] to instantiate the configured provider. `mock`
//! selects the scripted [`MockLlmProvider`] for offline runs.

pub mod openai_compat;

use std::sync::Arc;

use crate::brain::{LlmProvider, MockLlmProvider};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::prompts::PromptLibrary;

pub use openai_compat::OpenAiCompatibleProvider;

/// Create the provider named by `config.provider`.
pub fn create_provider(
    config: &LlmConfig,
    prompts: Arc<PromptLibrary>,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.to_lowercase().as_str() {
        "openai" | "openai_compat" | "azure" | "ollama" | "vllm" | "lmstudio" => {
            Ok(Arc::new(OpenAiCompatibleProvider::new(config, prompts)?))
        }
        "mock" => Ok(Arc::new(MockLlmProvider::new())),
        other => Err(LlmError::ApiRequest {
            message: format!(
                "Unknown provider '{other}'. Supported: openai (any OpenAI-compatible endpoint), mock"
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_provider() {
        let config = LlmConfig {
            provider: "mock".to_string(),
            ..LlmConfig::default()
        };
        let provider = create_provider(&config, Arc::new(PromptLibrary::builtin())).unwrap();
        assert_eq!(provider.model_name(), "mock-model");
    }

    #[test]
    fn test_create_unknown_provider() {
        let config = LlmConfig {
            provider: "carrier-pigeon".to_string(),
            ..LlmConfig::default()
        };
        let result = create_provider(&config, Arc::new(PromptLibrary::builtin()));
        assert!(matches!(result, Err(LlmError::ApiRequest { .. })));
    }

    #[test]
    fn test_create_local_openai_compatible() {
        let config = LlmConfig {
            provider: "ollama".to_string(),
            api_key_env: "LECTERN_TEST_MISSING_OLLAMA_KEY".to_string(),
            base_url: Some("http://localhost:11434/v1".to_string()),
            model: "llama3.1:8b".to_string(),
            ..LlmConfig::default()
        };
        let provider = create_provider(&config, Arc::new(PromptLibrary::builtin())).unwrap();
        assert_eq!(provider.model_name(), "llama3.1:8b");
    }
}
