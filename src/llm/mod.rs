pub mod anthropic;
pub mod client;
pub mod huggingface;

pub use client::LlmClient;

use anyhow::bail;

use crate::config::LlmConfig;
use anthropic::AnthropicClient;
use huggingface::HuggingFaceClient;

/// Builds the LLM client named by the `[llm] provider` config field.
pub fn build_client(config: &LlmConfig) -> anyhow::Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "huggingface" => Ok(Box::new(HuggingFaceClient::new(config.clone()))),
        "anthropic" => Ok(Box::new(AnthropicClient::new(config.clone()))),
        other => bail!(
            "Unsupported LLM provider: '{other}'. Supported: 'huggingface', 'anthropic'."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "m".to_string(),
            api_key: "k".to_string(),
            max_tokens_per_request: 100,
        }
    }

    #[test]
    fn test_factory_builds_known_providers() {
        assert!(build_client(&config_for("huggingface")).is_ok());
        assert!(build_client(&config_for("anthropic")).is_ok());
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let err = build_client(&config_for("gpt4all")).err().unwrap();
        assert!(err.to_string().contains("gpt4all"));
    }
}
