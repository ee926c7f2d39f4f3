//! `LlmClient` trait — abstraction over LLM backends.
//!
//! Providers (Hugging Face, Anthropic, …) implement this trait so the
//! interpreter can be configured to use any supported backend via the
//! `[llm] provider` config field.

use anyhow::Result;
use async_trait::async_trait;

/// Abstraction over LLM backends.
///
/// Each provider translates a single-turn completion request into its own
/// wire format and returns the generated text. The interpreter only ever
/// needs one-shot completions (generate / repair / explain), so the
/// interface is deliberately smaller than a chat API.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends one prompt to the LLM and returns the generated text.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// Human-readable description of the provider and model.
    ///
    /// Used in status output, e.g. `"huggingface (Qwen/Qwen2.5-Coder-32B-Instruct)"`.
    fn description(&self) -> String;
}
