//! Hugging Face Inference API provider.
//!
//! Calls `POST https://api-inference.huggingface.co/models/{model}` with a
//! text-generation payload. The system prompt is prepended to the input
//! text because the endpoint has no separate system field. Responses come
//! back as a one-element array of `{generated_text}`; with
//! `return_full_text: false` the echoed prompt is excluded.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::LlmClient;
use crate::config::LlmConfig;

/// Sampling temperature for code generation — low, we want determinism.
const TEMPERATURE: f64 = 0.2;

/// Client for the Hugging Face Inference API.
pub struct HuggingFaceClient {
    client: Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    inputs: &'a str,
    parameters: GenerationParameters,
}

#[derive(Debug, Serialize)]
struct GenerationParameters {
    temperature: f64,
    max_new_tokens: u32,
    return_full_text: bool,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    generated_text: String,
}

impl HuggingFaceClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "https://api-inference.huggingface.co/models/{}",
            self.config.model
        )
    }
}

#[async_trait]
impl LlmClient for HuggingFaceClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let inputs = if system_prompt.is_empty() {
            user_prompt.to_string()
        } else {
            format!("{system_prompt}\n\n{user_prompt}")
        };

        let request = GenerationRequest {
            inputs: &inputs,
            parameters: GenerationParameters {
                temperature: TEMPERATURE,
                max_new_tokens: self.config.max_tokens_per_request,
                return_full_text: false,
            },
        };

        debug!("Calling HF Inference API ({})", self.config.model);

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            anyhow::bail!("HF Inference API error ({status}): {body}");
        }

        let mut generations: Vec<GenerationResponse> = response.json().await?;
        if generations.is_empty() {
            anyhow::bail!("HF Inference API returned no generations");
        }

        Ok(generations.remove(0).generated_text)
    }

    fn description(&self) -> String {
        format!("huggingface ({})", self.config.model)
    }
}
