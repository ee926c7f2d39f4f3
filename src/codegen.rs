//! Code generation, repair and explanation via an LLM backend.
//!
//! The repair loop talks to the model exclusively through the
//! [`CodeCollaborator`] trait; [`CodeModel`] is the production
//! implementation on top of any [`LlmClient`]. Responses are stripped of
//! markdown code fences before they are treated as candidates — models
//! wrap code in ```python blocks no matter how firmly told not to.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

use crate::llm::LlmClient;
use crate::retry;

/// Transient LLM failures retried before giving up on a call.
const MAX_LLM_RETRIES: u32 = 2;

const GENERATE_SYSTEM: &str = "You write Python 3.11 code. You only ever answer with code, \
     never with prose or markdown around it.";

const EXPLAIN_SYSTEM: &str = "You explain Python code to beginners, concisely and accurately.";

/// External collaborator contract of the repair loop: obtain a first
/// candidate, obtain a fixed candidate, explain the final code.
#[async_trait]
pub trait CodeCollaborator: Send + Sync {
    /// Generates a first candidate for a natural-language prompt.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Attempts to fix failing code given the error message. `None`
    /// signals "cannot improve further" and drives the loop's no-progress
    /// exit.
    async fn repair(&self, code: &str, error: &str) -> Result<Option<String>>;

    /// Explains the final code. Best-effort: failures are logged and
    /// swallowed, never blocking a successful session.
    async fn explain(&self, code: &str) -> Option<String>;
}

/// Production collaborator backed by an [`LlmClient`].
pub struct CodeModel {
    client: Box<dyn LlmClient>,
}

impl CodeModel {
    pub fn new(client: Box<dyn LlmClient>) -> Self {
        Self { client }
    }

    pub fn description(&self) -> String {
        self.client.description()
    }
}

#[async_trait]
impl CodeCollaborator for CodeModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let user_prompt = format!(
            "Write Python 3.11 code for: \"{prompt}\"\n\n\
             If this involves plotting, use matplotlib. \
             Return only the Python code without explanations."
        );

        let text = retry::with_retries("generate", MAX_LLM_RETRIES, || {
            self.client.complete(GENERATE_SYSTEM, &user_prompt)
        })
        .await?;

        Ok(strip_code_fences(&text))
    }

    async fn repair(&self, code: &str, error: &str) -> Result<Option<String>> {
        let user_prompt = format!(
            "This Python code failed:\n```python\n{code}\n```\n\n\
             Error:\n{error}\n\n\
             Return only the corrected Python code without explanations. \
             If you cannot fix it, return nothing."
        );

        let text = retry::with_retries("repair", MAX_LLM_RETRIES, || {
            self.client.complete(GENERATE_SYSTEM, &user_prompt)
        })
        .await?;

        let fixed = strip_code_fences(&text);
        if fixed.is_empty() {
            return Ok(None);
        }
        Ok(Some(fixed))
    }

    async fn explain(&self, code: &str) -> Option<String> {
        let user_prompt = format!("Explain this Python script to a beginner:\n```python\n{code}\n```");

        match self.client.complete(EXPLAIN_SYSTEM, &user_prompt).await {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(text.to_string())
                }
            }
            Err(e) => {
                warn!("Explanation failed (non-blocking): {e}");
                None
            }
        }
    }
}

/// Extracts the first fenced code block; falls back to the trimmed whole
/// text when the model returned bare code.
pub fn strip_code_fences(text: &str) -> String {
    static FENCE_RE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE_RE
        .get_or_init(|| Regex::new(r"(?s)```(?:python)?\s*\n?(.*?)```").expect("fence regex"));

    match re.captures(text) {
        Some(caps) => caps[1].trim().to_string(),
        None => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Fence stripping ──────────────────────────────────

    #[test]
    fn test_strip_python_fence() {
        let text = "Here you go:\n```python\nprint('hi')\n```\nEnjoy!";
        assert_eq!(strip_code_fences(text), "print('hi')");
    }

    #[test]
    fn test_strip_anonymous_fence() {
        assert_eq!(strip_code_fences("```\nx = 1\n```"), "x = 1");
    }

    #[test]
    fn test_bare_code_passes_through_trimmed() {
        assert_eq!(strip_code_fences("  print('hi')\n"), "print('hi')");
    }

    #[test]
    fn test_first_fence_wins() {
        let text = "```python\nfirst()\n```\ntext\n```python\nsecond()\n```";
        assert_eq!(strip_code_fences(text), "first()");
    }

    #[test]
    fn test_multiline_block_preserved() {
        let text = "```python\nfor i in range(3):\n    print(i)\n```";
        assert_eq!(strip_code_fences(text), "for i in range(3):\n    print(i)");
    }

    // ── CodeModel behavior via a scripted client ─────────

    struct ScriptedClient {
        response: String,
    }

    #[async_trait]
    impl crate::llm::LlmClient for ScriptedClient {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(self.response.clone())
        }

        fn description(&self) -> String {
            "scripted".to_string()
        }
    }

    fn model_with(response: &str) -> CodeModel {
        CodeModel::new(Box::new(ScriptedClient {
            response: response.to_string(),
        }))
    }

    #[tokio::test]
    async fn test_generate_strips_fences() {
        let model = model_with("```python\nprint('hello')\n```");
        assert_eq!(model.generate("say hello").await.unwrap(), "print('hello')");
    }

    #[tokio::test]
    async fn test_repair_empty_response_means_no_progress() {
        let model = model_with("   ");
        assert_eq!(model.repair("x", "err").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_repair_returns_stripped_candidate() {
        let model = model_with("```python\nprint(1 / 2)\n```");
        assert_eq!(
            model.repair("print(1/0)", "ZeroDivisionError").await.unwrap(),
            Some("print(1 / 2)".to_string())
        );
    }

    #[tokio::test]
    async fn test_explain_trims_and_wraps() {
        let model = model_with("  This prints a greeting.  ");
        assert_eq!(
            model.explain("print('hi')").await,
            Some("This prints a greeting.".to_string())
        );
    }

    struct FailingClient;

    #[async_trait]
    impl crate::llm::LlmClient for FailingClient {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            anyhow::bail!("provider down")
        }

        fn description(&self) -> String {
            "failing".to_string()
        }
    }

    #[tokio::test]
    async fn test_explain_failure_is_swallowed() {
        let model = CodeModel::new(Box::new(FailingClient));
        assert_eq!(model.explain("print('hi')").await, None);
    }
}
