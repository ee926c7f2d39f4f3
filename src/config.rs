use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_pids")]
    pub pids: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Wrap candidates with a matplotlib prelude and capture plot artifacts.
    #[serde(default)]
    pub capture_plots: bool,
    #[serde(default = "default_scratch_base")]
    pub scratch_base: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Whether an ImportError classification aborts the session.
    /// A missing module inside an image the operator controls may be
    /// installable rather than structural, so this is policy, not algorithm.
    #[serde(default = "default_import_errors_fatal")]
    pub import_errors_fatal: bool,
}

/// Allow-list overrides. Empty lists mean "use the builtin tables".
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ValidatorConfig {
    #[serde(default)]
    pub allowed_modules: Vec<String>,
    #[serde(default)]
    pub allowed_builtins: Vec<String>,
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_memory_mb() -> u64 {
    200
}

fn default_cpus() -> f64 {
    1.0
}

fn default_pids() -> u32 {
    64
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_scratch_base() -> PathBuf {
    PathBuf::from("./tmp/outputs")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_import_errors_fatal() -> bool {
    true
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids: default_pids(),
            timeout_secs: default_timeout_secs(),
            capture_plots: false,
            scratch_base: default_scratch_base(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            import_errors_fatal: default_import_errors_fatal(),
        }
    }
}

impl SandboxConfig {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${HF_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
