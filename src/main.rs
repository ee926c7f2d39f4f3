mod classifier;
mod codegen;
mod config;
mod llm;
mod retry;
mod runner;
mod sandbox;
mod validator;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::codegen::CodeModel;
use crate::config::Config;
use crate::runner::SessionRunner;
use crate::sandbox::docker::DockerProvider;
use crate::sandbox::SandboxExecutor;
use crate::validator::Validator;

fn print_help() {
    println!(
        "\
fluux-interpreter v{}

An AI code interpreter: generates Python for a prompt, validates it,
runs it in a disposable sandbox, and repairs it until it works.

USAGE:
    fluux-interpreter [OPTIONS] <PROMPT>

ARGUMENTS:
    PROMPT    What the generated program should do
              (e.g. \"print the first 10 fibonacci numbers\")

OPTIONS:
    -c, --config PATH    Path to TOML configuration file
                         [default: config/interpreter.toml]
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG             Log level filter for tracing
                         (e.g. debug, fluux_interpreter=debug,warn)
    HF_TOKEN             API key for the Hugging Face Inference API
    ANTHROPIC_API_KEY    API key for Anthropic Claude models
                         (from https://console.anthropic.com/)

EXAMPLES:
    fluux-interpreter \"sort a list of words by length\"
    fluux-interpreter -c /etc/fluux/interpreter.toml \"plot sin(x)\"
    RUST_LOG=debug fluux-interpreter \"compute 2**64\"",
        env!("CARGO_PKG_VERSION"),
    );
}

/// Parsed command line: config path and the user prompt.
struct CliArgs {
    config_path: String,
    prompt: String,
}

fn parse_args() -> Result<CliArgs> {
    let mut config_path = "config/interpreter.toml".to_string();
    let mut prompt_parts: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-interpreter v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = path,
                None => bail!("{arg} requires a path argument"),
            },
            _ => prompt_parts.push(arg),
        }
    }

    if prompt_parts.is_empty() {
        bail!("No prompt given. Run with --help for usage.");
    }

    Ok(CliArgs {
        config_path,
        prompt: prompt_parts.join(" "),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_interpreter=info")),
        )
        .init();

    info!("Loading configuration from {}", cli.config_path);
    let config = Config::load(&cli.config_path)?;

    let llm = llm::build_client(&config.llm)?;
    let model = CodeModel::new(llm);
    info!("LLM: {}", model.description());
    info!(
        "Sandbox: {} ({} MB, {} cpus, {}s timeout)",
        config.sandbox.image,
        config.sandbox.memory_mb,
        config.sandbox.cpus,
        config.sandbox.timeout_secs
    );

    let provider = Arc::new(DockerProvider::connect()?);
    let executor = SandboxExecutor::new(provider, config.sandbox.clone());
    let validator = Validator::new(&config.validator);
    let classifier = classifier::Classifier::new(config.session.import_errors_fatal);

    let runner = SessionRunner::new(
        validator,
        classifier,
        executor,
        Box::new(model),
        config.session.max_attempts,
    );

    info!("Prompt: {}", cli.prompt);
    let result = runner.run(&cli.prompt).await?;
    let success = result.is_success();

    let report = result.into_report();
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
