//! Sandboxed execution of validated candidates.
//!
//! Each execution gets a fresh, disposable isolated context — never reused
//! across attempts — with no network, a hard memory ceiling, a CPU quota
//! and dropped capabilities. Combined stdout/stderr is collected while a
//! wall-clock timer races the stream; whichever finishes first wins and
//! the loser is cancelled. Teardown (stop + remove) runs on every exit
//! path: success, timeout, or stream error.
//!
//! The container engine is reached through the [`IsolationProvider`] trait
//! so the executor logic is testable without a Docker daemon; the
//! production provider lives in [`docker`].

pub mod docker;
#[cfg(test)]
pub mod mock;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxConfig;

/// Marker line printed by the plot postlude when a figure was saved.
const PLOT_MARKER: &str = "PLOT_SAVED=";

/// Artifact filename inside the scratch directory.
const PLOT_FILENAME: &str = "plot.png";

/// Delay before a scratch directory is removed, leaving a window to read
/// artifacts back.
const SCRATCH_CLEANUP_GRACE: Duration = Duration::from_secs(1);

/// Prepended to candidates when plot capture is enabled. Forces the Agg
/// backend so rendering needs no display.
const PLOT_PRELUDE: &str = "\
import matplotlib
matplotlib.use('Agg')
import matplotlib.pyplot as plt
";

/// Appended to candidates when plot capture is enabled. Saves any open
/// figure and announces it with a marker line the executor looks for.
const PLOT_POSTLUDE: &str = "\
if plt.get_fignums():
    plt.savefig('/workspace/plot.png')
    plt.close('all')
    print('PLOT_SAVED=/workspace/plot.png')
";

/// Infrastructure failure of the isolation layer. Not attributable to the
/// candidate — the session aborts instead of burning an attempt.
#[derive(Debug)]
pub enum SandboxError {
    /// The isolation provider failed (create/start/stream/stop/remove).
    Provider(String),
    /// Scratch storage for artifacts could not be prepared.
    Scratch(String),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Provider(msg) => write!(f, "isolation provider: {msg}"),
            SandboxError::Scratch(msg) => write!(f, "scratch storage: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Resource ceilings applied to one execution context.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub cpus: f64,
    pub pids: u32,
}

/// Everything the provider needs to create one execution context.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    /// Collision-free id, also embedded in the scratch directory path so
    /// parallel sessions never share state.
    pub execution_id: String,
    pub code: String,
    pub image: String,
    pub limits: ResourceLimits,
    /// Host directory bind-mounted at `/workspace` when plot capture is
    /// enabled.
    pub scratch_dir: Option<PathBuf>,
}

/// Opaque handle to a created execution context.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    pub id: String,
}

/// Result of one sandbox invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub raw_output: String,
    pub timed_out: bool,
    /// Whether the output stream completed normally.
    pub exit_observed: bool,
    /// Captured plot artifact as a `data:image/png;base64,` URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
}

/// External isolation engine contract. All failures are [`SandboxError`].
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextHandle, SandboxError>;

    async fn start(&self, ctx: &ContextHandle) -> Result<(), SandboxError>;

    /// Combined stdout/stderr as a byte stream that ends when the context
    /// process exits.
    async fn stream_output(
        &self,
        ctx: &ContextHandle,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, SandboxError>>, SandboxError>;

    async fn stop(&self, ctx: &ContextHandle) -> Result<(), SandboxError>;

    async fn remove(&self, ctx: &ContextHandle) -> Result<(), SandboxError>;
}

/// Drives one execution context per call through its full lifecycle.
pub struct SandboxExecutor {
    provider: Arc<dyn IsolationProvider>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(provider: Arc<dyn IsolationProvider>, config: SandboxConfig) -> Self {
        Self { provider, config }
    }

    /// The per-attempt wall-clock limit, for callers describing timeouts.
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Executes one candidate in a fresh context and returns the captured
    /// output. Teardown is guaranteed on every path once the context was
    /// created.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome, SandboxError> {
        let execution_id = Uuid::new_v4().to_string();

        let scratch_dir = if self.config.capture_plots {
            Some(self.prepare_scratch(&execution_id)?)
        } else {
            None
        };

        let code = if scratch_dir.is_some() {
            instrument_for_plots(code)
        } else {
            code.to_string()
        };

        let spec = ContextSpec {
            execution_id,
            code,
            image: self.config.image.clone(),
            limits: ResourceLimits {
                memory_bytes: self.config.memory_bytes(),
                cpus: self.config.cpus,
                pids: self.config.pids,
            },
            scratch_dir: scratch_dir.clone(),
        };

        let result = self.run_in_context(&spec).await;

        let result = match result {
            Ok(mut outcome) => {
                if let Some(dir) = &scratch_dir {
                    outcome.plot = harvest_plot(&outcome.raw_output, dir);
                    outcome.raw_output = strip_plot_markers(&outcome.raw_output);
                }
                Ok(outcome)
            }
            Err(e) => Err(e),
        };

        if let Some(dir) = scratch_dir {
            schedule_scratch_cleanup(dir);
        }

        result
    }

    fn prepare_scratch(&self, execution_id: &str) -> Result<PathBuf, SandboxError> {
        let dir = self.config.scratch_base.join(execution_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SandboxError::Scratch(format!("create {}: {e}", dir.display())))?;
        // The engine needs an absolute host path for the bind mount.
        dir.canonicalize()
            .map_err(|e| SandboxError::Scratch(format!("resolve {}: {e}", dir.display())))
    }

    async fn run_in_context(&self, spec: &ContextSpec) -> Result<ExecutionOutcome, SandboxError> {
        let ctx = self.provider.create(spec).await?;
        debug!("Created execution context {}", ctx.id);

        // If this future is dropped mid-run (request cancelled), the guard
        // spawns the teardown instead — the context never outlives the
        // request.
        let mut guard = TeardownGuard::arm(self.provider.clone(), ctx.clone());
        let result = self.stream_with_timeout(&ctx).await;
        guard.disarm();
        self.teardown(&ctx).await;
        result
    }

    /// Races output collection against the wall-clock timer. On timeout
    /// the reader is cancelled (partial buffer discarded) and the context
    /// is forcibly torn down by the caller.
    async fn stream_with_timeout(
        &self,
        ctx: &ContextHandle,
    ) -> Result<ExecutionOutcome, SandboxError> {
        self.provider.start(ctx).await?;
        let mut stream = self.provider.stream_output(ctx).await?;

        let collect = async {
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                buffer.push_str(&String::from_utf8_lossy(&chunk?));
            }
            Ok::<String, SandboxError>(buffer)
        };

        match tokio::time::timeout(self.config.timeout(), collect).await {
            Ok(Ok(raw_output)) => Ok(ExecutionOutcome {
                raw_output,
                timed_out: false,
                exit_observed: true,
                plot: None,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                info!(
                    "Context {} exceeded the {}s timeout, stopping it",
                    ctx.id, self.config.timeout_secs
                );
                Ok(ExecutionOutcome {
                    raw_output: String::new(),
                    timed_out: true,
                    exit_observed: false,
                    plot: None,
                })
            }
        }
    }

    /// Stops and removes the context. A stop failure is expected for
    /// contexts that already exited; a remove failure is logged because it
    /// means a context may linger.
    async fn teardown(&self, ctx: &ContextHandle) {
        if let Err(e) = self.provider.stop(ctx).await {
            debug!("Stopping context {}: {e}", ctx.id);
        }
        if let Err(e) = self.provider.remove(ctx).await {
            warn!("Failed to remove context {}: {e}", ctx.id);
        }
    }
}

/// Last-resort cleanup for cancelled executions. The normal path disarms
/// it and tears down inline; only a dropped future reaches the `Drop`.
struct TeardownGuard {
    provider: Arc<dyn IsolationProvider>,
    ctx: Option<ContextHandle>,
}

impl TeardownGuard {
    fn arm(provider: Arc<dyn IsolationProvider>, ctx: ContextHandle) -> Self {
        Self {
            provider,
            ctx: Some(ctx),
        }
    }

    fn disarm(&mut self) {
        self.ctx = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let provider = self.provider.clone();
        handle.spawn(async move {
            let _ = provider.stop(&ctx).await;
            if let Err(e) = provider.remove(&ctx).await {
                warn!("Failed to remove context {} after cancellation: {e}", ctx.id);
            }
        });
    }
}

/// Wraps a candidate with the matplotlib prelude/postlude.
fn instrument_for_plots(code: &str) -> String {
    format!("{PLOT_PRELUDE}\n{code}\n\n{PLOT_POSTLUDE}")
}

/// Reads the plot artifact back when the output announces one.
fn harvest_plot(output: &str, scratch_dir: &std::path::Path) -> Option<String> {
    if !output.contains(PLOT_MARKER) {
        return None;
    }
    let path = scratch_dir.join(PLOT_FILENAME);
    match std::fs::read(&path) {
        Ok(bytes) => Some(format!("data:image/png;base64,{}", BASE64.encode(bytes))),
        Err(e) => {
            warn!("Plot announced but {} unreadable: {e}", path.display());
            None
        }
    }
}

/// Removes marker lines so the caller sees only the candidate's output.
fn strip_plot_markers(output: &str) -> String {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with(PLOT_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deletes the scratch directory after a short grace delay.
fn schedule_scratch_cleanup(dir: PathBuf) {
    tokio::spawn(async move {
        tokio::time::sleep(SCRATCH_CLEANUP_GRACE).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!("Failed to clean scratch dir {}: {e}", dir.display());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::mock::{MockProvider, MockRun};
    use super::*;

    fn test_config() -> SandboxConfig {
        SandboxConfig {
            timeout_secs: 2,
            ..SandboxConfig::default()
        }
    }

    fn executor(provider: Arc<MockProvider>) -> SandboxExecutor {
        SandboxExecutor::new(provider, test_config())
    }

    // ── Lifecycle ────────────────────────────────────────

    #[tokio::test]
    async fn test_successful_run_collects_output() {
        let provider = MockProvider::single(MockRun::Output("hello\n".to_string()));
        let outcome = executor(provider.clone()).execute("print('hello')").await.unwrap();
        assert_eq!(outcome.raw_output, "hello\n");
        assert!(!outcome.timed_out);
        assert!(outcome.exit_observed);
        assert_eq!(
            provider.events(),
            vec!["create", "start", "stream", "stop", "remove"]
        );
    }

    #[tokio::test]
    async fn test_context_is_fresh_per_call() {
        let provider = MockProvider::scripted(vec![
            MockRun::Output("one".to_string()),
            MockRun::Output("two".to_string()),
        ]);
        let exec = executor(provider.clone());
        exec.execute("print(1)").await.unwrap();
        exec.execute("print(2)").await.unwrap();
        let ids = provider.created_ids();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1], "execution ids must be collision-free");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_buffer_and_tears_down() {
        let provider = MockProvider::single(MockRun::Hang);
        let outcome = executor(provider.clone())
            .execute("while True: pass")
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.exit_observed);
        assert_eq!(outcome.raw_output, "");
        // Cleanup is guaranteed even when the timer wins the race.
        assert_eq!(
            provider.events(),
            vec!["create", "start", "stream", "stop", "remove"]
        );
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_context() {
        let provider = MockProvider::single(MockRun::Hang);
        let exec = Arc::new(executor(provider.clone()));

        let task = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute("while True: pass").await }
        });

        // Let the task reach the hanging stream, then cancel it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        let _ = task.await;

        // The drop guard spawns the teardown; give it a moment to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = provider.events();
        assert!(events.contains(&"stop"), "events: {events:?}");
        assert!(events.contains(&"remove"), "events: {events:?}");
    }

    #[tokio::test]
    async fn test_create_failure_is_sandbox_error() {
        let provider = MockProvider::single(MockRun::FailCreate("daemon down".to_string()));
        let err = executor(provider.clone()).execute("print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provider(_)));
        // Nothing was created, so nothing to tear down.
        assert_eq!(provider.events(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_start_failure_still_removes_context() {
        let provider = MockProvider::single(MockRun::FailStart("oom".to_string()));
        let err = executor(provider.clone()).execute("print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::Provider(_)));
        assert_eq!(provider.events(), vec!["create", "start", "stop", "remove"]);
    }

    // ── Plot capture ─────────────────────────────────────

    #[tokio::test]
    async fn test_plot_harvested_and_markers_stripped() {
        let scratch = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            capture_plots: true,
            scratch_base: scratch.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let provider = MockProvider::single(MockRun::Output(
            "computed\nPLOT_SAVED=/workspace/plot.png\n".to_string(),
        ));
        // The mock drops the staged artifact into the scratch dir at
        // create time, standing in for the candidate writing it.
        provider.stage_scratch_file(PLOT_FILENAME, &[137, 80, 78, 71]);
        let exec = SandboxExecutor::new(provider.clone(), config);

        let outcome = exec.execute("plt.plot([1, 2])").await.unwrap();
        assert_eq!(outcome.raw_output, "computed");
        let plot = outcome.plot.expect("plot artifact");
        assert!(plot.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn test_plot_code_instrumented_only_when_enabled() {
        let provider = MockProvider::single(MockRun::Output(String::new()));
        executor(provider.clone()).execute("print(1)").await.unwrap();
        let spec = provider.last_spec().unwrap();
        assert!(!spec.code.contains("matplotlib"));
        assert!(spec.scratch_dir.is_none());
    }

    #[tokio::test]
    async fn test_no_marker_means_no_plot() {
        let scratch = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            capture_plots: true,
            scratch_base: scratch.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let provider = MockProvider::single(MockRun::Output("just text\n".to_string()));
        let outcome = SandboxExecutor::new(provider, config)
            .execute("print('just text')")
            .await
            .unwrap();
        assert!(outcome.plot.is_none());
    }

    // ── Helpers ──────────────────────────────────────────

    #[test]
    fn test_instrumentation_wraps_candidate() {
        let wrapped = instrument_for_plots("plt.plot([1])");
        assert!(wrapped.starts_with("import matplotlib"));
        assert!(wrapped.contains("plt.plot([1])"));
        assert!(wrapped.trim_end().ends_with("print('PLOT_SAVED=/workspace/plot.png')"));
    }

    #[test]
    fn test_strip_plot_markers() {
        let output = "line one\nPLOT_SAVED=/workspace/plot.png\nline two";
        assert_eq!(strip_plot_markers(output), "line one\nline two");
    }
}
