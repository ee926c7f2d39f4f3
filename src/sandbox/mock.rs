//! Scripted isolation provider for executor and loop tests.
//!
//! Records every lifecycle call so tests can assert the cleanup invariant,
//! and replays a scripted run per `create` so multi-attempt sessions can
//! be driven without a container engine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use super::{ContextHandle, ContextSpec, IsolationProvider, SandboxError};

/// Behavior of one scripted execution.
#[derive(Debug, Clone)]
pub enum MockRun {
    /// Stream yields this output, then ends normally.
    Output(String),
    /// Stream never ends — forces the timeout race.
    Hang,
    /// `create` fails with a provider error.
    FailCreate(String),
    /// `start` fails with a provider error.
    FailStart(String),
}

pub struct MockProvider {
    runs: Mutex<VecDeque<MockRun>>,
    current: Mutex<Option<MockRun>>,
    events: Mutex<Vec<&'static str>>,
    specs: Mutex<Vec<ContextSpec>>,
    staged_file: Mutex<Option<(String, Vec<u8>)>>,
}

impl MockProvider {
    /// A provider that replays `runs` in order, one per `create` call.
    /// The last run is repeated if more executions happen.
    pub fn scripted(runs: Vec<MockRun>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into()),
            current: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
            staged_file: Mutex::new(None),
        })
    }

    pub fn single(run: MockRun) -> Arc<Self> {
        Self::scripted(vec![run])
    }

    /// Lifecycle calls observed so far, in order.
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    /// Execution ids of every created context.
    pub fn created_ids(&self) -> Vec<String> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.execution_id.clone())
            .collect()
    }

    /// The spec of the most recent `create` call.
    pub fn last_spec(&self) -> Option<ContextSpec> {
        self.specs.lock().unwrap().last().cloned()
    }

    /// Stages a file the mock writes into the scratch directory at
    /// `create` time, standing in for an artifact the candidate produced.
    pub fn stage_scratch_file(&self, name: &str, bytes: &[u8]) {
        *self.staged_file.lock().unwrap() = Some((name.to_string(), bytes.to_vec()));
    }

    fn record(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    fn next_run(&self) -> MockRun {
        let mut runs = self.runs.lock().unwrap();
        let run = if runs.len() > 1 {
            runs.pop_front().expect("non-empty runs")
        } else {
            runs.front().cloned().unwrap_or(MockRun::Output(String::new()))
        };
        *self.current.lock().unwrap() = Some(run.clone());
        run
    }
}

#[async_trait]
impl IsolationProvider for MockProvider {
    async fn create(&self, spec: &ContextSpec) -> Result<ContextHandle, SandboxError> {
        self.record("create");
        self.specs.lock().unwrap().push(spec.clone());

        if let (Some(dir), Some((name, bytes))) =
            (&spec.scratch_dir, self.staged_file.lock().unwrap().as_ref())
        {
            std::fs::write(dir.join(name), bytes)
                .map_err(|e| SandboxError::Scratch(e.to_string()))?;
        }

        match self.next_run() {
            MockRun::FailCreate(msg) => Err(SandboxError::Provider(msg)),
            _ => Ok(ContextHandle {
                id: format!("mock-{}", spec.execution_id),
            }),
        }
    }

    async fn start(&self, _ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.record("start");
        match self.current.lock().unwrap().as_ref() {
            Some(MockRun::FailStart(msg)) => Err(SandboxError::Provider(msg.clone())),
            _ => Ok(()),
        }
    }

    async fn stream_output(
        &self,
        _ctx: &ContextHandle,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, SandboxError>>, SandboxError> {
        self.record("stream");
        let run = self.current.lock().unwrap().clone();
        match run {
            Some(MockRun::Hang) => Ok(futures::stream::pending().boxed()),
            Some(MockRun::Output(text)) => {
                Ok(futures::stream::iter(vec![Ok(text.into_bytes())]).boxed())
            }
            _ => Ok(futures::stream::iter(vec![]).boxed()),
        }
    }

    async fn stop(&self, _ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.record("stop");
        Ok(())
    }

    async fn remove(&self, _ctx: &ContextHandle) -> Result<(), SandboxError> {
        self.record("remove");
        Ok(())
    }
}
