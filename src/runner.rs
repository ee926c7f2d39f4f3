//! The repair loop — core of Fluux Interpreter.
//!
//! Drives generation, validation, sandboxed execution, classification and
//! repair as one terminating sequence per request. Validation rejections
//! and execution failures feed the repair collaborator through the same
//! channel; the loop ends on success, a fatal classification, attempt
//! exhaustion, a stalled repair, or an infrastructure failure of the
//! sandbox itself.
//!
//! Every attempt appends exactly one immutable record to the history,
//! which is returned to the caller in full — the audit trail is the
//! product as much as the final code is.

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::classifier::{Classification, Classifier};
use crate::codegen::CodeCollaborator;
use crate::sandbox::{ExecutionOutcome, SandboxExecutor};
use crate::validator::{sanitize, Validator, Verdict, Violation};

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Generated,
    Repaired,
}

/// One version of the code under test. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub text: String,
    pub origin: Origin,
    pub attempt_index: u32,
}

/// Audit record of one attempt: the candidate, what the validator said,
/// and — when execution happened — what came out and how it classified.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub index: u32,
    pub ts: String,
    pub candidate: Candidate,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

/// Validation and execution failures are fed to the repair collaborator
/// through this single tagged union — one channel, not two code paths.
#[derive(Debug, Clone)]
pub enum AttemptFailure {
    Validation(Violation),
    Execution(Classification),
}

impl AttemptFailure {
    /// The error text handed to the repair collaborator.
    pub fn message(&self) -> String {
        match self {
            AttemptFailure::Validation(v) => {
                format!("validation rejected [{:?}]: {}", v.category, v.detail)
            }
            AttemptFailure::Execution(c) => c.message.clone(),
        }
    }
}

/// Why a session ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Reserved in the caller-facing taxonomy: rejections normally feed
    /// repair rather than terminate.
    ValidationRejected,
    FatalError,
    MaxAttemptsReached,
    NoProgress,
    SandboxError,
}

impl FailureReason {
    pub fn describe(&self) -> &'static str {
        match self {
            FailureReason::ValidationRejected => "validation rejected",
            FailureReason::FatalError => "fatal error",
            FailureReason::MaxAttemptsReached => "maximum attempts reached",
            FailureReason::NoProgress => "repair made no progress",
            FailureReason::SandboxError => "sandbox infrastructure failure",
        }
    }
}

/// Terminal value of one session.
#[derive(Debug)]
pub enum SessionResult {
    Success {
        code: String,
        output: String,
        plot: Option<String>,
        explanation: Option<String>,
        attempts: u32,
        history: Vec<AttemptRecord>,
    },
    Failure {
        reason: FailureReason,
        detail: String,
        last_code: Option<String>,
        attempts: u32,
        history: Vec<AttemptRecord>,
    },
}

impl SessionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionResult::Success { .. })
    }

    /// Flattens the result into the caller-facing report shape.
    pub fn into_report(self) -> RunReport {
        match self {
            SessionResult::Success {
                code,
                output,
                plot,
                explanation,
                attempts,
                history,
            } => RunReport {
                success: true,
                code: Some(code),
                output: Some(output),
                plot,
                explanation,
                attempts,
                error: None,
                history,
            },
            SessionResult::Failure {
                reason,
                detail,
                last_code,
                attempts,
                history,
            } => RunReport {
                success: false,
                code: last_code,
                output: None,
                plot: None,
                explanation: None,
                attempts,
                error: Some(format!("{}: {detail}", reason.describe())),
                history,
            },
        }
    }
}

/// What the surrounding transport serializes back to the caller.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: Vec<AttemptRecord>,
}

/// One repair loop instance. Owns its dependencies; nothing is ambient,
/// nothing survives past `run()` — concurrent sessions share no state.
pub struct SessionRunner {
    validator: Validator,
    classifier: Classifier,
    executor: SandboxExecutor,
    collaborator: Box<dyn CodeCollaborator>,
    max_attempts: u32,
}

impl SessionRunner {
    pub fn new(
        validator: Validator,
        classifier: Classifier,
        executor: SandboxExecutor,
        collaborator: Box<dyn CodeCollaborator>,
        max_attempts: u32,
    ) -> Self {
        Self {
            validator,
            classifier,
            executor,
            collaborator,
            max_attempts,
        }
    }

    /// Runs one session to its terminal result.
    ///
    /// Candidate-attributable outcomes (including sandbox infrastructure
    /// failure) come back as `Ok(SessionResult)`; only generation/repair
    /// provider failures propagate as `Err` for the transport to surface.
    pub async fn run(&self, prompt: &str) -> Result<SessionResult> {
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut attempts: u32 = 0;
        let mut pending: Option<Candidate> = None;

        loop {
            if attempts >= self.max_attempts {
                return Ok(SessionResult::Failure {
                    reason: FailureReason::MaxAttemptsReached,
                    detail: format!("no success after {attempts} attempts"),
                    last_code: history.last().map(|r| r.candidate.text.clone()),
                    attempts,
                    history,
                });
            }
            attempts += 1;

            // Generating — first attempt from the generator, later ones
            // from the repair collaborator (already pending).
            let candidate = match pending.take() {
                Some(candidate) => candidate,
                None => {
                    info!("Attempt {attempts}: generating candidate");
                    let text = sanitize(&self.collaborator.generate(prompt).await?);
                    Candidate {
                        text,
                        origin: Origin::Generated,
                        attempt_index: attempts,
                    }
                }
            };

            // Validating — every candidate, repaired ones included.
            let verdict = self.validator.validate(&candidate.text);
            let mut record = AttemptRecord {
                index: attempts,
                ts: chrono::Utc::now().to_rfc3339(),
                candidate: candidate.clone(),
                verdict: verdict.clone(),
                outcome: None,
                classification: None,
            };

            let failure = match verdict {
                Verdict::Rejected(violation) => {
                    warn!(
                        "Attempt {attempts}: validation rejected — {}",
                        violation.detail
                    );
                    AttemptFailure::Validation(violation)
                }
                Verdict::Accepted => {
                    // Executing
                    let outcome = match self.executor.execute(&candidate.text).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            // Not the candidate's fault — retrying would
                            // burn attempts against a broken provider.
                            error!("Sandbox failure, aborting session: {e}");
                            history.push(record);
                            return Ok(SessionResult::Failure {
                                reason: FailureReason::SandboxError,
                                detail: e.to_string(),
                                last_code: Some(candidate.text),
                                attempts,
                                history,
                            });
                        }
                    };
                    record.outcome = Some(outcome.clone());

                    // Classifying — a timeout is a non-fatal runtime error.
                    let classification = if outcome.timed_out {
                        Some(Classification::timeout(self.executor.timeout()))
                    } else {
                        self.classifier.classify(&outcome.raw_output)
                    };

                    match classification {
                        None => {
                            info!("Attempt {attempts}: success");
                            history.push(record);
                            // Best-effort: a missing explanation never
                            // downgrades a success.
                            let explanation = self.collaborator.explain(&candidate.text).await;
                            return Ok(SessionResult::Success {
                                code: candidate.text,
                                output: outcome.raw_output,
                                plot: outcome.plot,
                                explanation,
                                attempts,
                                history,
                            });
                        }
                        Some(classification) if classification.fatal => {
                            warn!(
                                "Attempt {attempts}: fatal {:?}, aborting session",
                                classification.kind
                            );
                            record.classification = Some(classification.clone());
                            history.push(record);
                            return Ok(SessionResult::Failure {
                                reason: FailureReason::FatalError,
                                detail: classification.message,
                                last_code: Some(candidate.text),
                                attempts,
                                history,
                            });
                        }
                        Some(classification) => {
                            info!(
                                "Attempt {attempts}: {:?} error, will attempt repair",
                                classification.kind
                            );
                            record.classification = Some(classification.clone());
                            AttemptFailure::Execution(classification)
                        }
                    }
                }
            };

            history.push(record);

            // Repairing
            let error_message = failure.message();
            let repaired = self
                .collaborator
                .repair(&candidate.text, &error_message)
                .await?;

            match repaired {
                None => {
                    warn!("Attempt {attempts}: repair yielded no candidate");
                    return Ok(SessionResult::Failure {
                        reason: FailureReason::NoProgress,
                        detail: "repair collaborator yielded no candidate".to_string(),
                        last_code: Some(candidate.text),
                        attempts,
                        history,
                    });
                }
                Some(text) => {
                    let text = sanitize(&text);
                    if text == candidate.text {
                        warn!("Attempt {attempts}: repaired candidate is identical");
                        return Ok(SessionResult::Failure {
                            reason: FailureReason::NoProgress,
                            detail: "repaired candidate identical to the previous one".to_string(),
                            last_code: Some(candidate.text),
                            attempts,
                            history,
                        });
                    }
                    pending = Some(Candidate {
                        text,
                        origin: Origin::Repaired,
                        attempt_index: attempts + 1,
                    });
                }
            }
        }
    }
}
