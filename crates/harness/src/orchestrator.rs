//! Retry orchestrator: generate, build/start, test, analyze, retry
//!
//! Attempts run strictly one after another. Every attempt that invoked the
//! start command also stops the service before the next attempt begins, on
//! every exit path including cancellation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analyzer::{self, ErrorRecord, Failure};
use crate::feedback::{compose_feedback, FeedbackMode};
use crate::generator::{GenerationRequest, Generator, ProjectSnapshot};
use crate::runner::{Phase, TestExecutor, TestRunResult};
use crate::service::{ServiceLifecycle, StartFailure, StopOutcome};
use crate::suite::ScenarioSuite;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub feedback_mode: FeedbackMode,
    pub retry_delay: Duration,
    /// Whole-session budget; exceeding it is a fatal error
    pub session_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            feedback_mode: FeedbackMode::LastAttempt,
            retry_delay: Duration::from_secs(1),
            session_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Total attempts allowed, capped at `u32::MAX`
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Success,
    ExhaustedRetries,
    FatalError,
}

impl SessionOutcome {
    /// Process exit code surfaced to callers
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Success => 0,
            SessionOutcome::ExhaustedRetries => 1,
            SessionOutcome::FatalError => 2,
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Success => write!(f, "success"),
            SessionOutcome::ExhaustedRetries => write!(f, "exhausted_retries"),
            SessionOutcome::FatalError => write!(f, "fatal_error"),
        }
    }
}

/// One generate/build/start/test cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, contiguous within a session
    pub number: u32,
    pub project: Option<ProjectSnapshot>,
    pub phase_reached: Phase,
    /// Feedback this attempt's generation call received
    pub feedback_received: Option<String>,
    pub result: Option<TestRunResult>,
    pub errors: Vec<ErrorRecord>,
    /// Feedback composed from this attempt's failure for the next generation call
    pub feedback: Option<String>,
    pub teardown: Option<StopOutcome>,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Attempt {
    fn new(number: u32, feedback_received: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            number,
            project: None,
            phase_reached: Phase::Generate,
            feedback_received,
            result: None,
            errors: Vec::new(),
            feedback: None,
            teardown: None,
            success: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Audit record of a whole retry session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub max_retries: u32,
    pub feedback_mode: FeedbackMode,
    pub attempts: Vec<Attempt>,
    pub outcome: SessionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RetrySession {
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

/// How an evaluated attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEnd {
    Passed,
    Failed,
    Fatal(String),
}

/// Build/start, test and stop one project against the suite
#[derive(Debug, Clone)]
pub struct Evaluator {
    lifecycle: ServiceLifecycle,
    executor: TestExecutor,
    suite: Arc<ScenarioSuite>,
}

impl Evaluator {
    pub fn new(lifecycle: ServiceLifecycle, executor: TestExecutor, suite: ScenarioSuite) -> Self {
        Self {
            lifecycle,
            executor,
            suite: Arc::new(suite),
        }
    }

    /// Fills `attempt` with results and errors; the service is always stopped
    pub async fn evaluate(&self, project_root: &Path, attempt: &mut Attempt, cancel: &CancellationToken) -> AttemptEnd {
        let base_url = self.lifecycle.config().base_url.clone();
        let mut service = self.lifecycle.handle(project_root);

        attempt.phase_reached = Phase::Build;
        info!("Attempt {}: starting service", attempt.number);

        let end = match service.start(cancel).await {
            Err(StartFailure::Cancelled) => AttemptEnd::Fatal("session cancelled during start".to_string()),
            Err(failure) => {
                let phase = match failure {
                    StartFailure::CommandFailed { .. } | StartFailure::CommandTimedOut { .. } => Phase::Build,
                    _ => Phase::Start,
                };
                attempt.phase_reached = phase;
                warn!("Attempt {}: {}", attempt.number, failure);
                info!("Attempt {}: analyzing failure", attempt.number);
                attempt.errors.push(analyzer::analyze(phase, Failure::Start(&failure)));
                attempt.result = Some(TestRunResult::not_reached(
                    attempt.number,
                    phase,
                    &self.suite,
                    attempt.started_at,
                ));
                AttemptEnd::Failed
            }
            Ok(()) => {
                attempt.phase_reached = Phase::Test;
                info!("Attempt {}: testing", attempt.number);
                let run = tokio::select! {
                    result = self.executor.run(&self.suite, &base_url, attempt.number) => Some(result),
                    _ = cancel.cancelled() => None,
                };
                match run {
                    None => AttemptEnd::Fatal("session cancelled during testing".to_string()),
                    Some(result) => {
                        let end = if result.success {
                            AttemptEnd::Passed
                        } else {
                            info!("Attempt {}: analyzing failure", attempt.number);
                            attempt.errors.extend(analyzer::analyze_run(&result));
                            AttemptEnd::Failed
                        };
                        attempt.result = Some(result);
                        end
                    }
                }
            }
        };

        let teardown = service.stop().await;
        let end = if teardown.is_stuck() && end != AttemptEnd::Passed {
            error!("Service for attempt {} is stuck stopping", attempt.number);
            AttemptEnd::Fatal(format!(
                "service is stuck stopping after attempt {}: {}",
                attempt.number,
                teardown.warning.clone().unwrap_or_default()
            ))
        } else {
            end
        };
        attempt.teardown = Some(teardown);
        attempt.success = end == AttemptEnd::Passed;
        attempt.finished_at = Utc::now();
        end
    }
}

pub struct RetryOrchestrator {
    generator: Arc<dyn Generator>,
    evaluator: Evaluator,
    config: RetryConfig,
}

impl RetryOrchestrator {
    pub fn new(generator: Arc<dyn Generator>, evaluator: Evaluator, config: RetryConfig) -> Self {
        Self {
            generator,
            evaluator,
            config,
        }
    }

    /// Run the loop until success, exhaustion or a fatal error
    pub async fn run(&self, spec: &str, cancel: &CancellationToken) -> RetrySession {
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = self.config.max_attempts();

        let session_cancel = cancel.child_token();
        let timer = self.config.session_timeout.map(|limit| {
            let token = session_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        info!("Session {} started ({} attempts max)", id, max_attempts);

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut fatal_error = None;
        let mut outcome = SessionOutcome::ExhaustedRetries;

        for number in 1..=max_attempts {
            if session_cancel.is_cancelled() {
                fatal_error = Some(self.cancel_reason(cancel));
                outcome = SessionOutcome::FatalError;
                break;
            }

            let feedback = attempts.last().and_then(|a| a.feedback.clone());
            let mut attempt = Attempt::new(number, feedback);

            info!("Attempt {}/{}: generating", number, max_attempts);
            let request = GenerationRequest {
                spec,
                feedback: attempt.feedback_received.as_deref(),
                attempt: number,
            };
            let generated = tokio::select! {
                r = self.generator.generate(request) => Some(r),
                _ = session_cancel.cancelled() => None,
            };

            let snapshot = match generated {
                Some(Ok(snapshot)) => snapshot,
                Some(Err(e)) => {
                    error!("Generation failed: {}", e);
                    attempt.finished_at = Utc::now();
                    attempts.push(attempt);
                    fatal_error = Some(format!("generation failed: {}", e));
                    outcome = SessionOutcome::FatalError;
                    break;
                }
                None => {
                    attempt.finished_at = Utc::now();
                    attempts.push(attempt);
                    fatal_error = Some(self.cancel_reason(cancel));
                    outcome = SessionOutcome::FatalError;
                    break;
                }
            };

            let root = snapshot.root.clone();
            attempt.project = Some(snapshot);
            let end = self.evaluator.evaluate(&root, &mut attempt, &session_cancel).await;

            if end == AttemptEnd::Failed {
                let history: Vec<(u32, &[ErrorRecord])> = attempts
                    .iter()
                    .map(|a| (a.number, a.errors.as_slice()))
                    .chain(std::iter::once((attempt.number, attempt.errors.as_slice())))
                    .collect();
                let composed = compose_feedback(self.config.feedback_mode, history);
                attempt.feedback = composed;
            }
            attempts.push(attempt);

            match end {
                AttemptEnd::Passed => {
                    info!("Attempt {} passed", number);
                    outcome = SessionOutcome::Success;
                    break;
                }
                AttemptEnd::Fatal(reason) => {
                    fatal_error = Some(if session_cancel.is_cancelled() {
                        self.cancel_reason(cancel)
                    } else {
                        reason
                    });
                    outcome = SessionOutcome::FatalError;
                    break;
                }
                AttemptEnd::Failed if number == max_attempts => {
                    warn!("Attempt {} failed; no retries left", number);
                    outcome = SessionOutcome::ExhaustedRetries;
                }
                AttemptEnd::Failed => {
                    info!("Attempt {} failed; retrying", number);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => {}
                        _ = session_cancel.cancelled() => {}
                    }
                }
            }
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        let finished_at = Utc::now();
        info!("Session {} finished: {}", id, outcome);

        RetrySession {
            id,
            started_at,
            finished_at,
            elapsed_ms: clock.elapsed().as_millis() as u64,
            max_retries: self.config.max_retries,
            feedback_mode: self.config.feedback_mode,
            attempts,
            outcome,
            fatal_error,
        }
    }

    fn cancel_reason(&self, cancel: &CancellationToken) -> String {
        match (cancel.is_cancelled(), self.config.session_timeout) {
            (false, Some(limit)) => format!("session timed out after {} seconds", limit.as_secs_f64()),
            _ => "session cancelled".to_string(),
        }
    }
}

/// One attempt without generation, against an existing project
pub async fn evaluate_project(
    evaluator: &Evaluator,
    project_root: &Path,
    cancel: &CancellationToken,
) -> std::io::Result<(Attempt, AttemptEnd)> {
    let mut attempt = Attempt::new(1, None);
    attempt.project = Some(ProjectSnapshot::capture(project_root)?);
    let end = evaluator.evaluate(project_root, &mut attempt, cancel).await;
    Ok((attempt, end))
}
