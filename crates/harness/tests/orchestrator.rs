//! Retry loop end to end with a scripted generator

mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use regen_harness::{
    report, ErrorCategory, Evaluator, FeedbackMode, GenerationError, GenerationRequest, Generator, Phase,
    ProjectSnapshot, RequestExecutor, RetryConfig, RetryOrchestrator, ScenarioSuite, ServiceLifecycle,
    ServiceState, SessionOutcome, TestExecutor,
};

use common::{service_config, spawn_items_service, unused_base_url, ItemsService, CRUD_SUITE};

/// What the scripted generator does on a given attempt
#[derive(Clone, Copy, PartialEq)]
enum Script {
    Broken,
    Fixed,
    Fail,
}

struct ScriptedGenerator {
    workdir: tempfile::TempDir,
    service: Option<ItemsService>,
    script: Vec<Script>,
    calls: Mutex<Vec<(u32, Option<String>)>>,
}

impl ScriptedGenerator {
    fn new(service: Option<ItemsService>, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            workdir: tempfile::tempdir().unwrap(),
            service,
            script,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(u32, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<ProjectSnapshot, GenerationError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.attempt, request.feedback.map(str::to_string)));

        let index = (request.attempt as usize - 1).min(self.script.len() - 1);
        let step = self.script[index];
        if step == Script::Fail {
            return Err(GenerationError::Other("model quota exceeded".to_string()));
        }
        if let Some(service) = &self.service {
            service.set_broken(step == Script::Broken);
        }

        let root = self.workdir.path().join("project");
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join("app.py"), format!("# attempt {}\n", request.attempt))?;
        Ok(ProjectSnapshot::capture(&root)?)
    }
}

fn orchestrator(
    generator: Arc<ScriptedGenerator>,
    base_url: &str,
    start: &str,
    stop: &str,
    max_retries: u32,
) -> RetryOrchestrator {
    let mut config = service_config(base_url, start, stop);
    config.startup_timeout = Duration::from_secs(1);
    let lifecycle = ServiceLifecycle::new(config).unwrap();
    let executor = TestExecutor::new(RequestExecutor::new(Duration::from_secs(5)).unwrap());
    let suite = ScenarioSuite::from_yaml(CRUD_SUITE).unwrap();

    RetryOrchestrator::new(
        generator,
        Evaluator::new(lifecycle, executor, suite),
        RetryConfig {
            max_retries,
            feedback_mode: FeedbackMode::LastAttempt,
            retry_delay: Duration::ZERO,
            session_timeout: None,
        },
    )
}

#[tokio::test]
async fn retry_bound_allows_max_retries_plus_one_attempts() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc), vec![Script::Broken]);
    let session = orchestrator(generator.clone(), &base_url, "true", "true", 3)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::ExhaustedRetries);
    assert_eq!(session.outcome.exit_code(), 1);
    assert_eq!(session.attempts.len(), 4);
    let numbers: Vec<u32> = session.attempts.iter().map(|a| a.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert!(session.attempts.iter().all(|a| !a.success));
    assert_eq!(generator.calls().len(), 4);
}

#[tokio::test]
async fn success_stops_early_even_with_budget_left() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc), vec![Script::Fixed]);
    let session = orchestrator(generator.clone(), &base_url, "true", "true", 3)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::Success);
    assert_eq!(session.attempts.len(), 1);
    assert_eq!(generator.calls(), vec![(1, None)]);
    assert!(session.attempts[0].errors.is_empty());
    assert!(session.attempts[0].feedback.is_none());
}

#[tokio::test]
async fn second_attempt_receives_diagnosis_of_first() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc), vec![Script::Broken, Script::Fixed]);
    let session = orchestrator(generator.clone(), &base_url, "true", "true", 3)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::Success);
    assert_eq!(session.attempts.len(), 2);

    let first = &session.attempts[0];
    assert_eq!(first.phase_reached, Phase::Test);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].category, ErrorCategory::TestFailure);
    assert!(first.errors[0].summary.contains("expected 201 got 500"));

    let calls = generator.calls();
    assert_eq!(calls[0].1, None);
    let feedback = calls[1].1.as_deref().unwrap();
    assert!(feedback.contains("TEST_FAILURE"));
    assert!(feedback.contains("expected 201 got 500"));
    assert_eq!(session.attempts[1].feedback_received.as_deref(), Some(feedback));
}

#[tokio::test]
async fn generation_error_is_fatal() {
    let generator = ScriptedGenerator::new(None, vec![Script::Fail]);
    let session = orchestrator(generator, &unused_base_url(), "true", "true", 3)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::FatalError);
    assert_eq!(session.outcome.exit_code(), 2);
    assert_eq!(session.attempts.len(), 1);
    assert!(session.fatal_error.unwrap().contains("model quota exceeded"));
}

#[tokio::test]
async fn build_failure_never_reaches_testing() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc.clone()), vec![Script::Fixed]);
    let session = orchestrator(
        generator,
        &base_url,
        "echo 'Error: Dockerfile not found' >&2; exit 1",
        "true",
        1,
    )
    .run("items api", &CancellationToken::new())
    .await;

    assert_eq!(session.outcome, SessionOutcome::ExhaustedRetries);
    assert_eq!(session.attempts.len(), 2);
    for attempt in &session.attempts {
        assert_eq!(attempt.phase_reached, Phase::Build);
        assert_eq!(attempt.errors.len(), 1);
        assert_eq!(attempt.errors[0].category, ErrorCategory::BuildError);
        let result = attempt.result.as_ref().unwrap();
        assert!(result.scenarios.is_empty());
        assert!(!result.success);
    }
    assert_eq!(svc.item_count(), 0);
}

#[tokio::test]
async fn health_timeout_proceeds_to_retry_decision() {
    let generator = ScriptedGenerator::new(None, vec![Script::Fixed]);
    let session = orchestrator(generator, &unused_base_url(), "true", "true", 0)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::ExhaustedRetries);
    let attempt = &session.attempts[0];
    assert_eq!(attempt.phase_reached, Phase::Start);
    assert_eq!(attempt.errors[0].category, ErrorCategory::RuntimeError);
    assert!(attempt.errors[0].summary.contains("within 1 seconds"));
}

#[tokio::test]
async fn stuck_teardown_is_fatal() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc), vec![Script::Broken]);
    let session = orchestrator(generator, &base_url, "true", "exit 1", 3)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::FatalError);
    assert_eq!(session.attempts.len(), 1);
    assert!(session.attempts[0].teardown.as_ref().unwrap().is_stuck());
    assert!(session.fatal_error.unwrap().contains("stuck stopping"));
}

#[tokio::test]
async fn cancelled_session_is_fatal() {
    let generator = ScriptedGenerator::new(None, vec![Script::Fixed]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let session = orchestrator(generator.clone(), &unused_base_url(), "true", "true", 3)
        .run("items api", &cancel)
        .await;

    assert_eq!(session.outcome, SessionOutcome::FatalError);
    assert!(session.attempts.is_empty());
    assert!(generator.calls().is_empty());
}

#[tokio::test]
async fn session_timeout_during_health_polling_still_stops_service() {
    let generator = ScriptedGenerator::new(None, vec![Script::Fixed]);
    let mut config = service_config(&unused_base_url(), "true", "echo stopped > stopped.txt");
    config.startup_timeout = Duration::from_secs(10);
    let lifecycle = ServiceLifecycle::new(config).unwrap();
    let executor = TestExecutor::new(RequestExecutor::new(Duration::from_secs(5)).unwrap());
    let suite = ScenarioSuite::from_yaml(CRUD_SUITE).unwrap();
    let orchestrator = RetryOrchestrator::new(
        generator.clone(),
        Evaluator::new(lifecycle, executor, suite),
        RetryConfig {
            max_retries: 3,
            retry_delay: Duration::ZERO,
            session_timeout: Some(Duration::from_millis(500)),
            ..RetryConfig::default()
        },
    );

    let session = orchestrator.run("items api", &CancellationToken::new()).await;

    assert_eq!(session.outcome, SessionOutcome::FatalError);
    assert!(session.elapsed_ms < 5_000);
    assert_eq!(
        session.fatal_error.as_deref(),
        Some("session timed out after 0.5 seconds")
    );
    assert_eq!(session.attempts.len(), 1);
    assert_eq!(generator.calls().len(), 1);

    let attempt = &session.attempts[0];
    assert!(attempt.errors.is_empty());
    assert_eq!(attempt.teardown.as_ref().unwrap().state, ServiceState::Stopped);
    let root = &attempt.project.as_ref().unwrap().root;
    assert!(root.join("stopped.txt").exists());
}

#[tokio::test]
async fn unbounded_retry_budget_does_not_overflow() {
    let generator = ScriptedGenerator::new(None, vec![Script::Fail]);
    let session = orchestrator(generator.clone(), &unused_base_url(), "true", "true", u32::MAX)
        .run("items api", &CancellationToken::new())
        .await;

    assert_eq!(session.outcome, SessionOutcome::FatalError);
    assert_eq!(session.max_retries, u32::MAX);
    assert_eq!(session.attempts.len(), 1);
    assert_eq!(generator.calls(), vec![(1, None)]);
}

#[tokio::test]
async fn session_report_round_trips() {
    let (base_url, svc) = spawn_items_service().await;
    let generator = ScriptedGenerator::new(Some(svc), vec![Script::Broken, Script::Fixed]);
    let session = orchestrator(generator, &base_url, "true", "true", 2)
        .run("items api", &CancellationToken::new())
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = report::write_session(&session, dir.path()).unwrap();
    let back = report::read_session(&path).unwrap();
    assert_eq!(back.id, session.id);
    assert_eq!(back.attempts.len(), 2);
    assert_eq!(back.outcome, SessionOutcome::Success);
    assert_eq!(back.attempts[0].errors[0].summary, session.attempts[0].errors[0].summary);
}
