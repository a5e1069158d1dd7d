//! Service lifecycle against real shell commands

mod common;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use regen_harness::analyzer::{analyze, Failure};
use regen_harness::{ErrorCategory, Phase, ServiceLifecycle, ServiceState, StartFailure};

use common::{service_config, spawn_items_service, unused_base_url};

#[tokio::test]
async fn start_polls_health_until_ready() {
    let (base_url, _svc) = spawn_items_service().await;
    let project = tempfile::tempdir().unwrap();
    let lifecycle = ServiceLifecycle::new(service_config(&base_url, "echo started > started.txt", "rm started.txt")).unwrap();

    let mut service = lifecycle.handle(project.path());
    service.start(&CancellationToken::new()).await.unwrap();
    assert_eq!(service.state(), ServiceState::Started);
    assert!(project.path().join("started.txt").exists());

    let outcome = service.stop().await;
    assert_eq!(outcome.state, ServiceState::Stopped);
    assert!(outcome.warning.is_none());
    assert!(!project.path().join("started.txt").exists());
}

#[tokio::test]
async fn missing_dockerfile_is_a_build_error() {
    let project = tempfile::tempdir().unwrap();
    let lifecycle = ServiceLifecycle::new(service_config(
        &unused_base_url(),
        "echo 'Error: Dockerfile not found' >&2; exit 1",
        "true",
    ))
    .unwrap();

    let mut service = lifecycle.handle(project.path());
    let failure = service.start(&CancellationToken::new()).await.unwrap_err();
    service.stop().await;

    let record = analyze(Phase::Build, Failure::Start(&failure));
    assert_eq!(record.category, ErrorCategory::BuildError);
    assert!(record
        .suggestions
        .iter()
        .any(|s| s.contains("build context") || s.contains("required files")));
}

#[tokio::test]
async fn unhealthy_service_times_out_as_runtime_error() {
    let project = tempfile::tempdir().unwrap();
    let mut config = service_config(&unused_base_url(), "echo listening", "true");
    config.startup_timeout = Duration::from_secs(1);
    let lifecycle = ServiceLifecycle::new(config).unwrap();

    let mut service = lifecycle.handle(project.path());
    let failure = service.start(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(failure, StartFailure::HealthTimeout { .. }));
    service.stop().await;

    let record = analyze(Phase::Start, Failure::Start(&failure));
    assert_eq!(record.category, ErrorCategory::RuntimeError);
    assert!(record.summary.contains("1 seconds"));
}

#[tokio::test]
async fn logs_command_supplies_last_lines() {
    let project = tempfile::tempdir().unwrap();
    let mut config = service_config(&unused_base_url(), "true", "true");
    config.startup_timeout = Duration::from_secs(1);
    config.logs_command = Some("echo 'OSError: [Errno 98] Address already in use'".to_string());
    let lifecycle = ServiceLifecycle::new(config).unwrap();

    let mut service = lifecycle.handle(project.path());
    let failure = service.start(&CancellationToken::new()).await.unwrap_err();
    service.stop().await;

    let record = analyze(Phase::Start, Failure::Start(&failure));
    assert_eq!(record.rule, "port in use");
    assert!(record.suggestions.iter().any(|s| s.contains("port conflicts")));
}

#[tokio::test]
async fn hung_start_command_is_killed() {
    let project = tempfile::tempdir().unwrap();
    let mut config = service_config(&unused_base_url(), "sleep 30", "true");
    config.startup_timeout = Duration::from_millis(500);
    let lifecycle = ServiceLifecycle::new(config).unwrap();

    let started = std::time::Instant::now();
    let mut service = lifecycle.handle(project.path());
    let failure = service.start(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(failure, StartFailure::CommandTimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    service.stop().await;
}

#[tokio::test]
async fn cancellation_interrupts_health_polling() {
    let project = tempfile::tempdir().unwrap();
    let mut config = service_config(&unused_base_url(), "true", "true");
    config.startup_timeout = Duration::from_secs(30);
    let lifecycle = ServiceLifecycle::new(config).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let mut service = lifecycle.handle(project.path());
    let failure = service.start(&cancel).await.unwrap_err();
    assert!(matches!(failure, StartFailure::Cancelled));

    // Teardown still runs after cancellation
    let outcome = service.stop().await;
    assert_eq!(outcome.state, ServiceState::Stopped);
}

#[tokio::test]
async fn dropping_a_started_handle_runs_stop() {
    let (base_url, _svc) = spawn_items_service().await;
    let project = tempfile::tempdir().unwrap();
    let lifecycle = ServiceLifecycle::new(service_config(&base_url, "true", "echo stopped > stopped.txt")).unwrap();

    let mut service = lifecycle.handle(project.path());
    service.start(&CancellationToken::new()).await.unwrap();
    assert_eq!(service.state(), ServiceState::Started);
    drop(service);

    assert!(project.path().join("stopped.txt").exists());
}

#[tokio::test]
async fn abandoned_start_is_stopped_when_handle_drops() {
    let project = tempfile::tempdir().unwrap();
    let mut config = service_config(&unused_base_url(), "true", "echo stopped > stopped.txt");
    config.startup_timeout = Duration::from_secs(10);
    let lifecycle = ServiceLifecycle::new(config).unwrap();

    let mut service = lifecycle.handle(project.path());
    let cancel = CancellationToken::new();
    let abandoned = tokio::time::timeout(Duration::from_millis(300), service.start(&cancel)).await;
    assert!(abandoned.is_err());
    assert_eq!(service.state(), ServiceState::Started);
    drop(service);

    assert!(project.path().join("stopped.txt").exists());
}
