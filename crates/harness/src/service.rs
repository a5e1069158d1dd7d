//! Service lifecycle - build/start via external command, health polling, teardown
//!
//! A [`ServiceHandle`] owns the one live service of an attempt. Once the start
//! command has been invoked the handle counts as started (even if the command
//! failed), and `stop` must run exactly once. A handle dropped while still
//! started runs the stop command synchronously.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HarnessResult;

/// Evidence lines kept from command output
pub const OUTPUT_TAIL_LINES: usize = 200;

/// Grace period for pipe readers after the command itself exited
const READER_GRACE: Duration = Duration::from_millis(500);

/// Port probes after a failed stop before declaring the service stuck
const STUCK_PROBES: u32 = 3;

/// Configuration for starting and stopping a candidate service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Shell command that builds and launches the service
    pub start_command: String,

    /// Shell command that tears the service down
    pub stop_command: String,

    /// Optional shell command printing recent service logs
    pub logs_command: Option<String>,

    /// Base URL the service listens on
    pub base_url: String,

    /// Path of the readiness endpoint
    pub health_path: String,

    /// Overall budget for the start command plus health polling
    pub startup_timeout: Duration,

    /// Budget for the stop command
    pub shutdown_timeout: Duration,

    /// Delay between health probes
    pub poll_interval: Duration,

    /// Timeout of a single health probe
    pub probe_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            start_command: "./start.sh".to_string(),
            stop_command: "./shutdown.sh".to_string(),
            logs_command: None,
            base_url: crate::suite::DEFAULT_BASE_URL.to_string(),
            health_path: "/health".to_string(),
            startup_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.health_path)
    }
}

/// Resource-ownership state of the attempt's service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Started,
    Stopping,
    Stopped,
    StuckStopping,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Idle => write!(f, "idle"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::StuckStopping => write!(f, "stuck_stopping"),
        }
    }
}

/// Captured run of an external command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr, tail only
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }
}

/// Why the service never became ready
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StartFailure {
    /// The start command exited non-zero or could not be spawned
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },
    /// The start command did not return within the startup budget
    CommandTimedOut {
        command: String,
        after_secs: f64,
        output: String,
    },
    /// Health endpoint never answered 2xx within the startup budget
    HealthTimeout {
        waited_secs: f64,
        last_lines: String,
        last_probe: Option<String>,
    },
    Cancelled,
}

impl std::fmt::Display for StartFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartFailure::CommandFailed { command, exit_code, .. } => match exit_code {
                Some(code) => write!(f, "start command '{}' exited with code {}", command, code),
                None => write!(f, "start command '{}' failed to run", command),
            },
            StartFailure::CommandTimedOut { command, after_secs, .. } => {
                write!(f, "start command '{}' did not complete within {} seconds", command, after_secs)
            }
            StartFailure::HealthTimeout { waited_secs, .. } => {
                write!(f, "service did not become healthy within {} seconds", waited_secs)
            }
            StartFailure::Cancelled => write!(f, "start cancelled"),
        }
    }
}

/// Result of tearing the service down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOutcome {
    pub state: ServiceState,
    pub command: Option<CommandOutput>,
    pub warning: Option<String>,
}

impl StopOutcome {
    pub fn is_stuck(&self) -> bool {
        self.state == ServiceState::StuckStopping
    }
}

/// Factory for per-attempt service handles
#[derive(Debug, Clone)]
pub struct ServiceLifecycle {
    config: Arc<ServiceConfig>,
    client: reqwest::Client,
}

impl ServiceLifecycle {
    pub fn new(config: ServiceConfig) -> HarnessResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Handle for a project; nothing runs until `start`
    pub fn handle(&self, project_root: &Path) -> ServiceHandle {
        ServiceHandle {
            config: self.config.clone(),
            client: self.client.clone(),
            project_root: project_root.to_path_buf(),
            state: ServiceState::Idle,
        }
    }
}

/// The attempt's service, guarded so teardown happens on every exit path
pub struct ServiceHandle {
    config: Arc<ServiceConfig>,
    client: reqwest::Client,
    project_root: PathBuf,
    state: ServiceState,
}

impl ServiceHandle {
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Run the start command, then poll the health endpoint until ready
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), StartFailure> {
        let config = self.config.clone();
        let deadline = Instant::now() + config.startup_timeout;

        info!(
            "Starting service in {} ({})",
            self.project_root.display(),
            config.start_command
        );

        let spawned = spawn_command(&config.start_command, &self.project_root);
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(StartFailure::CommandFailed {
                    command: config.start_command.clone(),
                    exit_code: None,
                    output: format!("failed to spawn: {}", e),
                });
            }
        };
        // From here on the service may hold resources, so stop must run
        self.state = ServiceState::Started;

        let output = child
            .finish(config.start_command.clone(), remaining(deadline), Some(cancel))
            .await;

        if output.cancelled {
            return Err(StartFailure::Cancelled);
        }
        if output.timed_out {
            return Err(StartFailure::CommandTimedOut {
                command: output.command,
                after_secs: config.startup_timeout.as_secs_f64(),
                output: output.output,
            });
        }
        if output.exit_code != Some(0) {
            warn!("Start command failed with {:?}", output.exit_code);
            return Err(StartFailure::CommandFailed {
                command: output.command,
                exit_code: output.exit_code,
                output: output.output,
            });
        }

        match self.wait_for_healthy(deadline, cancel).await {
            Ok(()) => {
                info!("Service is healthy at {}", config.base_url);
                Ok(())
            }
            Err(HealthWait::Cancelled) => Err(StartFailure::Cancelled),
            Err(HealthWait::TimedOut { last_probe }) => {
                let last_lines = match &config.logs_command {
                    Some(logs) => {
                        run_command(logs, &self.project_root, config.shutdown_timeout, None)
                            .await
                            .output
                    }
                    None => output.output,
                };
                Err(StartFailure::HealthTimeout {
                    waited_secs: config.startup_timeout.as_secs_f64(),
                    last_lines: tail_lines(&last_lines, 50),
                    last_probe: Some(last_probe),
                })
            }
        }
    }

    async fn wait_for_healthy(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), HealthWait> {
        let health_url = self.config.health_url();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let budget = remaining(deadline).min(self.config.probe_timeout);

            let probe = tokio::select! {
                r = self.client.get(&health_url).timeout(budget).send() => r,
                _ = cancel.cancelled() => return Err(HealthWait::Cancelled),
            };

            let last_probe = match probe {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    debug!("Health check returned {}", resp.status());
                    format!("health endpoint returned {}", resp.status())
                }
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for service to become healthy...");
                    }
                    // Connection refused is expected while the service boots
                    if !e.is_connect() {
                        debug!("Health check error: {}", e);
                    }
                    e.to_string()
                }
            };

            if Instant::now() + self.config.poll_interval >= deadline {
                warn!("Service not healthy after {} probes", attempts);
                return Err(HealthWait::TimedOut { last_probe });
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = cancel.cancelled() => return Err(HealthWait::Cancelled),
            }
        }
    }

    /// Run the stop command once; later calls report the settled state
    pub async fn stop(&mut self) -> StopOutcome {
        match self.state {
            ServiceState::Idle => {
                self.state = ServiceState::Stopped;
                return StopOutcome {
                    state: self.state,
                    command: None,
                    warning: None,
                };
            }
            ServiceState::Started => {}
            settled => {
                return StopOutcome {
                    state: settled,
                    command: None,
                    warning: None,
                };
            }
        }

        self.state = ServiceState::Stopping;
        info!("Stopping service ({})", self.config.stop_command);

        let output = run_command(
            &self.config.stop_command,
            &self.project_root,
            self.config.shutdown_timeout,
            None,
        )
        .await;

        if output.success() {
            self.state = ServiceState::Stopped;
            return StopOutcome {
                state: self.state,
                command: Some(output),
                warning: None,
            };
        }

        let warning = if output.timed_out {
            format!(
                "stop command did not complete within {} seconds",
                self.config.shutdown_timeout.as_secs_f64()
            )
        } else {
            format!("stop command exited with {:?}", output.exit_code)
        };
        warn!("Service shutdown warning: {}", warning);

        self.state = if self.port_still_bound().await {
            warn!("Service port still accepting connections after failed stop");
            ServiceState::StuckStopping
        } else {
            ServiceState::Stopped
        };

        StopOutcome {
            state: self.state,
            command: Some(output),
            warning: Some(warning),
        }
    }

    async fn port_still_bound(&self) -> bool {
        let Some(addr) = host_port(&self.config.base_url) else {
            return false;
        };
        for probe in 0..STUCK_PROBES {
            if probe > 0 {
                sleep(Duration::from_secs(1)).await;
            }
            let connect = tokio::net::TcpStream::connect((addr.0.as_str(), addr.1));
            match tokio::time::timeout(Duration::from_secs(1), connect).await {
                Ok(Ok(_)) => continue,
                _ => return false,
            }
        }
        true
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        if self.state != ServiceState::Started {
            return;
        }
        warn!("Service handle dropped while started; running stop command");
        self.state = ServiceState::Stopping;
        match stop_blocking(&self.config.stop_command, &self.project_root, self.config.shutdown_timeout) {
            Ok(true) => self.state = ServiceState::Stopped,
            Ok(false) => {
                warn!("Stop command failed during drop");
                self.state = ServiceState::StuckStopping;
            }
            Err(e) => {
                warn!("Stop command could not run during drop: {}", e);
                self.state = ServiceState::StuckStopping;
            }
        }
    }
}

enum HealthWait {
    TimedOut { last_probe: String },
    Cancelled,
}

/// A spawned shell command with its output being collected
struct RunningCommand {
    child: tokio::process::Child,
    buffer: Arc<Mutex<Vec<u8>>>,
    readers: Vec<tokio::task::JoinHandle<()>>,
    started: Instant,
}

fn spawn_command(command: &str, cwd: &Path) -> std::io::Result<RunningCommand> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group so a hung command and its children die together
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(collect(stdout, buffer.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(collect(stderr, buffer.clone())));
    }

    Ok(RunningCommand {
        child,
        buffer,
        readers,
        started: Instant::now(),
    })
}

async fn collect<R: tokio::io::AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

impl RunningCommand {
    async fn finish(
        mut self,
        command: String,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> CommandOutput {
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let (exit_code, timed_out, was_cancelled) = tokio::select! {
            status = tokio::time::timeout(timeout, self.child.wait()) => match status {
                Ok(Ok(status)) => (status.code(), false, false),
                Ok(Err(e)) => {
                    warn!("Failed waiting for '{}': {}", command, e);
                    (None, false, false)
                }
                Err(_) => (None, true, false),
            },
            _ = cancelled => (None, false, true),
        };

        if timed_out || was_cancelled {
            self.kill().await;
        }

        // Background children may keep the pipes open; take what arrived
        let readers = std::mem::take(&mut self.readers);
        let drain = futures::future::join_all(readers);
        if tokio::time::timeout(READER_GRACE, drain).await.is_err() {
            debug!("Output pipes of '{}' still open; using partial output", command);
        }

        let raw = self
            .buffer
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();

        CommandOutput {
            command,
            exit_code,
            output: tail_lines(&raw, OUTPUT_TAIL_LINES),
            timed_out,
            cancelled: was_cancelled,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    async fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = self.child.kill().await;
    }
}

/// Run a shell command to completion under a timeout, capturing its output
pub async fn run_command(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> CommandOutput {
    match spawn_command(command, cwd) {
        Ok(running) => running.finish(command.to_string(), timeout, cancel).await,
        Err(e) => CommandOutput {
            command: command.to_string(),
            exit_code: None,
            output: format!("failed to spawn: {}", e),
            timed_out: false,
            cancelled: false,
            duration_ms: 0,
        },
    }
}

/// Synchronous stop used from `Drop`, where nothing can be awaited
fn stop_blocking(command: &str, cwd: &Path, timeout: Duration) -> std::io::Result<bool> {
    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.success());
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

fn host_port(base_url: &str) -> Option<(String, u16)> {
    let url = reqwest::Url::parse(base_url).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

/// Last `n` lines of `text`
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: &str, stop: &str, base_url: String) -> ServiceConfig {
        ServiceConfig {
            start_command: start.to_string(),
            stop_command: stop.to_string(),
            base_url,
            startup_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn unused_base_url() -> String {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        format!("http://127.0.0.1:{}", port)
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 5), "");
    }

    #[test]
    fn test_sub_second_budgets_are_not_truncated() {
        let failure = StartFailure::CommandTimedOut {
            command: "make run".to_string(),
            after_secs: Duration::from_millis(500).as_secs_f64(),
            output: String::new(),
        };
        assert_eq!(
            failure.to_string(),
            "start command 'make run' did not complete within 0.5 seconds"
        );
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("http://127.0.0.1:8000"), Some(("127.0.0.1".into(), 8000)));
        assert_eq!(host_port("https://svc.local"), Some(("svc.local".into(), 443)));
        assert_eq!(host_port("not a url"), None);
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command("echo hello; echo oops >&2; exit 3", dir.path(), Duration::from_secs(5), None).await;
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command("sleep 5", dir.path(), Duration::from_millis(200), None).await;
        assert!(out.timed_out);
        assert!(out.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_failed_start_command_still_requires_stop() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = ServiceLifecycle::new(config(
            "echo 'Error: Dockerfile not found' >&2; exit 1",
            "true",
            unused_base_url(),
        ))
        .unwrap();

        let mut service = lifecycle.handle(dir.path());
        let err = service.start(&CancellationToken::new()).await.unwrap_err();
        match err {
            StartFailure::CommandFailed { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(1));
                assert!(output.contains("Dockerfile not found"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(service.state(), ServiceState::Started);

        let outcome = service.stop().await;
        assert_eq!(outcome.state, ServiceState::Stopped);

        // Second stop is a no-op
        let again = service.stop().await;
        assert!(again.command.is_none());
    }

    #[tokio::test]
    async fn test_health_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("echo booting", "true", unused_base_url());
        cfg.startup_timeout = Duration::from_secs(1);
        let lifecycle = ServiceLifecycle::new(cfg).unwrap();

        let mut service = lifecycle.handle(dir.path());
        let err = service.start(&CancellationToken::new()).await.unwrap_err();
        match &err {
            StartFailure::HealthTimeout { waited_secs, last_lines, .. } => {
                assert_eq!(*waited_secs, 1.0);
                assert!(last_lines.contains("booting"));
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(err.to_string(), "service did not become healthy within 1 seconds");
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_failure_with_free_port_is_not_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = ServiceLifecycle::new(config("true", "exit 2", unused_base_url())).unwrap();

        let mut service = lifecycle.handle(dir.path());
        let _ = service.start(&CancellationToken::new()).await;
        let outcome = service.stop().await;
        assert_eq!(outcome.state, ServiceState::Stopped);
        assert!(outcome.warning.is_some());
    }

    #[tokio::test]
    async fn test_stop_failure_with_bound_port_is_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let lifecycle = ServiceLifecycle::new(config("true", "exit 2", base_url)).unwrap();

        let mut service = lifecycle.handle(dir.path());
        let _ = service.start(&CancellationToken::new()).await;
        let outcome = service.stop().await;
        assert!(outcome.is_stuck());
        drop(listener);
    }

    #[tokio::test]
    async fn test_stop_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let lifecycle = ServiceLifecycle::new(config("true", "exit 9", unused_base_url())).unwrap();
        let mut service = lifecycle.handle(dir.path());
        let outcome = service.stop().await;
        assert_eq!(outcome.state, ServiceState::Stopped);
        assert!(outcome.command.is_none());
    }
}
