//! `regen.toml` configuration

use anyhow::{bail, Context, Result};
use regen_harness::suite::normalize_base_url;
use regen_harness::{FeedbackMode, RetryConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "regen.toml";

/// Harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegenConfig {
    pub service: ServiceSection,
    pub testing: TestingSection,
    pub retry: RetrySection,
    pub generator: GeneratorSection,
    pub report: ReportSection,
}

/// How the candidate service is started, probed and stopped
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Build/start command, run in the project root
    pub start_command: String,

    /// Shutdown command, run in the project root
    pub stop_command: String,

    /// Prints recent service logs when the health probe times out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs_command: Option<String>,

    pub health_path: String,
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            start_command: "./start.sh".to_string(),
            stop_command: "./shutdown.sh".to_string(),
            logs_command: None,
            health_path: "/health".to_string(),
            startup_timeout_secs: 120,
            shutdown_timeout_secs: 30,
            poll_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingSection {
    pub request_timeout_secs: u64,

    /// Scenarios run at once; 1 is sequential
    pub concurrency: usize,

    /// Overrides the suite's own base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for TestingSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            concurrency: 1,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub feedback_mode: FeedbackMode,
    pub retry_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_timeout_secs: Option<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            feedback_mode: FeedbackMode::LastAttempt,
            retry_delay_ms: 1000,
            session_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSection {
    /// Command that writes the project into `output_dir`
    pub command: String,
    pub timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: 600,
            output_dir: PathBuf::from("generated"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    pub output_dir: PathBuf,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("regen-reports"),
        }
    }
}

impl RegenConfig {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.validated()
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validated(mut self) -> Result<Self> {
        if let Some(url) = &self.testing.base_url {
            self.testing.base_url = Some(normalize_base_url(url)?);
        }
        if !self.service.health_path.starts_with('/') {
            bail!("service.health_path must start with /");
        }
        let positive = [
            ("service.startup_timeout_secs", self.service.startup_timeout_secs),
            ("service.shutdown_timeout_secs", self.service.shutdown_timeout_secs),
            ("service.poll_interval_secs", self.service.poll_interval_secs),
            ("testing.request_timeout_secs", self.testing.request_timeout_secs),
            ("generator.timeout_secs", self.generator.timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                bail!("{} must be positive", name);
            }
        }
        if self.retry.session_timeout_secs == Some(0) {
            bail!("retry.session_timeout_secs must be positive");
        }
        if self.testing.concurrency == 0 {
            bail!("testing.concurrency must be at least 1");
        }
        Ok(self)
    }

    /// Base URL for the session: config override, else the suite's own
    pub fn base_url(&self, suite_base_url: &str) -> String {
        self.testing
            .base_url
            .clone()
            .unwrap_or_else(|| suite_base_url.to_string())
    }

    pub fn service_config(&self, base_url: &str) -> ServiceConfig {
        ServiceConfig {
            start_command: self.service.start_command.clone(),
            stop_command: self.service.stop_command.clone(),
            logs_command: self.service.logs_command.clone(),
            base_url: base_url.to_string(),
            health_path: self.service.health_path.clone(),
            startup_timeout: Duration::from_secs(self.service.startup_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.service.shutdown_timeout_secs),
            poll_interval: Duration::from_secs(self.service.poll_interval_secs),
            ..Default::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            feedback_mode: self.retry.feedback_mode,
            retry_delay: Duration::from_millis(self.retry.retry_delay_ms),
            session_timeout: self.retry.session_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.testing.request_timeout_secs)
    }
}
