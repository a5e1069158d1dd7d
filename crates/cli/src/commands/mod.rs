//! CLI Commands

pub mod config;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use regen_harness::{Evaluator, RequestExecutor, ScenarioSuite, ServiceLifecycle, TestExecutor};

use crate::config::RegenConfig;

/// Load and validate a scenario suite file
pub fn load_suite(path: &Path) -> Result<ScenarioSuite> {
    ScenarioSuite::from_file(path).with_context(|| format!("loading suite {}", path.display()))
}

/// Lifecycle, executor and suite wired from the configuration
pub fn build_evaluator(config: &RegenConfig, suite: ScenarioSuite) -> Result<Evaluator> {
    let base_url = config.base_url(&suite.base_url);
    let lifecycle = ServiceLifecycle::new(config.service_config(&base_url))?;
    let executor = TestExecutor::new(RequestExecutor::new(config.request_timeout())?)
        .with_concurrency(config.testing.concurrency);
    Ok(Evaluator::new(lifecycle, executor, suite))
}

/// Token cancelled on Ctrl-C
pub fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping the service before exit");
            trigger.cancel();
        }
    });
    token
}
