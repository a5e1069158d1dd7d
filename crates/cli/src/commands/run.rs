//! `regen run`: the full generate/test/retry loop

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regen_harness::{report, CommandGenerator, FeedbackMode, RetryOrchestrator};

use crate::config::RegenConfig;
use crate::output::{print_info, print_session, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Specification handed to the generator
    #[arg(long)]
    spec: PathBuf,

    /// Scenario suite (YAML or JSON)
    #[arg(long)]
    suite: PathBuf,

    /// Retries after the first attempt
    #[arg(long)]
    max_retries: Option<u32>,

    /// Feedback accumulation (last_attempt, cumulative)
    #[arg(long)]
    feedback_mode: Option<FeedbackMode>,

    /// Generator command, overrides [generator].command
    #[arg(long)]
    generator: Option<String>,

    /// Directory the generator writes the project into
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Directory for the session report
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

/// Returns the process exit code
pub async fn execute(args: RunArgs, mut config: RegenConfig, format: OutputFormat) -> Result<i32> {
    if let Some(n) = args.max_retries {
        config.retry.max_retries = n;
    }
    if let Some(mode) = args.feedback_mode {
        config.retry.feedback_mode = mode;
    }
    if let Some(command) = args.generator {
        config.generator.command = command;
    }
    if let Some(dir) = args.project_dir {
        config.generator.output_dir = dir;
    }
    if let Some(dir) = args.report_dir {
        config.report.output_dir = dir;
    }
    if config.generator.command.trim().is_empty() {
        bail!("no generator command configured; set [generator].command or pass --generator");
    }

    let spec = std::fs::read_to_string(&args.spec)
        .with_context(|| format!("reading spec {}", args.spec.display()))?;
    let suite = super::load_suite(&args.suite)?;

    let generator = CommandGenerator::new(
        config.generator.command.clone(),
        config.generator.output_dir.clone(),
        Duration::from_secs(config.generator.timeout_secs),
    );
    let evaluator = super::build_evaluator(&config, suite)?;
    let orchestrator = RetryOrchestrator::new(Arc::new(generator), evaluator, config.retry_config());

    let cancel = super::ctrl_c_token();
    let session = orchestrator.run(&spec, &cancel).await;

    let path = report::write_session(&session, &config.report.output_dir)?;
    print_session(&session, format);
    if matches!(format, OutputFormat::Table) {
        print_info(&format!("Report: {}", path.display()));
    }

    Ok(session.outcome.exit_code())
}
