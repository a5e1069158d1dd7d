//! Regen CLI - Main Entry Point
//!
//! Judges generated services against a scenario suite and drives the
//! generate/test/retry loop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod output;

use commands::{config as config_cmd, run, test, validate};

/// Regen - test-and-retry harness for generated HTTP services
#[derive(Parser)]
#[command(name = "regen")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate, test and retry until the suite passes
    Run(run::RunArgs),

    /// Build, start and test an existing project once
    Test(test::TestArgs),

    /// Parse and check a scenario suite
    Validate(validate::ValidateArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(config_cmd::ConfigCommands),
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => {
            let config = config::RegenConfig::load(&cli.config)?;
            run::execute(args, config, cli.format).await
        }
        Commands::Test(args) => {
            let config = config::RegenConfig::load(&cli.config)?;
            test::execute(args, config, cli.format).await
        }
        Commands::Validate(args) => validate::execute(args, cli.format).await,
        Commands::Config(cmd) => config_cmd::execute(cmd, &cli.config, cli.format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            2
        }
    };
    std::process::exit(code);
}
