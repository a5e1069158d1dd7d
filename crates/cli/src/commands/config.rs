//! `regen config`: write or show the configuration

use anyhow::{bail, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

use crate::config::RegenConfig;
use crate::output::{print_document, print_success, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a configuration file with default values
    Init {
        /// Target file, defaults to the global --config path
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

pub async fn execute(cmd: ConfigCommands, config_path: &Path, format: OutputFormat) -> Result<i32> {
    match cmd {
        ConfigCommands::Init { path, force } => {
            let path = path.unwrap_or_else(|| config_path.to_path_buf());
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            RegenConfig::default().save(&path)?;
            print_success(&format!("Wrote {}", path.display()));
        }
        ConfigCommands::Show => {
            let config = RegenConfig::load(config_path)?;
            match format {
                OutputFormat::Table => println!("{}", toml::to_string_pretty(&config)?),
                other => print_document(&config, other),
            }
        }
    }
    Ok(0)
}
