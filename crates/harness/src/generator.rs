//! Generation collaborator seam
//!
//! The harness never produces source code itself. A [`Generator`] receives the
//! original specification plus feedback from earlier failures and returns a
//! snapshot of the project it wrote.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Directories that never contribute to a project digest
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", "dist", "build"];

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("generator command exited with {exit_code:?}: {output}")]
    CommandFailed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("generator did not finish within {0} seconds")]
    TimedOut(f64),

    #[error("generator produced no files in {0}")]
    EmptyProject(PathBuf),

    #[error("generator I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Input of one generation call
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub spec: &'a str,
    /// `None` on the first attempt
    pub feedback: Option<&'a str>,
    pub attempt: u32,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<ProjectSnapshot, GenerationError>;
}

/// Reference to a generated project on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub root: PathBuf,
    pub files: usize,
    /// SHA-256 over relative paths and contents
    pub digest: String,
}

impl ProjectSnapshot {
    /// Walk `root` and digest every regular file
    pub fn capture(root: &Path) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut files = 0;

        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e));

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(std::fs::read(entry.path())?);
            hasher.update([0u8]);
            files += 1;
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
            digest: hex::encode(hasher.finalize()),
        })
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()))
}

/// Runs an external command that writes the project into `output_dir`
///
/// The command sees `REGEN_SPEC_FILE`, `REGEN_FEEDBACK_FILE` (not set on the
/// first attempt), `REGEN_ATTEMPT` and `REGEN_OUTPUT_DIR`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    output_dir: PathBuf,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            output_dir: output_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<ProjectSnapshot, GenerationError> {
        std::fs::create_dir_all(&self.output_dir)?;
        let output_dir = self.output_dir.canonicalize()?;

        let mut spec_file = tempfile::NamedTempFile::new()?;
        spec_file.write_all(request.spec.as_bytes())?;
        spec_file.flush()?;

        let feedback_file = match request.feedback {
            Some(feedback) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(feedback.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };

        info!("Generating project (attempt {}) into {}", request.attempt, output_dir.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&output_dir)
            .env("REGEN_SPEC_FILE", spec_file.path())
            .env("REGEN_ATTEMPT", request.attempt.to_string())
            .env("REGEN_OUTPUT_DIR", &output_dir)
            .env_remove("REGEN_FEEDBACK_FILE")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(file) = &feedback_file {
            cmd.env("REGEN_FEEDBACK_FILE", file.path());
        }

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| GenerationError::TimedOut(self.timeout.as_secs_f64()))??;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(GenerationError::CommandFailed {
                exit_code: output.status.code(),
                output: crate::service::tail_lines(&text, 50),
            });
        }

        let snapshot = ProjectSnapshot::capture(&output_dir)?;
        if snapshot.files == 0 {
            return Err(GenerationError::EmptyProject(output_dir));
        }
        debug!("Generated {} files, digest {}", snapshot.files, snapshot.digest);
        Ok(snapshot)
    }
}
