//! Session report persistence

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::HarnessResult;
use crate::orchestrator::RetrySession;

/// Write `session-<id>.json` under `output_dir` and return its path
pub fn write_session(session: &RetrySession, output_dir: &Path) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;

    let path = output_dir.join(format!("session-{}.json", session.id));
    let json = serde_json::to_string_pretty(session)?;
    std::fs::write(&path, json)?;

    info!("Session report written to {}", path.display());
    Ok(path)
}

/// Read a previously written report
pub fn read_session(path: &Path) -> HarnessResult<RetrySession> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackMode;
    use crate::orchestrator::SessionOutcome;
    use chrono::Utc;

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let session = RetrySession {
            id: "abc".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_ms: 12,
            max_retries: 0,
            feedback_mode: FeedbackMode::Cumulative,
            attempts: Vec::new(),
            outcome: SessionOutcome::FatalError,
            fatal_error: Some("generation failed: boom".to_string()),
        };

        let path = write_session(&session, &dir.path().join("reports")).unwrap();
        assert!(path.ends_with("session-abc.json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"outcome\": \"fatal_error\""));

        let back = read_session(&path).unwrap();
        assert_eq!(back.outcome, SessionOutcome::FatalError);
        assert_eq!(back.fatal_error.as_deref(), Some("generation failed: boom"));
    }
}
