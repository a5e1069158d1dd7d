//! Feedback text for the next generation call

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::analyzer::ErrorRecord;

/// Evidence excerpts longer than this are cut
pub const EVIDENCE_LIMIT: usize = 500;

/// Which failed attempts feed the next generation call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    /// Only the immediately preceding attempt
    #[default]
    LastAttempt,
    /// Every prior attempt, oldest first
    Cumulative,
}

impl std::str::FromStr for FeedbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_attempt" | "last" => Ok(FeedbackMode::LastAttempt),
            "cumulative" => Ok(FeedbackMode::Cumulative),
            other => Err(format!("unknown feedback mode '{}'", other)),
        }
    }
}

/// Compose feedback from the errors of prior attempts, given oldest first.
/// Returns `None` when there is nothing to report.
pub fn compose_feedback<'a, I>(mode: FeedbackMode, history: I) -> Option<String>
where
    I: IntoIterator<Item = (u32, &'a [ErrorRecord])>,
{
    let mut history: Vec<(u32, &[ErrorRecord])> = history
        .into_iter()
        .filter(|(_, errors)| !errors.is_empty())
        .collect();

    if mode == FeedbackMode::LastAttempt && history.len() > 1 {
        history.drain(..history.len() - 1);
    }
    let (last_attempt, _) = *history.last()?;

    let mut text = format!(
        "Attempt {} failed. The generated service has the following problems:\n\n",
        last_attempt
    );
    let with_headers = history.len() > 1;
    let mut index = 0;
    for (attempt, errors) in &history {
        if with_headers {
            let _ = writeln!(text, "=== Attempt {} ===\n", attempt);
        }
        for record in errors.iter() {
            index += 1;
            write_record(&mut text, index, record);
        }
    }
    text.push_str("Fix these problems and regenerate the project.\n");
    Some(text)
}

fn write_record(text: &mut String, index: usize, record: &ErrorRecord) {
    let _ = writeln!(text, "ERROR {}: {}", index, record.category);
    if let Some(subject) = &record.subject {
        let _ = writeln!(text, "Where: {}", subject);
    }
    let _ = writeln!(text, "Summary: {}", record.summary);
    let excerpt = record.evidence.excerpt();
    let excerpt = excerpt.trim();
    if !excerpt.is_empty() {
        let _ = writeln!(text, "Evidence: {}", truncate(excerpt, EVIDENCE_LIMIT));
    }
    if !record.suggestions.is_empty() {
        text.push_str("Suggestions:\n");
        for suggestion in &record.suggestions {
            let _ = writeln!(text, "  - {}", suggestion);
        }
    }
    text.push('\n');
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{}...", cut)
}
