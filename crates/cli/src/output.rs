//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use regen_harness::{Attempt, ErrorRecord, RetrySession, SessionOutcome, TestRunResult};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a serializable document in a machine format
pub fn print_document<T: Serialize + ?Sized>(value: &T, format: OutputFormat) {
    match format {
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(value).unwrap_or_default());
        }
        _ => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            let mut table = new_table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        other => print_document(items, other),
    }
}

fn pass_fail(ok: bool) -> String {
    if ok {
        "✓ pass".green().to_string()
    } else {
        "✗ fail".red().to_string()
    }
}

impl TableDisplay for Attempt {
    fn headers() -> Vec<&'static str> {
        vec!["Attempt", "Phase", "Scenarios", "Steps", "Errors", "Teardown", "Result"]
    }

    fn row(&self) -> Vec<String> {
        let (scenarios, steps) = match &self.result {
            Some(r) => (
                format!("{}/{}", r.passed_scenarios, r.total_scenarios),
                format!("{}/{}", r.passed_steps, r.total_steps),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        let teardown = self
            .teardown
            .as_ref()
            .map(|t| t.state.to_string())
            .unwrap_or_else(|| "-".to_string());
        vec![
            self.number.to_string(),
            self.phase_reached.to_string(),
            scenarios,
            steps,
            self.errors.len().to_string(),
            teardown,
            pass_fail(self.success),
        ]
    }
}

impl TableDisplay for ErrorRecord {
    fn headers() -> Vec<&'static str> {
        vec!["Category", "Where", "Summary", "Suggestions"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.category.to_string().yellow().to_string(),
            self.subject.clone().unwrap_or_else(|| self.phase.to_string()),
            self.summary.clone(),
            self.suggestions
                .iter()
                .map(|s| format!("- {}", s))
                .collect::<Vec<_>>()
                .join("\n"),
        ]
    }
}

/// Per-scenario table of a test run
pub fn print_test_run(result: &TestRunResult) {
    let mut table = new_table();
    table.set_header(vec!["Scenario", "Steps", "Failed step", "Reason", "Result"]);
    for scenario in &result.scenarios {
        let failed = scenario.failed_step();
        table.add_row(vec![
            scenario.name.clone(),
            format!(
                "{}/{}",
                scenario.steps.iter().filter(|s| s.passed).count(),
                scenario.steps.len() + scenario.skipped_steps
            ),
            failed
                .map(|s| format!("{} {} {}", s.step_index + 1, s.method, s.endpoint))
                .unwrap_or_default(),
            failed
                .and_then(|s| s.failure.as_ref())
                .map(|f| f.to_string())
                .unwrap_or_default(),
            pass_fail(scenario.success),
        ]);
    }
    println!("{table}");
}

/// Summary of a finished session
pub fn print_session(session: &RetrySession, format: OutputFormat) {
    if !matches!(format, OutputFormat::Table) {
        print_document(session, format);
        return;
    }

    println!("Session {}", session.id.bold());
    print_list(&session.attempts, format);

    if let Some(last) = session.last_attempt() {
        if let Some(result) = last.result.as_ref().filter(|r| !r.scenarios.is_empty()) {
            print_test_run(result);
        }
        if !last.errors.is_empty() {
            print_list(&last.errors, format);
        }
    }

    let elapsed = session.elapsed_ms as f64 / 1000.0;
    match session.outcome {
        SessionOutcome::Success => print_success(&format!(
            "Success after {} attempt(s) in {:.1}s",
            session.attempts.len(),
            elapsed
        )),
        SessionOutcome::ExhaustedRetries => print_error(&format!(
            "Retries exhausted after {} attempt(s) in {:.1}s",
            session.attempts.len(),
            elapsed
        )),
        SessionOutcome::FatalError => print_error(&format!(
            "Fatal error: {}",
            session.fatal_error.as_deref().unwrap_or("unknown")
        )),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "i".blue(), message);
}
