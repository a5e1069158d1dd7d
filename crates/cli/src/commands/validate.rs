//! `regen validate`: parse a suite and check capture references

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

use regen_harness::template::referenced_names;
use regen_harness::{Scenario, ScenarioSuite};

use crate::output::{print_document, print_list, print_success, print_warning, OutputFormat, TableDisplay};

#[derive(Args)]
pub struct ValidateArgs {
    /// Scenario suite (YAML or JSON)
    #[arg(long)]
    suite: PathBuf,
}

#[derive(Serialize)]
struct ScenarioSummary {
    name: String,
    steps: usize,
    captures: Vec<String>,
    description: String,
}

impl TableDisplay for ScenarioSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Scenario", "Steps", "Captures", "Description"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.steps.to_string(),
            self.captures.join(", "),
            self.description.clone(),
        ]
    }
}

#[derive(Serialize)]
struct ValidationReport {
    test_suite: String,
    base_url: String,
    total_steps: usize,
    scenarios: Vec<ScenarioSummary>,
    problems: Vec<String>,
}

/// Returns the process exit code
pub async fn execute(args: ValidateArgs, format: OutputFormat) -> Result<i32> {
    let suite = super::load_suite(&args.suite)?;
    let problems = unresolved_references(&suite);

    let report = ValidationReport {
        test_suite: suite.test_suite.clone(),
        base_url: suite.base_url.clone(),
        total_steps: suite.total_steps(),
        scenarios: suite.scenarios.iter().map(summarize).collect(),
        problems,
    };

    if matches!(format, OutputFormat::Table) {
        print_list(&report.scenarios, format);
        for problem in &report.problems {
            print_warning(problem);
        }
        if report.problems.is_empty() {
            print_success(&format!(
                "{} scenarios, {} steps",
                report.scenarios.len(),
                report.total_steps
            ));
        }
    } else {
        print_document(&report, format);
    }

    Ok(if report.problems.is_empty() { 0 } else { 1 })
}

fn summarize(scenario: &Scenario) -> ScenarioSummary {
    ScenarioSummary {
        name: scenario.name.clone(),
        steps: scenario.steps.len(),
        captures: scenario
            .steps
            .iter()
            .flat_map(|s| s.captures())
            .map(|c| c.name)
            .collect(),
        description: scenario.description.clone(),
    }
}

/// Placeholders used before any earlier step of the same scenario captures them
fn unresolved_references(suite: &ScenarioSuite) -> Vec<String> {
    let mut problems = Vec::new();
    for scenario in &suite.scenarios {
        let mut known = HashSet::new();
        for (index, step) in scenario.steps.iter().enumerate() {
            let mut used = referenced_names(&step.endpoint);
            for value in step.headers.values() {
                used.extend(referenced_names(value));
            }
            for value in [&step.body, &step.expected_response].into_iter().flatten() {
                used.extend(referenced_names(&value.to_string()));
            }
            for name in used {
                if !known.contains(&name) {
                    problems.push(format!(
                        "scenario '{}' step {} '{}' uses '{}' before it is captured",
                        scenario.name,
                        index + 1,
                        step.name,
                        name
                    ));
                }
            }
            known.extend(step.captures().into_iter().map(|c| c.name));
        }
    }
    problems
}
