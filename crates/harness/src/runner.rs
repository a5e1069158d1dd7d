//! Test executor: runs every scenario of a suite against a healthy service

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::matcher::{self, FieldMismatch};
use crate::request::{Exchange, RequestExecutor, TransportErrorKind};
use crate::suite::{HttpMethod, Scenario, ScenarioSuite, Step};
use crate::template::{self, Captures};

/// How far an attempt got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Generate,
    Build,
    Start,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Generate => "generate",
            Phase::Build => "build",
            Phase::Start => "start",
            Phase::Test => "test",
        };
        f.write_str(s)
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepFailure {
    /// No HTTP response at all
    Transport {
        error: TransportErrorKind,
        message: String,
    },
    /// The step referenced a capture no earlier step stored
    Resolution { placeholder: String },
    /// Status code or body did not meet the expectation
    Mismatch {
        expected_status: u16,
        actual_status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<FieldMismatch>,
    },
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Transport { error, message } => write!(f, "{}: {}", error, message),
            StepFailure::Resolution { placeholder } => {
                write!(f, "unresolved placeholder '{}'", placeholder)
            }
            StepFailure::Mismatch {
                expected_status,
                actual_status,
                field,
            } => {
                if expected_status == actual_status {
                    match field {
                        Some(field) => write!(f, "status {} ok; {}", actual_status, field),
                        None => write!(f, "status {} ok", actual_status),
                    }
                } else {
                    write!(f, "expected {} got {}", expected_status, actual_status)?;
                    if let Some(field) = field {
                        write!(f, "; {}", field)?;
                    }
                    Ok(())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub step_index: usize,
    pub method: HttpMethod,
    /// Endpoint after capture substitution (the template if it did not resolve)
    pub endpoint: String,
    pub status: Option<u16>,
    pub expected_status: u16,
    pub body: Option<Value>,
    pub passed: bool,
    pub failure: Option<StepFailure>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub steps: Vec<StepResult>,
    pub success: bool,
    /// Index of the step that failed; later steps were not run
    pub first_failure: Option<usize>,
    pub skipped_steps: usize,
    pub duration_ms: u64,
}

impl ScenarioResult {
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.first_failure.and_then(|i| self.steps.get(i))
    }
}

/// Result of one attempt's test phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResult {
    pub attempt: u32,
    pub phase: Phase,
    pub scenarios: Vec<ScenarioResult>,
    pub total_scenarios: usize,
    pub passed_scenarios: usize,
    pub total_steps: usize,
    pub passed_steps: usize,
    pub skipped_steps: usize,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TestRunResult {
    /// Result for an attempt that never reached the test phase
    pub fn not_reached(attempt: u32, phase: Phase, suite: &ScenarioSuite, started_at: DateTime<Utc>) -> Self {
        let total_steps = suite.total_steps();
        Self {
            attempt,
            phase,
            scenarios: Vec::new(),
            total_scenarios: suite.scenarios.len(),
            passed_scenarios: 0,
            total_steps,
            passed_steps: 0,
            skipped_steps: total_steps,
            success: false,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn failed_scenarios(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.scenarios.iter().filter(|s| !s.success)
    }

    fn aggregate(attempt: u32, scenarios: Vec<ScenarioResult>, started_at: DateTime<Utc>) -> Self {
        let total_steps: usize = scenarios.iter().map(|s| s.steps.len() + s.skipped_steps).sum();
        let passed_steps = scenarios
            .iter()
            .flat_map(|s| s.steps.iter())
            .filter(|s| s.passed)
            .count();
        let skipped_steps = scenarios.iter().map(|s| s.skipped_steps).sum();
        let passed_scenarios = scenarios.iter().filter(|s| s.success).count();

        Self {
            attempt,
            phase: Phase::Test,
            total_scenarios: scenarios.len(),
            passed_scenarios,
            total_steps,
            passed_steps,
            skipped_steps,
            success: scenarios.iter().all(|s| s.success),
            scenarios,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Executes a suite against a service that is already healthy
#[derive(Debug, Clone)]
pub struct TestExecutor {
    requests: RequestExecutor,
    concurrency: usize,
}

impl TestExecutor {
    pub fn new(requests: RequestExecutor) -> Self {
        Self {
            requests,
            concurrency: 1,
        }
    }

    /// Run up to `n` scenarios at once; steps inside a scenario stay ordered
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub async fn run(&self, suite: &ScenarioSuite, base_url: &str, attempt: u32) -> TestRunResult {
        let started_at = Utc::now();
        let base_url = base_url.trim_end_matches('/');
        info!(
            "Running {} scenarios ({} steps) against {}",
            suite.scenarios.len(),
            suite.total_steps(),
            base_url
        );

        let scenarios = if self.concurrency > 1 {
            stream::iter(&suite.scenarios)
                .map(|scenario| self.run_scenario(scenario, base_url))
                .buffered(self.concurrency)
                .collect::<Vec<_>>()
                .await
        } else {
            let mut results = Vec::with_capacity(suite.scenarios.len());
            for scenario in &suite.scenarios {
                results.push(self.run_scenario(scenario, base_url).await);
            }
            results
        };

        let result = TestRunResult::aggregate(attempt, scenarios, started_at);
        info!(
            "Scenarios: {}/{} passed, steps: {}/{} passed",
            result.passed_scenarios, result.total_scenarios, result.passed_steps, result.total_steps
        );
        result
    }

    pub async fn run_scenario(&self, scenario: &Scenario, base_url: &str) -> ScenarioResult {
        let start = Instant::now();
        let mut captures = Captures::new();
        let mut steps = Vec::with_capacity(scenario.steps.len());
        let mut first_failure = None;

        debug!("Scenario: {}", scenario.name);

        for (index, step) in scenario.steps.iter().enumerate() {
            let result = self.run_step(step, index, base_url, &mut captures).await;
            let passed = result.passed;
            if !passed {
                warn!(
                    "Scenario '{}' failed at step {} '{}': {}",
                    scenario.name,
                    index + 1,
                    step.name,
                    result.failure.as_ref().map(|f| f.to_string()).unwrap_or_default()
                );
            }
            steps.push(result);
            if !passed {
                first_failure = Some(index);
                break;
            }
        }

        ScenarioResult {
            name: scenario.name.clone(),
            skipped_steps: scenario.steps.len() - steps.len(),
            success: first_failure.is_none(),
            steps,
            first_failure,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        index: usize,
        base_url: &str,
        captures: &mut Captures,
    ) -> StepResult {
        let mut result = StepResult {
            step_name: step.name.clone(),
            step_index: index,
            method: step.method,
            endpoint: step.endpoint.clone(),
            status: None,
            expected_status: step.expected_status,
            body: None,
            passed: false,
            failure: None,
            latency_ms: 0,
        };

        let request = match resolve_request(step, captures) {
            Ok(request) => request,
            Err(unresolved) => {
                result.failure = Some(StepFailure::Resolution {
                    placeholder: unresolved.name,
                });
                return result;
            }
        };
        result.endpoint = request.endpoint.clone();

        let url = format!("{}{}", base_url, request.endpoint);
        let exchange = self
            .requests
            .send(step.method, &url, &request.headers, request.body.as_ref())
            .await;
        result.latency_ms = exchange.latency_ms;

        let Exchange {
            status,
            body,
            transport_error,
            ..
        } = exchange;

        if let Some(error) = transport_error {
            result.failure = Some(StepFailure::Transport {
                error: error.kind,
                message: error.message,
            });
            return result;
        }
        let Some(status) = status else {
            result.failure = Some(StepFailure::Transport {
                error: TransportErrorKind::Other,
                message: "no response".to_string(),
            });
            return result;
        };

        let body = body.unwrap_or(Value::Null);
        result.status = Some(status);

        let field = check_body(step, request.expected.as_ref(), &body).err();
        if status != step.expected_status || field.is_some() {
            result.failure = Some(StepFailure::Mismatch {
                expected_status: step.expected_status,
                actual_status: status,
                field,
            });
        } else {
            result.passed = true;
            store_captures(step, &body, captures);
        }

        debug!(
            "{} {} -> {} ({} ms)",
            step.method, result.endpoint, status, result.latency_ms
        );
        result.body = Some(body);
        result
    }
}

struct ResolvedRequest {
    endpoint: String,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    /// Expected response shape with captures substituted
    expected: Option<Value>,
}

fn resolve_request(step: &Step, captures: &Captures) -> Result<ResolvedRequest, template::Unresolved> {
    let endpoint = template::render_str(&step.endpoint, captures)?;
    let mut headers = BTreeMap::new();
    for (name, value) in &step.headers {
        headers.insert(name.clone(), template::render_str(value, captures)?);
    }
    let body = step
        .body
        .as_ref()
        .map(|body| template::render_value(body, captures))
        .transpose()?;
    let expected = step
        .expected_response
        .as_ref()
        .map(|expected| template::render_value(expected, captures))
        .transpose()?;

    Ok(ResolvedRequest {
        endpoint,
        headers,
        body,
        expected,
    })
}

/// Evaluate every declared body check; the first failing one is reported
fn check_body(step: &Step, expected: Option<&Value>, body: &Value) -> Result<(), FieldMismatch> {
    if !step.has_body_expectations() {
        return Ok(());
    }
    if let Some(kind) = step.expected_response_type {
        matcher::check_kind(kind, body)?;
    }
    if let Some(expected) = expected {
        matcher::partial_match(expected, body, step.unordered)?;
    }
    if let Some(keys) = &step.expected_response_contains {
        matcher::check_contains(keys, body)?;
    }
    if step.expected_items.is_some() || step.expected_min_items.is_some() {
        matcher::check_items(step.expected_items, step.expected_min_items, body)?;
    }
    Ok(())
}

fn store_captures(step: &Step, body: &Value, captures: &mut Captures) {
    for capture in step.captures() {
        match matcher::lookup(body, &capture.from) {
            Some(value) => {
                debug!("Captured {} = {}", capture.name, value);
                captures.insert(capture.name, value.clone());
            }
            None => warn!(
                "Step '{}' passed but field '{}' is missing; '{}' not captured",
                step.name, capture.from, capture.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(yaml: &str) -> Step {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_check_body_reports_first_failing_check() {
        let s = step("{ name: list, endpoint: /items, expected_response_type: array, expected_min_items: 2 }");
        assert!(check_body(&s, None, &json!([1, 2])).is_ok());
        assert_eq!(check_body(&s, None, &json!({})).unwrap_err().expected, "array");
        assert_eq!(check_body(&s, None, &json!([1])).unwrap_err().expected, "at least 2 items");
    }

    #[test]
    fn test_resolve_request_substitutes_everywhere() {
        let s = step(
            r#"{ name: upd, method: PUT, endpoint: "/items/{{id}}", headers: { X-Item: "{saved_id}" }, body: { id: "{{id}}" } }"#,
        );
        let mut captures = Captures::new();
        captures.insert("id".into(), json!(5));

        let resolved = resolve_request(&s, &captures).unwrap();
        assert_eq!(resolved.endpoint, "/items/5");
        assert_eq!(resolved.headers["X-Item"], "5");
        assert_eq!(resolved.body, Some(json!({"id": 5})));

        let err = resolve_request(&s, &Captures::new()).err().unwrap();
        assert_eq!(err.name, "id");
    }

    #[test]
    fn test_store_captures_skips_missing_fields() {
        let s = step("{ name: c, endpoint: /items, save_response_field: item, capture: { as: owner, from: owner.id } }");
        let mut captures = Captures::new();
        store_captures(&s, &json!({"id": 3}), &mut captures);
        assert_eq!(captures.get("item"), Some(&json!(3)));
        assert!(!captures.contains_key("owner"));
    }

    #[test]
    fn test_mismatch_display() {
        let failure = StepFailure::Mismatch {
            expected_status: 201,
            actual_status: 500,
            field: None,
        };
        assert_eq!(failure.to_string(), "expected 201 got 500");
    }

    #[test]
    fn test_not_reached_is_never_success() {
        let suite = ScenarioSuite::from_yaml(
            "scenarios: [{ name: a, steps: [{ name: s, endpoint: /health }] }]",
        )
        .unwrap();
        let result = TestRunResult::not_reached(1, Phase::Build, &suite, Utc::now());
        assert!(!result.success);
        assert_eq!(result.skipped_steps, 1);
        assert_eq!(result.total_scenarios, 1);
    }
}
