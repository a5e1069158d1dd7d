//! Failure classification
//!
//! Raw failure signals are matched against an ordered rule table. Each rule
//! names the signal it applies to, an optional pattern over the evidence text,
//! the category to emit and a fixed list of suggestions. The first matching
//! rule wins; every signal ends with a pattern-less default rule.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matcher::FieldMismatch;
use crate::request::TransportErrorKind;
use crate::runner::{Phase, StepFailure, StepResult, TestRunResult};
use crate::service::StartFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    BuildError,
    CompileError,
    RuntimeError,
    TestFailure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::BuildError => "BUILD_ERROR",
            ErrorCategory::CompileError => "COMPILE_ERROR",
            ErrorCategory::RuntimeError => "RUNTIME_ERROR",
            ErrorCategory::TestFailure => "TEST_FAILURE",
        };
        f.write_str(s)
    }
}

/// Raw material a diagnosis was derived from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    CommandOutput {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },
    HealthTimeout {
        waited_secs: f64,
        last_lines: String,
        last_probe: Option<String>,
    },
    HttpExchange {
        method: String,
        endpoint: String,
        expected_status: u16,
        actual_status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<FieldMismatch>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Text {
        text: String,
    },
}

impl Evidence {
    /// Plain-text rendering used in feedback
    pub fn excerpt(&self) -> String {
        match self {
            Evidence::CommandOutput { command, exit_code, output } => {
                let code = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into());
                format!("$ {} (exit {})\n{}", command, code, output)
            }
            Evidence::HealthTimeout { last_lines, last_probe, .. } => {
                let probe = last_probe.as_deref().unwrap_or("no response");
                format!("last probe: {}\n{}", probe, last_lines)
            }
            Evidence::HttpExchange {
                method,
                endpoint,
                expected_status,
                actual_status,
                field,
                body,
                error,
            } => {
                let mut text = format!("{} {} expected status {}", method, endpoint, expected_status);
                match actual_status {
                    Some(status) => text.push_str(&format!(", got {}", status)),
                    None => text.push_str(", no response"),
                }
                if let Some(field) = field {
                    text.push_str(&format!("\nfirst mismatch: {}", field));
                }
                if let Some(error) = error {
                    text.push_str(&format!("\nerror: {}", error));
                }
                if let Some(body) = body {
                    text.push_str(&format!("\nbody: {}", body));
                }
                text
            }
            Evidence::Text { text } => text.clone(),
        }
    }
}

/// One categorized diagnosis; never mutated after creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub phase: Phase,
    /// What failed, e.g. `scenario 'crud' step 2 'create item'`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Sub-signature of the rule that matched
    pub rule: String,
    pub summary: String,
    pub evidence: Evidence,
    pub suggestions: Vec<String>,
}

/// A failure handed to the analyzer
#[derive(Debug, Clone, Copy)]
pub enum Failure<'a> {
    Start(&'a StartFailure),
    Step {
        scenario: &'a str,
        step: &'a StepResult,
    },
    Other(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    CommandFailed,
    CommandTimedOut,
    HealthTimeout,
    Transport,
    StatusMismatch,
    BodyMismatch,
    Resolution,
    Unrecognized,
}

struct RuleSpec {
    signal: Signal,
    pattern: Option<&'static str>,
    category: ErrorCategory,
    label: &'static str,
    suggestions: &'static [&'static str],
}

struct Rule {
    spec: &'static RuleSpec,
    pattern: Option<Regex>,
}

impl Rule {
    fn compile(spec: &'static RuleSpec) -> Option<Self> {
        let pattern = match spec.pattern {
            Some(p) => Some(Regex::new(p).ok()?),
            None => None,
        };
        Some(Self { spec, pattern })
    }

    fn matches(&self, signal: Signal, text: &str) -> bool {
        self.spec.signal == signal
            && self.pattern.as_ref().map(|re| re.is_match(text)).unwrap_or(true)
    }
}

const PORT_IN_USE: &str = r"(?i)(address already in use|port is already allocated|EADDRINUSE|bind.*failed)";

// Order matters: first match wins within a signal.
static RULE_SPECS: &[RuleSpec] = &[
    // Build/start command exited non-zero
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(r"(?i)(error\[E\d+\]|error TS\d+|SyntaxError|IndentationError|could not compile|compilation failed|cannot find symbol|undefined reference|error: expected)"),
        category: ErrorCategory::CompileError,
        label: "compile diagnostics",
        suggestions: &[
            "fix the compilation errors at the reported file and line",
            "check imports and module paths",
            "check dependency versions declared in the project manifest",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(r"(?i)(no matching distribution|could not find a version|no module named|npm err! 404|unable to resolve dependency|failed to select a version)"),
        category: ErrorCategory::BuildError,
        label: "dependency resolution",
        suggestions: &[
            "check dependency names and versions in the project manifest",
            "pin dependency versions that exist in the package registry",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(r"(?i)(pull access denied|manifest (for \S+ )?(not found|unknown)|failed to resolve source metadata|base image|copy failed|failed to compute cache key)"),
        category: ErrorCategory::BuildError,
        label: "base image or file copy",
        suggestions: &[
            "check base image and file copy paths",
            "verify the base image name and tag exist",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(r"(?i)(permission denied|EACCES|operation not permitted)"),
        category: ErrorCategory::BuildError,
        label: "permission denied",
        suggestions: &[
            "check file permissions/ownership",
            "make the start and shutdown scripts executable",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(PORT_IN_USE),
        category: ErrorCategory::BuildError,
        label: "port in use",
        suggestions: &[
            "check for port conflicts",
            "stop any service left over from a previous attempt",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: Some(r"(?i)(not found|no such file|does not exist|cannot find|ENOENT)"),
        category: ErrorCategory::BuildError,
        label: "missing file",
        suggestions: &[
            "check all referenced files exist in the build context",
            "check that required files (Dockerfile, dependency manifest, entrypoint) are generated",
        ],
    },
    RuleSpec {
        signal: Signal::CommandFailed,
        pattern: None,
        category: ErrorCategory::BuildError,
        label: "build failed",
        suggestions: &[
            "inspect the build output for the first error",
            "check the start command succeeds when run in the project root",
        ],
    },
    // Start command never returned
    RuleSpec {
        signal: Signal::CommandTimedOut,
        pattern: None,
        category: ErrorCategory::RuntimeError,
        label: "start command hung",
        suggestions: &[
            "make the start command return once the service is launched",
            "run the service in the background or detached mode",
        ],
    },
    // Health probe never succeeded
    RuleSpec {
        signal: Signal::HealthTimeout,
        pattern: Some(PORT_IN_USE),
        category: ErrorCategory::RuntimeError,
        label: "port in use",
        suggestions: &[
            "check for port conflicts",
            "make the service listen on the configured port",
        ],
    },
    RuleSpec {
        signal: Signal::HealthTimeout,
        pattern: Some(r"(?im)(traceback \(most recent call last\)|exception|panicked at|stack trace|^\s+at \S+\(|fatal error|unhandled)"),
        category: ErrorCategory::RuntimeError,
        label: "startup crash",
        suggestions: &[
            "check application startup code",
            "fix the exception shown in the startup logs",
        ],
    },
    RuleSpec {
        signal: Signal::HealthTimeout,
        pattern: Some(r"\A\s*\z"),
        category: ErrorCategory::RuntimeError,
        label: "no output",
        suggestions: &[
            "check entrypoint command",
            "make sure the service process is actually launched",
        ],
    },
    RuleSpec {
        signal: Signal::HealthTimeout,
        pattern: None,
        category: ErrorCategory::RuntimeError,
        label: "not healthy",
        suggestions: &[
            "check the service listens on the configured host and port",
            "check the health endpoint returns a 2xx status",
            "check the service starts within the startup timeout",
        ],
    },
    // Transport errors during the test phase
    RuleSpec {
        signal: Signal::Transport,
        pattern: Some(r"^timeout"),
        category: ErrorCategory::RuntimeError,
        label: "request timed out",
        suggestions: &[
            "check {method} {endpoint} does not block",
            "check slow queries or external calls in the handler",
        ],
    },
    RuleSpec {
        signal: Signal::Transport,
        pattern: None,
        category: ErrorCategory::RuntimeError,
        label: "service unreachable",
        suggestions: &[
            "check the service does not crash while handling {method} {endpoint}",
            "inspect service logs around the failing request",
        ],
    },
    // Status code mismatches, keyed on the actual status
    RuleSpec {
        signal: Signal::StatusMismatch,
        pattern: Some(r"^5\d\d$"),
        category: ErrorCategory::TestFailure,
        label: "server error",
        suggestions: &[
            "check server-side error handling for {method} {endpoint}",
            "inspect service logs for the exception raised by {endpoint}",
            "check database and storage initialization",
        ],
    },
    RuleSpec {
        signal: Signal::StatusMismatch,
        pattern: Some(r"^404$"),
        category: ErrorCategory::TestFailure,
        label: "route not found",
        suggestions: &[
            "check the route {endpoint} is registered",
            "check path parameters and ids used by {endpoint}",
        ],
    },
    RuleSpec {
        signal: Signal::StatusMismatch,
        pattern: Some(r"^405$"),
        category: ErrorCategory::TestFailure,
        label: "method not allowed",
        suggestions: &["check {endpoint} accepts the {method} method"],
    },
    RuleSpec {
        signal: Signal::StatusMismatch,
        pattern: Some(r"^4\d\d$"),
        category: ErrorCategory::TestFailure,
        label: "request rejected",
        suggestions: &[
            "check request validation for {method} {endpoint}",
            "check required headers and body fields",
        ],
    },
    RuleSpec {
        signal: Signal::StatusMismatch,
        pattern: None,
        category: ErrorCategory::TestFailure,
        label: "wrong status",
        suggestions: &["return status {expected} from {method} {endpoint}"],
    },
    // Status matched, body did not
    RuleSpec {
        signal: Signal::BodyMismatch,
        pattern: Some(r"<missing>$"),
        category: ErrorCategory::TestFailure,
        label: "missing field",
        suggestions: &[
            "include field {field} in the response of {method} {endpoint}",
            "check the response serialization of {endpoint}",
        ],
    },
    RuleSpec {
        signal: Signal::BodyMismatch,
        pattern: None,
        category: ErrorCategory::TestFailure,
        label: "wrong body",
        suggestions: &[
            "check the value of {field} returned by {method} {endpoint}",
            "check the response shape of {endpoint}",
        ],
    },
    RuleSpec {
        signal: Signal::Resolution,
        pattern: None,
        category: ErrorCategory::TestFailure,
        label: "unresolved capture",
        suggestions: &[
            "make the earlier step that stores '{placeholder}' return that field",
            "check capture names match the placeholders used later",
        ],
    },
    RuleSpec {
        signal: Signal::Unrecognized,
        pattern: None,
        category: ErrorCategory::RuntimeError,
        label: "unrecognized",
        suggestions: &["inspect logs"],
    },
];

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| RULE_SPECS.iter().filter_map(Rule::compile).collect());

/// Values substituted into suggestion templates
#[derive(Default)]
struct Context {
    method: String,
    endpoint: String,
    expected: String,
    field: String,
    placeholder: String,
}

impl Context {
    fn fill(&self, template: &str) -> String {
        template
            .replace("{method}", &self.method)
            .replace("{endpoint}", &self.endpoint)
            .replace("{expected}", &self.expected)
            .replace("{field}", &self.field)
            .replace("{placeholder}", &self.placeholder)
    }
}

fn classify(signal: Signal, text: &str) -> &'static RuleSpec {
    RULES
        .iter()
        .find(|rule| rule.matches(signal, text))
        .map(|rule| rule.spec)
        .unwrap_or(&RULE_SPECS[RULE_SPECS.len() - 1])
}

/// Turn one failure into a diagnosis
pub fn analyze(phase: Phase, failure: Failure<'_>) -> ErrorRecord {
    match failure {
        Failure::Start(start) => analyze_start(phase, start),
        Failure::Step { scenario, step } => analyze_step(phase, scenario, step),
        Failure::Other(text) => build(
            Signal::Unrecognized,
            text,
            phase,
            None,
            text.to_string(),
            Evidence::Text { text: text.to_string() },
            &Context::default(),
        ),
    }
}

/// One record per failing scenario of a test run
pub fn analyze_run(result: &TestRunResult) -> Vec<ErrorRecord> {
    result
        .failed_scenarios()
        .filter_map(|scenario| {
            scenario.failed_step().map(|step| {
                analyze(
                    result.phase,
                    Failure::Step {
                        scenario: &scenario.name,
                        step,
                    },
                )
            })
        })
        .collect()
}

fn analyze_start(phase: Phase, failure: &StartFailure) -> ErrorRecord {
    let summary = failure.to_string();
    match failure {
        StartFailure::CommandFailed { command, exit_code, output } => build(
            Signal::CommandFailed,
            output,
            phase,
            None,
            summary,
            Evidence::CommandOutput {
                command: command.clone(),
                exit_code: *exit_code,
                output: output.clone(),
            },
            &Context::default(),
        ),
        StartFailure::CommandTimedOut { command, output, .. } => build(
            Signal::CommandTimedOut,
            output,
            phase,
            None,
            summary,
            Evidence::CommandOutput {
                command: command.clone(),
                exit_code: None,
                output: output.clone(),
            },
            &Context::default(),
        ),
        StartFailure::HealthTimeout {
            waited_secs,
            last_lines,
            last_probe,
        } => build(
            Signal::HealthTimeout,
            last_lines,
            phase,
            None,
            summary,
            Evidence::HealthTimeout {
                waited_secs: *waited_secs,
                last_lines: last_lines.clone(),
                last_probe: last_probe.clone(),
            },
            &Context::default(),
        ),
        StartFailure::Cancelled => analyze(phase, Failure::Other(&summary)),
    }
}

fn analyze_step(phase: Phase, scenario: &str, step: &StepResult) -> ErrorRecord {
    let subject = format!(
        "scenario '{}' step {} '{}'",
        scenario,
        step.step_index + 1,
        step.step_name
    );
    let mut ctx = Context {
        method: step.method.to_string(),
        endpoint: step.endpoint.clone(),
        expected: step.expected_status.to_string(),
        ..Default::default()
    };
    let mut evidence = Evidence::HttpExchange {
        method: step.method.to_string(),
        endpoint: step.endpoint.clone(),
        expected_status: step.expected_status,
        actual_status: step.status,
        field: None,
        body: step.body.as_ref().map(crate::matcher::render),
        error: None,
    };

    let Some(failure) = &step.failure else {
        let text = format!("{} failed without a recorded reason", subject);
        return build(Signal::Unrecognized, &text, phase, Some(subject), text.clone(), evidence, &ctx);
    };

    match failure {
        StepFailure::Transport { error, message } => {
            if let Evidence::HttpExchange { error: slot, .. } = &mut evidence {
                *slot = Some(format!("{}: {}", error, message));
            }
            let text = match error {
                TransportErrorKind::Timeout => "timeout",
                TransportErrorKind::ConnectionRefused => "refused",
                TransportErrorKind::ConnectionReset => "reset",
                TransportErrorKind::Other => "other",
            };
            let summary = format!(
                "service became unreachable during test execution ({} {}: {})",
                step.method, step.endpoint, error
            );
            build(Signal::Transport, text, phase, Some(subject), summary, evidence, &ctx)
        }
        StepFailure::Resolution { placeholder } => {
            ctx.placeholder = placeholder.clone();
            let summary = format!(
                "{} {} references '{}' which no earlier step captured",
                step.method, step.endpoint, placeholder
            );
            build(Signal::Resolution, placeholder, phase, Some(subject), summary, evidence, &ctx)
        }
        StepFailure::Mismatch {
            expected_status,
            actual_status,
            field,
        } => {
            if let Evidence::HttpExchange { field: slot, .. } = &mut evidence {
                *slot = field.clone();
            }
            let mut summary = format!("{} {}: {}", step.method, step.endpoint, failure);
            if expected_status == actual_status && field.is_none() {
                summary.push_str("; body mismatch");
            }
            if expected_status != actual_status {
                build(
                    Signal::StatusMismatch,
                    &actual_status.to_string(),
                    phase,
                    Some(subject),
                    summary,
                    evidence,
                    &ctx,
                )
            } else {
                let field = field.clone().unwrap_or(FieldMismatch {
                    path: String::new(),
                    expected: String::new(),
                    actual: String::new(),
                });
                ctx.field = if field.path.is_empty() { "body".to_string() } else { field.path.clone() };
                build(
                    Signal::BodyMismatch,
                    &field.actual,
                    phase,
                    Some(subject),
                    summary,
                    evidence,
                    &ctx,
                )
            }
        }
    }
}

fn build(
    signal: Signal,
    text: &str,
    phase: Phase,
    subject: Option<String>,
    summary: String,
    evidence: Evidence,
    ctx: &Context,
) -> ErrorRecord {
    let rule = classify(signal, text);
    ErrorRecord {
        category: rule.category,
        phase,
        subject,
        rule: rule.label.to_string(),
        summary,
        evidence,
        suggestions: rule.suggestions.iter().map(|s| ctx.fill(s)).collect(),
    }
}
