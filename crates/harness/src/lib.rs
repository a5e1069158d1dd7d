//! Regen harness
//!
//! Judges a generated HTTP service against a declarative scenario suite and
//! turns failures into feedback for the next generation attempt:
//! - Builds and starts the candidate through external commands, then polls its
//!   health endpoint
//! - Runs every scenario, partially matching response bodies
//! - Classifies failures through an ordered rule table
//! - Retries generation with the composed feedback, up to a fixed budget
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  RetryOrchestrator                                        │
//! │    ├── Generator::generate(spec, feedback) -> Snapshot    │
//! │    └── Evaluator                                          │
//! │          ├── ServiceHandle::start / stop                  │
//! │          ├── TestExecutor::run(suite) -> TestRunResult    │
//! │          └── analyzer::analyze -> ErrorRecord             │
//! ├──────────────────────────────────────────────────────────┤
//! │  ScenarioSuite (YAML / JSON)                              │
//! │    └── scenarios: [{ name, steps: [Step] }]               │
//! │          └── method, endpoint, body, expected_status,     │
//! │              expected_response, capture                   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod analyzer;
pub mod error;
pub mod feedback;
pub mod generator;
pub mod matcher;
pub mod orchestrator;
pub mod report;
pub mod request;
pub mod runner;
pub mod service;
pub mod suite;
pub mod template;

pub use analyzer::{ErrorCategory, ErrorRecord, Evidence};
pub use error::{HarnessError, HarnessResult};
pub use feedback::FeedbackMode;
pub use generator::{CommandGenerator, GenerationError, GenerationRequest, Generator, ProjectSnapshot};
pub use orchestrator::{Attempt, AttemptEnd, Evaluator, RetryConfig, RetryOrchestrator, RetrySession, SessionOutcome};
pub use request::RequestExecutor;
pub use runner::{Phase, ScenarioResult, StepResult, TestExecutor, TestRunResult};
pub use service::{ServiceConfig, ServiceLifecycle, ServiceState, StartFailure};
pub use suite::{Scenario, ScenarioSuite, Step};
