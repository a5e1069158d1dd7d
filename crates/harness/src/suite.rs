//! Declarative scenario suites
//!
//! A suite is parsed once at session start and never mutated afterwards. The
//! executor only ever borrows it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::error::{HarnessError, HarnessResult};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// A complete scenario suite parsed from YAML or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSuite {
    /// Display name of the suite
    #[serde(default)]
    pub test_suite: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Base URL every endpoint is resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Scenarios in declaration order
    pub scenarios: Vec<Scenario>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// A named workflow of dependent steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<Step>,
}

/// A single request/response check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Endpoint template, may reference earlier captures
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default = "default_status")]
    pub expected_status: u16,

    /// Partial shape the response body must contain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<Value>,

    /// Keys (object) or substrings (text) that must be present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_contains: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response_type: Option<ResponseKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_min_items: Option<usize>,

    /// Match declared array elements in any order
    #[serde(default, skip_serializing_if = "is_false")]
    pub unordered: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture: Option<Capture>,

    /// Legacy capture form: stores the response `id` under this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_response_field: Option<String>,
}

fn default_status() -> u16 {
    200
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Where to store a response field for later steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// Name later steps reference
    #[serde(rename = "as")]
    pub name: String,

    /// Field path inside the response body, e.g. `data.items[0].id`
    #[serde(default = "default_capture_field")]
    pub from: String,
}

fn default_capture_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        };
        f.write_str(s)
    }
}

/// Top-level JSON type a response is expected to have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Array,
    Object,
    String,
    Number,
    Boolean,
}

impl ResponseKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ResponseKind::Array => value.is_array(),
            ResponseKind::Object => value.is_object(),
            ResponseKind::String => value.is_string(),
            ResponseKind::Number => value.is_number(),
            ResponseKind::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseKind::Array => "array",
            ResponseKind::Object => "object",
            ResponseKind::String => "string",
            ResponseKind::Number => "number",
            ResponseKind::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

impl Step {
    /// All capture directives of this step, legacy form included
    pub fn captures(&self) -> Vec<Capture> {
        let mut captures = Vec::new();
        if let Some(capture) = &self.capture {
            captures.push(capture.clone());
        }
        if let Some(name) = &self.save_response_field {
            captures.push(Capture {
                name: name.clone(),
                from: default_capture_field(),
            });
        }
        captures
    }

    /// Whether the step declares any body expectation beyond the status code
    pub fn has_body_expectations(&self) -> bool {
        self.expected_response.is_some()
            || self.expected_response_contains.is_some()
            || self.expected_response_type.is_some()
            || self.expected_items.is_some()
            || self.expected_min_items.is_some()
    }
}

impl ScenarioSuite {
    /// Parse a suite from a YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        let suite: Self = serde_yaml::from_str(yaml)
            .map_err(|e| HarnessError::SuiteParse(e.to_string()))?;
        suite.validated()
    }

    /// Parse a suite from a JSON string
    pub fn from_json(json: &str) -> HarnessResult<Self> {
        let suite: Self = serde_json::from_str(json)
            .map_err(|e| HarnessError::SuiteParse(e.to_string()))?;
        suite.validated()
    }

    /// Load a suite file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Total number of declared steps across all scenarios
    pub fn total_steps(&self) -> usize {
        self.scenarios.iter().map(|s| s.steps.len()).sum()
    }

    fn validated(mut self) -> HarnessResult<Self> {
        self.test_suite = self.test_suite.trim().to_string();
        self.base_url = normalize_base_url(&self.base_url)?;

        if self.scenarios.is_empty() {
            return Err(HarnessError::InvalidSuite(
                "suite must have at least one scenario".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for scenario in &mut self.scenarios {
            scenario.name = scenario.name.trim().to_string();
            if scenario.name.is_empty() {
                return Err(HarnessError::InvalidSuite(
                    "scenario name cannot be empty".to_string(),
                ));
            }
            if !seen.insert(scenario.name.clone()) {
                return Err(HarnessError::InvalidSuite(format!(
                    "duplicate scenario name '{}'",
                    scenario.name
                )));
            }
            if scenario.steps.is_empty() {
                return Err(HarnessError::InvalidSuite(format!(
                    "scenario '{}' must have at least one step",
                    scenario.name
                )));
            }
            for step in &scenario.steps {
                if !step.endpoint.starts_with('/') {
                    return Err(HarnessError::InvalidSuite(format!(
                        "step '{}' in '{}': endpoint must start with /",
                        step.name, scenario.name
                    )));
                }
                if !(100..=599).contains(&step.expected_status) {
                    return Err(HarnessError::InvalidSuite(format!(
                        "step '{}' in '{}': status code must be between 100 and 599",
                        step.name, scenario.name
                    )));
                }
            }
        }

        Ok(self)
    }
}

/// Check the scheme and strip trailing slashes
pub fn normalize_base_url(url: &str) -> HarnessResult<String> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(HarnessError::InvalidConfig(format!(
            "base URL must start with http:// or https://, got '{}'",
            url
        )));
    }
    Ok(url.trim_end_matches('/').to_string())
}
