//! Error types for the harness
//!
//! Classified failures (build, start, test) are values, not errors. This enum
//! only covers conditions that abort the call that hit them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Suite parse error: {0}")]
    SuiteParse(String),

    #[error("Invalid suite: {0}")]
    InvalidSuite(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;
