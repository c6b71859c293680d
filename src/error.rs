//! Error kinds surfaced by the engine (spec §7).
//!
//! The evaluator and compute helpers are total — they return `null`/`false`
//! rather than raising. Only the orchestrator and the persistence boundary
//! produce `EngineError`.

use std::fmt;

/// One failing field, as collected by the answer validator (C4).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldIssue {
    pub key: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Structural violation in a request payload.
    InvalidPayload(String),
    /// Answers failed field schema validation.
    ValidationFailed(Vec<FieldIssue>),
    /// Submit referenced a template not in the study.
    TemplateNotFound,
    /// Result requested for a participant with no submissions.
    NotFound,
    /// Compute dependency cycle, naming one offending key.
    ComputeCycle(String),
    /// Recursion limit hit while evaluating an expression or compute tree.
    DepthExceeded,
    /// Backing store not configured or unreachable.
    StoreUnavailable(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            EngineError::ValidationFailed(issues) => {
                write!(f, "validation failed ({} issue(s))", issues.len())
            }
            EngineError::TemplateNotFound => write!(f, "form template not found"),
            EngineError::NotFound => write!(f, "no submission found"),
            EngineError::ComputeCycle(key) => write!(f, "compute dependency cycle at `{key}`"),
            EngineError::DepthExceeded => write!(f, "recursion limit exceeded"),
            EngineError::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Maps an `EngineError` to the HTTP status spec §7 assigns it.
impl EngineError {
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidPayload(_) => 400,
            EngineError::ValidationFailed(_) => 400,
            EngineError::ComputeCycle(_) => 400,
            EngineError::DepthExceeded => 400,
            EngineError::TemplateNotFound => 404,
            EngineError::NotFound => 404,
            EngineError::StoreUnavailable(_) => 503,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
