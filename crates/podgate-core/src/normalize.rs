//! Error taxonomy and the mapping from raw failures onto it.
//!
//! Every failure a caller can see is an [`ApiError`] of one of five kinds.
//! Typed engine errors are classified directly. Opaque engine failures only
//! carry the engine's own text, so those fall back to marker matching on the
//! lowercased message; this depends on engine wording and is the weakest part
//! of the classification.
//!
//! Messages returned to callers are short summaries. The raw detail goes to
//! the log together with the operation, target, and elapsed time.

use crate::{BridgeError, OperationError};
use podgate_engine::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Fault text markers that mean "the named resource does not exist".
pub const NOT_FOUND_MARKERS: &[&str] = &["not found", "no such"];

/// Fault text markers that mean the engine itself could not be reached.
pub const UNAVAILABLE_MARKERS: &[&str] = &[
    "cannot connect",
    "connection refused",
    "unable to connect",
];

/// Fault text markers that mean the container is in the wrong state for the
/// operation. Only in-container operations read this as "not running"; for
/// lifecycle calls the same wording can mean the container is running.
pub const NOT_RUNNING_MARKERS: &[&str] = &["state improper", "is not running"];

/// Operations that run inside a container and so require it to be running.
pub const IN_CONTAINER_OPERATIONS: &[&str] = &["exec", "add-user", "add-file"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Timeout,
    EngineUnavailable,
    Internal,
}

impl ErrorKind {
    pub const fn code(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::NotFound => 404,
            Self::Timeout => 408,
            Self::EngineUnavailable => 503,
            Self::Internal => 500,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::NotFound => "NotFound",
            Self::Timeout => "Timeout",
            Self::EngineUnavailable => "EngineUnavailable",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error record handed to the transport: message, code, and kind are
/// always set together and the code always matches the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} ({code}): {message}")]
pub struct ApiError {
    pub message: String,
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: kind.code(),
            kind,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::validation(format!("missing required fields: {}", fields.join(", ")))
    }
}

/// Where a failure happened, for the log line.
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub operation: &'static str,
    pub target: &'a str,
    pub elapsed: Duration,
}

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.contains(m))
}

fn needs_running(operation: &str) -> bool {
    IN_CONTAINER_OPERATIONS.contains(&operation)
}

/// Classify an opaque engine message from `operation` by its markers.
pub fn classify_fault_text(operation: &str, text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    if contains_any(&lower, UNAVAILABLE_MARKERS) {
        ErrorKind::EngineUnavailable
    } else if contains_any(&lower, NOT_FOUND_MARKERS)
        || (needs_running(operation) && contains_any(&lower, NOT_RUNNING_MARKERS))
    {
        ErrorKind::NotFound
    } else {
        ErrorKind::Internal
    }
}

fn wrong_state_text(text: &str) -> bool {
    contains_any(&text.to_lowercase(), NOT_RUNNING_MARKERS)
}

fn target_label(target: &str) -> String {
    if target.is_empty() {
        "resource".to_owned()
    } else {
        format!("container '{target}'")
    }
}

fn human_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{} seconds", d.as_secs())
    } else {
        format!("{} ms", d.as_millis())
    }
}

fn from_engine(err: &EngineError, ctx: &OpContext<'_>) -> ApiError {
    let target = target_label(ctx.target);
    match err {
        EngineError::NotFound(_) => ApiError::not_found(format!("{target} not found")),
        EngineError::NotRunning(_) => ApiError::not_found(format!("{target} is not running")),
        EngineError::Unavailable(_) => ApiError::unavailable("container engine unavailable"),
        EngineError::NameInUse(name) => {
            ApiError::internal(format!("container name '{name}' is already in use"))
        }
        EngineError::InvalidPath(path) => {
            ApiError::validation(format!("invalid destination path '{path}'"))
        }
        EngineError::Command(text) => match classify_fault_text(ctx.operation, text) {
            ErrorKind::EngineUnavailable => ApiError::unavailable("container engine unavailable"),
            ErrorKind::NotFound if wrong_state_text(text) => {
                ApiError::not_found(format!("{target} is not running"))
            }
            ErrorKind::NotFound => ApiError::not_found(format!("{target} not found")),
            _ if wrong_state_text(text) => ApiError::internal(format!(
                "{} failed: {target} is in a state that does not allow it",
                ctx.operation
            )),
            _ => ApiError::internal(format!("{} failed: engine error", ctx.operation)),
        },
        EngineError::Io(_) | EngineError::UnknownBackend(_) | EngineError::Parse(_) => {
            ApiError::internal(format!("{} failed: engine error", ctx.operation))
        }
    }
}

fn from_bridge(err: &BridgeError, ctx: &OpContext<'_>) -> ApiError {
    match err {
        BridgeError::Timeout { after, .. } => ApiError::new(
            ErrorKind::Timeout,
            format!("operation timed out after {}", human_duration(*after)),
        ),
        BridgeError::ShuttingDown => ApiError::unavailable("service is shutting down"),
        BridgeError::Panicked { .. }
        | BridgeError::Lost { .. }
        | BridgeError::NoWorkers
        | BridgeError::Spawn(_) => {
            ApiError::internal(format!("{} failed: internal error", ctx.operation))
        }
    }
}

/// Map a failure onto the taxonomy and log it with its full detail.
pub fn normalize(err: &OperationError, ctx: &OpContext<'_>) -> ApiError {
    let api = match err {
        OperationError::Engine(e) => from_engine(e, ctx),
        OperationError::Bridge(e) => from_bridge(e, ctx),
        OperationError::CommandFailed {
            command, exit_code, ..
        } => ApiError::internal(format!(
            "{command} failed inside {} with exit code {exit_code}",
            target_label(ctx.target)
        )),
    };

    match api.kind {
        ErrorKind::NotFound | ErrorKind::Validation => warn!(
            "{} '{}' failed after {:?}: {} ({err})",
            ctx.operation, ctx.target, ctx.elapsed, api.kind
        ),
        _ => error!(
            "{} '{}' failed after {:?}: {} ({err})",
            ctx.operation, ctx.target, ctx.elapsed, api.kind
        ),
    }
    api
}
