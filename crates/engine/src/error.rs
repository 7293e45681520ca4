//! Error taxonomy shared by every engine component.
//!
//! Each variant maps to one failure class of the execution contract. Callers use
//! [`EngineError::is_retryable`] and [`EngineError::retry_hint`] to decide between
//! "try again shortly" and a hard failure, and [`EngineError::code`] for stable
//! machine-readable identifiers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::runtime::HandlerFailure;

/// Retry hint used when a warming snapshot carries no completion estimate.
pub const DEFAULT_SNAPSHOT_RETRY: Duration = Duration::from_secs(30);

/// Errors raised while building a context, loading a pattern, or executing its steps.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("snapshot {snapshot_id} is still warming")]
    SnapshotNotReady {
        snapshot_id: String,
        estimated_ready_at: Option<DateTime<Utc>>,
    },

    #[error("snapshot {snapshot_id} is unavailable: {reason}")]
    SnapshotError { snapshot_id: String, reason: String },

    #[error("pattern '{pattern_id}' was not found")]
    PatternNotFound {
        pattern_id: String,
        version: Option<String>,
    },

    #[error("pattern '{pattern_id}' is invalid: {reason}")]
    PatternInvalid { pattern_id: String, reason: String },

    #[error("argument '{path}' could not resolve '{expression}': {reason}")]
    TemplateUnresolved {
        path: String,
        expression: String,
        reason: String,
    },

    #[error("no handler is registered for capability '{capability}'")]
    CapabilityNotRegistered { capability: String },

    #[error("handler '{handler}' is unavailable for '{capability}'; retry in {}ms", .retry_after.as_millis())]
    HandlerUnavailable {
        handler: String,
        capability: String,
        retry_after: Duration,
        last_failure: Option<String>,
    },

    #[error("capability '{capability}' failed in handler '{handler}': {failure}")]
    CapabilityExecutionFailed {
        capability: String,
        handler: String,
        operation: String,
        failure: HandlerFailure,
    },

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("run cancelled before step {index}")]
    Cancelled { index: usize },

    #[error("pattern '{pattern_id}' failed at step {index} ({capability}): {source}")]
    StepFailed {
        pattern_id: String,
        index: usize,
        capability: String,
        handler: Option<String>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("registration rejected: {0}")]
    Registration(#[from] RegistrationError),

    #[error("pattern source error: {message}")]
    Source { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Boot-time handler registration failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("capability '{capability}' requested by '{handler}' is already owned by '{owner}'")]
    DuplicateCapability {
        capability: String,
        handler: String,
        owner: String,
    },

    #[error("handler '{handler}' is already registered")]
    DuplicateHandler { handler: String },

    #[error("handler '{handler}' declares an empty capability name")]
    EmptyCapability { handler: String },
}

/// Coarse classification surfaced to API clients alongside the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Availability,
    NotFound,
    Validation,
    Execution,
    Conflict,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Availability => "availability",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl EngineError {
    /// Create a snapshot-not-ready error.
    pub fn snapshot_not_ready(snapshot_id: impl Into<String>, estimated_ready_at: Option<DateTime<Utc>>) -> Self {
        Self::SnapshotNotReady {
            snapshot_id: snapshot_id.into(),
            estimated_ready_at,
        }
    }

    /// Create a snapshot error.
    pub fn snapshot_error(snapshot_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SnapshotError {
            snapshot_id: snapshot_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a pattern-not-found error.
    pub fn pattern_not_found(pattern_id: impl Into<String>, version: Option<String>) -> Self {
        Self::PatternNotFound {
            pattern_id: pattern_id.into(),
            version,
        }
    }

    /// Create a pattern-invalid error.
    pub fn pattern_invalid(pattern_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PatternInvalid {
            pattern_id: pattern_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a template resolution error.
    pub fn template_unresolved(path: impl Into<String>, expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TemplateUnresolved {
            path: path.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Create a capability-not-registered error.
    pub fn capability_not_registered(capability: impl Into<String>) -> Self {
        Self::CapabilityNotRegistered {
            capability: capability.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a definition source error.
    pub fn source_error(message: impl Into<String>) -> Self {
        Self::Source { message: message.into() }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Wraps `self` with the address of the step that produced it.
    pub fn at_step(self, pattern_id: impl Into<String>, index: usize, capability: impl Into<String>, handler: Option<String>) -> Self {
        Self::StepFailed {
            pattern_id: pattern_id.into(),
            index,
            capability: capability.into(),
            handler,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through step addressing.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::SnapshotNotReady { .. } | EngineError::HandlerUnavailable { .. } => true,
            EngineError::CapabilityExecutionFailed { failure, .. } => failure.kind.is_retryable(),
            EngineError::Cancelled { .. } => true,
            EngineError::StepFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Suggested delay before retrying, when one is known.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            EngineError::SnapshotNotReady { estimated_ready_at, .. } => Some(
                estimated_ready_at
                    .map(|ready_at| (ready_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                    .filter(|remaining| !remaining.is_zero())
                    .unwrap_or(DEFAULT_SNAPSHOT_RETRY),
            ),
            EngineError::HandlerUnavailable { retry_after, .. } => Some(*retry_after),
            EngineError::StepFailed { source, .. } => source.retry_hint(),
            _ => None,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SnapshotNotReady { .. } => "SNAPSHOT_NOT_READY",
            EngineError::SnapshotError { .. } => "SNAPSHOT_ERROR",
            EngineError::PatternNotFound { .. } => "PATTERN_NOT_FOUND",
            EngineError::PatternInvalid { .. } => "PATTERN_INVALID",
            EngineError::TemplateUnresolved { .. } => "TEMPLATE_UNRESOLVED",
            EngineError::CapabilityNotRegistered { .. } => "CAPABILITY_NOT_REGISTERED",
            EngineError::HandlerUnavailable { .. } => "HANDLER_UNAVAILABLE",
            EngineError::CapabilityExecutionFailed { .. } => "CAPABILITY_EXECUTION_FAILED",
            EngineError::InvalidInput { .. } => "INVALID_INPUT",
            EngineError::Cancelled { .. } => "RUN_CANCELLED",
            EngineError::StepFailed { source, .. } => source.code(),
            EngineError::Registration(_) => "REGISTRATION_REJECTED",
            EngineError::Source { .. } => "PATTERN_SOURCE_ERROR",
            EngineError::Config { .. } => "CONFIG_INVALID",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::SnapshotNotReady { .. } | EngineError::HandlerUnavailable { .. } | EngineError::Cancelled { .. } => {
                ErrorCategory::Availability
            }
            EngineError::PatternNotFound { .. } => ErrorCategory::NotFound,
            EngineError::PatternInvalid { .. } | EngineError::TemplateUnresolved { .. } | EngineError::InvalidInput { .. } => {
                ErrorCategory::Validation
            }
            EngineError::SnapshotError { .. }
            | EngineError::CapabilityNotRegistered { .. }
            | EngineError::CapabilityExecutionFailed { .. } => ErrorCategory::Execution,
            EngineError::StepFailed { source, .. } => source.category(),
            EngineError::Registration(_) => ErrorCategory::Conflict,
            EngineError::Source { .. } | EngineError::Config { .. } => ErrorCategory::Internal,
        }
    }
}
