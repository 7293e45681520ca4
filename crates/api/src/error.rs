//! Structured HTTP error responses.
//!
//! Every failure leaves the API as the same JSON shape:
//! `{ error_code, category, message, retryable, retry_after_ms?, context, suggested_action, trace? }`.

use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use meridian_engine::{EngineError, ErrorCategory, RunFailure};
use meridian_types::ExecutionTrace;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{error}")]
    Engine {
        error: EngineError,
        trace: Option<Box<ExecutionTrace>>,
    },

    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("pattern '{pattern_id}' did not stop within its {}ms run timeout", .timeout.as_millis())]
    RunTimedOut { pattern_id: String, timeout: Duration },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RunTimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Engine { error, .. } => match error.category() {
                ErrorCategory::Availability => StatusCode::SERVICE_UNAVAILABLE,
                ErrorCategory::NotFound => StatusCode::NOT_FOUND,
                ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorCategory::Execution => StatusCode::BAD_GATEWAY,
                ErrorCategory::Conflict => StatusCode::CONFLICT,
                ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn retry_hint(&self) -> Option<Duration> {
        match self {
            ApiError::Engine { error, .. } => error.retry_hint(),
            ApiError::BadRequest(_) | ApiError::RunTimedOut { .. } => None,
        }
    }

    fn body(&self) -> Value {
        match self {
            ApiError::BadRequest(message) => json!({
                "error_code": "INVALID_REQUEST",
                "category": "validation",
                "message": self.to_string(),
                "retryable": false,
                "context": { "reason": message },
                "suggested_action": "Send a JSON body with at least a pattern_id field.",
            }),
            ApiError::RunTimedOut { pattern_id, timeout } => json!({
                "error_code": "RUN_TIMEOUT",
                "category": "availability",
                "message": self.to_string(),
                "retryable": true,
                "context": {
                    "pattern_id": pattern_id,
                    "timeout_ms": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                },
                "suggested_action": "A capability handler is not responding; check /v1/runtime/handlers and retry.",
            }),
            ApiError::Engine { error, trace } => {
                let mut body = json!({
                    "error_code": error.code(),
                    "category": error.category().as_str(),
                    "message": error.to_string(),
                    "retryable": error.is_retryable(),
                    "context": error_context(error),
                    "suggested_action": suggested_action(error.root()),
                });
                if let Some(hint) = error.retry_hint() {
                    body["retry_after_ms"] = json!(u64::try_from(hint.as_millis()).unwrap_or(u64::MAX));
                }
                if let Some(trace) = trace {
                    body["trace"] = serde_json::to_value(trace).unwrap_or(Value::Null);
                }
                body
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        ApiError::Engine { error, trace: None }
    }
}

impl From<RunFailure> for ApiError {
    fn from(failure: RunFailure) -> Self {
        ApiError::Engine {
            error: failure.error,
            trace: Some(Box::new(failure.trace)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let retry_after = self.retry_hint();
        let mut response = (status, Json(self.body())).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE
            && let Some(hint) = retry_after
        {
            // Retry-After carries whole seconds; round up so clients never retry early.
            let seconds = hint.as_secs() + u64::from(hint.subsec_nanos() > 0);
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(seconds.max(1)));
        }
        response
    }
}

fn error_context(error: &EngineError) -> Value {
    let mut context = match error.root() {
        EngineError::SnapshotNotReady {
            snapshot_id,
            estimated_ready_at,
        } => json!({ "snapshot_id": snapshot_id, "estimated_ready_at": estimated_ready_at }),
        EngineError::SnapshotError { snapshot_id, reason } => json!({ "snapshot_id": snapshot_id, "reason": reason }),
        EngineError::PatternNotFound { pattern_id, version } => json!({ "pattern_id": pattern_id, "version": version }),
        EngineError::PatternInvalid { pattern_id, reason } => json!({ "pattern_id": pattern_id, "reason": reason }),
        EngineError::TemplateUnresolved { path, expression, reason } => {
            json!({ "argument": path, "expression": expression, "reason": reason })
        }
        EngineError::CapabilityNotRegistered { capability } => json!({ "capability": capability }),
        EngineError::HandlerUnavailable {
            handler,
            capability,
            last_failure,
            ..
        } => json!({ "handler": handler, "capability": capability, "last_failure": last_failure }),
        EngineError::CapabilityExecutionFailed {
            capability,
            handler,
            operation,
            failure,
        } => json!({
            "capability": capability,
            "handler": handler,
            "operation": operation,
            "failure_kind": failure.kind.as_str(),
        }),
        EngineError::InvalidInput { name, reason } => json!({ "input": name, "reason": reason }),
        EngineError::Cancelled { index } => json!({ "next_step": index }),
        _ => json!({}),
    };

    if let EngineError::StepFailed {
        pattern_id,
        index,
        capability,
        handler,
        ..
    } = error
    {
        context["pattern_id"] = json!(pattern_id);
        context["step_index"] = json!(index);
        context["step_capability"] = json!(capability);
        if let Some(handler) = handler {
            context["step_handler"] = json!(handler);
        }
    }
    context
}

fn suggested_action(error: &EngineError) -> &'static str {
    match error {
        EngineError::SnapshotNotReady { .. } => "Retry after the pricing snapshot finishes warming, or set allow_stale.",
        EngineError::SnapshotError { .. } => "Wait for the snapshot to be rebuilt or target another snapshot_id.",
        EngineError::PatternNotFound { .. } => "List available patterns with GET /v1/patterns.",
        EngineError::PatternInvalid { .. } => "Fix the pattern definition and reload it.",
        EngineError::TemplateUnresolved { .. } => "Check that the referenced input or state binding exists before this step.",
        EngineError::CapabilityNotRegistered { .. } => "Register a handler for this capability or remove the step.",
        EngineError::HandlerUnavailable { .. } => "Retry after the handler's circuit closes.",
        EngineError::CapabilityExecutionFailed { .. } => "Inspect the handler failure; retry if it was transient.",
        EngineError::InvalidInput { .. } => "Supply every required input with its declared type.",
        EngineError::Cancelled { .. } => "Retry the request; the run exceeded its time budget.",
        _ => "Check the server logs for details.",
    }
}
