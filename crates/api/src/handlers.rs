//! Route handlers for the `/v1` surface.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use meridian_engine::{ContextRequest, HandlerSnapshot};
use meridian_types::{ExecuteRequest, ExecuteResponse, SnapshotStatus};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{AppState, error::ApiError};

/// `POST /v1/execute`: gate, run, and return outputs plus the trace.
///
/// The run is cancelled once the configured timeout elapses; the step already dispatched may finish
/// but nothing after it runs. A run still busy after the cancel grace period is abandoned and the
/// request fails with `RUN_TIMEOUT`.
pub async fn execute(
    State(state): State<AppState>,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if request.pattern_id.trim().is_empty() {
        return Err(ApiError::BadRequest("pattern_id cannot be empty".to_string()));
    }

    let context = state.contexts.build(ContextRequest::from(&request)).await?;
    info!(
        pattern = %request.pattern_id,
        request_id = %context.request_id(),
        snapshot = %context.snapshot_id(),
        "execute request accepted"
    );

    let cancel = CancellationToken::new();
    let run = state
        .orchestrator
        .run_with_cancellation(&request.pattern_id, context, request.inputs, cancel.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::time::sleep(state.run_timeout) => {
            warn!(
                pattern = %request.pattern_id,
                timeout_ms = u64::try_from(state.run_timeout.as_millis()).unwrap_or(u64::MAX),
                "run timeout elapsed; cancelling"
            );
            cancel.cancel();
            match tokio::time::timeout(state.cancel_grace, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(pattern = %request.pattern_id, "cancelled run did not stop within grace period; abandoning");
                    return Err(ApiError::RunTimedOut {
                        pattern_id: request.pattern_id.clone(),
                        timeout: state.run_timeout,
                    });
                }
            }
        }
    };

    let output = result?;
    Ok(Json(ExecuteResponse {
        outputs: output.outputs,
        trace: output.trace,
    }))
}

#[derive(Debug, Serialize)]
pub struct PatternList {
    pub patterns: Vec<String>,
}

/// `GET /v1/patterns`
pub async fn list_patterns(State(state): State<AppState>) -> Result<Json<PatternList>, ApiError> {
    let patterns = state.orchestrator.store().list().await?;
    Ok(Json(PatternList { patterns }))
}

#[derive(Debug, Serialize)]
pub struct HandlerList {
    pub handlers: Vec<HandlerSnapshot>,
}

/// `GET /v1/runtime/handlers`
pub async fn list_handlers(State(state): State<AppState>) -> Json<HandlerList> {
    Json(HandlerList {
        handlers: state.orchestrator.runtime().handlers(),
    })
}

/// `GET /v1/health`: readiness of the current snapshot. A warming snapshot reports `degraded`.
pub async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.contexts.source().current().await?;
    let status = match snapshot.status {
        SnapshotStatus::Fresh => "ok",
        SnapshotStatus::Warming => "degraded",
        SnapshotStatus::Error => "unavailable",
    };
    Ok(Json(json!({
        "status": status,
        "snapshot": snapshot,
        "handlers": state.orchestrator.runtime().handlers().len(),
    })))
}
