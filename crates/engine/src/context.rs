//! Request context construction and the freshness gate.
//!
//! Every run is pinned to exactly one snapshot and ledger state. [`ContextBuilder::build`] asks the
//! [`SnapshotStatusSource`] which snapshot applies, refuses warming snapshots unless the caller
//! explicitly accepts stale data, and returns an immutable [`RequestContext`] shared by every
//! downstream call of the run.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use meridian_types::{ExecuteRequest, SnapshotState, SnapshotStatus, Value};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::EngineError, snapshot::SnapshotStatusSource};

/// Immutable identity of one request: which data it reads and who asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    snapshot_id: String,
    ledger_id: String,
    as_of: NaiveDate,
    allow_stale: bool,
    snapshot_status: SnapshotStatus,
    request_id: Uuid,
    trace_id: Uuid,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl RequestContext {
    fn from_snapshot(state: &SnapshotState, request: &ContextRequest) -> Self {
        Self {
            snapshot_id: state.snapshot_id.clone(),
            ledger_id: state.ledger_id.clone(),
            as_of: request.as_of.unwrap_or(state.as_of),
            allow_stale: !request.require_fresh,
            snapshot_status: state.status,
            request_id: Uuid::new_v4(),
            trace_id: request.trace_id.unwrap_or_else(Uuid::new_v4),
            user_id: request.user_id.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    pub fn as_of(&self) -> NaiveDate {
        self.as_of
    }

    pub fn allow_stale(&self) -> bool {
        self.allow_stale
    }

    /// Status the gate observed when the context was built.
    pub fn snapshot_status(&self) -> SnapshotStatus {
        self.snapshot_status
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The `ctx` namespace visible to templates and conditions.
    pub fn to_value(&self) -> Value {
        Value::map([
            ("snapshot_id", Value::from(self.snapshot_id.as_str())),
            ("ledger_id", Value::from(self.ledger_id.as_str())),
            ("as_of", Value::from(self.as_of.to_string())),
            ("allow_stale", Value::from(self.allow_stale)),
            ("snapshot_status", Value::from(self.snapshot_status.as_str())),
            ("request_id", Value::from(self.request_id.to_string())),
            ("trace_id", Value::from(self.trace_id.to_string())),
            ("user_id", Value::from(self.user_id.clone())),
            (
                "created_at",
                Value::from(self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
        ])
    }
}

/// What the caller asks for when a request starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextRequest {
    /// Target snapshot instead of the current one.
    pub snapshot_id: Option<String>,
    /// Reject warming snapshots. Defaults to true.
    pub require_fresh: bool,
    pub as_of: Option<NaiveDate>,
    pub user_id: Option<String>,
    /// Propagated trace id from an upstream caller.
    pub trace_id: Option<Uuid>,
}

impl Default for ContextRequest {
    fn default() -> Self {
        Self {
            snapshot_id: None,
            require_fresh: true,
            as_of: None,
            user_id: None,
            trace_id: None,
        }
    }
}

impl ContextRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a warming snapshot instead of failing fast.
    pub fn allow_stale(mut self) -> Self {
        self.require_fresh = false;
        self
    }

    pub fn for_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl From<&ExecuteRequest> for ContextRequest {
    fn from(request: &ExecuteRequest) -> Self {
        Self {
            snapshot_id: request.snapshot_id.clone(),
            require_fresh: !request.allow_stale,
            as_of: request.as_of,
            user_id: request.user_id.clone(),
            trace_id: None,
        }
    }
}

/// Builds request contexts behind the freshness gate.
#[derive(Clone)]
pub struct ContextBuilder {
    source: Arc<dyn SnapshotStatusSource>,
}

impl ContextBuilder {
    pub fn new(source: Arc<dyn SnapshotStatusSource>) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &Arc<dyn SnapshotStatusSource> {
        &self.source
    }

    /// Resolves the snapshot for `request` and applies the freshness gate.
    ///
    /// * `error` snapshots fail with [`EngineError::SnapshotError`] regardless of flags.
    /// * `warming` snapshots fail with [`EngineError::SnapshotNotReady`] unless stale data is allowed.
    /// * Unknown target snapshots fail with [`EngineError::SnapshotError`].
    pub async fn build(&self, request: ContextRequest) -> Result<Arc<RequestContext>, EngineError> {
        let state = match request.snapshot_id.as_deref() {
            Some(snapshot_id) => self
                .source
                .status_of(snapshot_id)
                .await?
                .ok_or_else(|| EngineError::snapshot_error(snapshot_id, "snapshot is not known to the status source"))?,
            None => self.source.current().await?,
        };

        match state.status {
            SnapshotStatus::Error => {
                warn!(snapshot = %state.snapshot_id, "request rejected: snapshot in error state");
                Err(EngineError::snapshot_error(
                    state.snapshot_id,
                    state.error.unwrap_or_else(|| "reconciliation failed".to_string()),
                ))
            }
            SnapshotStatus::Warming if request.require_fresh => {
                debug!(snapshot = %state.snapshot_id, "request rejected: snapshot still warming");
                Err(EngineError::snapshot_not_ready(state.snapshot_id, state.estimated_ready_at))
            }
            status => {
                if status == SnapshotStatus::Warming {
                    warn!(snapshot = %state.snapshot_id, "serving warming snapshot on explicit override");
                }
                let context = RequestContext::from_snapshot(&state, &request);
                debug!(
                    request_id = %context.request_id,
                    snapshot = %context.snapshot_id,
                    ledger = %context.ledger_id,
                    "request context built"
                );
                Ok(Arc::new(context))
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<RequestContext> {
    let state = SnapshotState {
        snapshot_id: "PP_2024-06-28".into(),
        ledger_id: "LEDGER_abc123".into(),
        as_of: NaiveDate::from_ymd_opt(2024, 6, 28).expect("date"),
        status: SnapshotStatus::Fresh,
        estimated_ready_at: None,
        error: None,
    };
    Arc::new(RequestContext::from_snapshot(&state, &ContextRequest::default()))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::snapshot::StaticSnapshotSource;

    fn state(status: SnapshotStatus) -> SnapshotState {
        SnapshotState {
            snapshot_id: "PP_2024-06-28".into(),
            ledger_id: "LEDGER_abc123".into(),
            as_of: NaiveDate::from_ymd_opt(2024, 6, 28).expect("date"),
            status,
            estimated_ready_at: None,
            error: None,
        }
    }

    fn builder(state: SnapshotState) -> ContextBuilder {
        ContextBuilder::new(Arc::new(StaticSnapshotSource::new(state)))
    }

    #[tokio::test]
    async fn fresh_snapshot_is_never_blocked() {
        for request in [ContextRequest::new(), ContextRequest::new().allow_stale()] {
            let context = builder(state(SnapshotStatus::Fresh)).build(request).await.expect("fresh context");
            assert_eq!(context.snapshot_id(), "PP_2024-06-28");
            assert_eq!(context.ledger_id(), "LEDGER_abc123");
            assert_eq!(context.snapshot_status(), SnapshotStatus::Fresh);
        }
    }

    #[tokio::test]
    async fn warming_snapshot_blocks_without_override() {
        let ready_at = Utc::now() + Duration::minutes(5);
        let mut warming = state(SnapshotStatus::Warming);
        warming.estimated_ready_at = Some(ready_at);

        let error = builder(warming).build(ContextRequest::new()).await.expect_err("gate blocks");
        match error {
            EngineError::SnapshotNotReady {
                snapshot_id,
                estimated_ready_at,
            } => {
                assert_eq!(snapshot_id, "PP_2024-06-28");
                assert_eq!(estimated_ready_at, Some(ready_at));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn warming_snapshot_with_override_carries_id_verbatim() {
        let context = builder(state(SnapshotStatus::Warming))
            .build(ContextRequest::new().allow_stale().user("analyst-7"))
            .await
            .expect("override accepted");
        assert_eq!(context.snapshot_id(), "PP_2024-06-28");
        assert!(context.allow_stale());
        assert_eq!(context.snapshot_status(), SnapshotStatus::Warming);
        assert_eq!(context.user_id(), Some("analyst-7"));
    }

    #[tokio::test]
    async fn error_snapshot_fails_regardless_of_override() {
        let mut errored = state(SnapshotStatus::Error);
        errored.error = Some("ledger reconciliation mismatch".into());
        let error = builder(errored)
            .build(ContextRequest::new().allow_stale())
            .await
            .expect_err("error snapshot");
        assert!(matches!(error, EngineError::SnapshotError { ref reason, .. } if reason == "ledger reconciliation mismatch"));
    }

    #[tokio::test]
    async fn unknown_target_snapshot_is_rejected() {
        let error = builder(state(SnapshotStatus::Fresh))
            .build(ContextRequest::new().for_snapshot("PP_1999-12-31"))
            .await
            .expect_err("unknown snapshot");
        assert_eq!(error.code(), "SNAPSHOT_ERROR");
    }

    #[tokio::test]
    async fn each_context_gets_unique_request_id() {
        let builder = builder(state(SnapshotStatus::Fresh));
        let first = builder.build(ContextRequest::new()).await.expect("first");
        let second = builder.build(ContextRequest::new()).await.expect("second");
        assert_ne!(first.request_id(), second.request_id());
    }

    #[test]
    fn ctx_namespace_exposes_identifiers() {
        let context = test_context();
        let value = context.to_value();
        assert_eq!(value.lookup(&["snapshot_id"]), Ok(&Value::from("PP_2024-06-28")));
        assert_eq!(value.lookup(&["as_of"]), Ok(&Value::from("2024-06-28")));
        assert_eq!(value.lookup(&["user_id"]), Ok(&Value::Null));
    }
}
