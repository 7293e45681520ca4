//! Per-run trace recorder.
//!
//! The recorder is a passive accumulator owned by one run. It never shares state across requests;
//! [`TraceRecorder::finish`] stamps the context identifiers onto the collected step records and
//! returns the [`ExecutionTrace`] that travels back with the response.

use std::time::Instant;

use chrono::{DateTime, Utc};
use meridian_types::{ExecutionTrace, StepDefinition, StepOutcome, StepRecord};
use tracing::{info, warn};

use crate::{context::RequestContext, error::EngineError, runtime::Dispatched};

/// Wall-clock start plus a monotonic timer for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepTimer {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StepTimer {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Default)]
pub struct TraceRecorder {
    steps: Vec<StepRecord>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, index: usize, step: &StepDefinition, dispatched: &Dispatched, timer: StepTimer) {
        let duration_ms = timer.elapsed_ms();
        info!(
            step = index,
            capability = %step.capability,
            handler = %dispatched.handler_id,
            source = %dispatched.result.metadata.source,
            duration_ms,
            "step succeeded"
        );
        self.steps.push(StepRecord {
            index,
            capability: step.capability.clone(),
            binding: step.binding.clone(),
            handler: Some(dispatched.handler_id.clone()),
            operation: Some(dispatched.operation.clone()),
            started_at: timer.started_at,
            duration_ms,
            outcome: StepOutcome::Succeeded,
            source: Some(dispatched.result.metadata.source.clone()),
            as_of: dispatched.result.metadata.as_of,
            error: None,
        });
    }

    pub fn record_skip(&mut self, index: usize, step: &StepDefinition) {
        info!(step = index, capability = %step.capability, "step skipped; condition was false");
        self.steps.push(StepRecord {
            index,
            capability: step.capability.clone(),
            binding: step.binding.clone(),
            handler: None,
            operation: None,
            started_at: Utc::now(),
            duration_ms: 0,
            outcome: StepOutcome::Skipped,
            source: None,
            as_of: None,
            error: None,
        });
    }

    /// Records the failing step. `route` is the handler and operation the capability maps to, when known.
    pub fn record_failure(
        &mut self,
        index: usize,
        step: &StepDefinition,
        route: Option<(&str, &str)>,
        timer: StepTimer,
        error: &EngineError,
    ) {
        let duration_ms = timer.elapsed_ms();
        warn!(
            step = index,
            capability = %step.capability,
            code = error.code(),
            error = %error,
            "step failed"
        );
        self.steps.push(StepRecord {
            index,
            capability: step.capability.clone(),
            binding: step.binding.clone(),
            handler: route.map(|(handler, _)| handler.to_string()),
            operation: route.map(|(_, operation)| operation.to_string()),
            started_at: timer.started_at,
            duration_ms,
            outcome: StepOutcome::Failed,
            source: None,
            as_of: None,
            error: Some(error.to_string()),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn finish(self, pattern_id: &str, pattern_version: Option<&str>, context: &RequestContext) -> ExecutionTrace {
        ExecutionTrace {
            pattern_id: pattern_id.to_string(),
            pattern_version: pattern_version.map(str::to_string),
            snapshot_id: context.snapshot_id().to_string(),
            ledger_id: context.ledger_id().to_string(),
            request_id: context.request_id().to_string(),
            snapshot_status: context.snapshot_status(),
            steps: self.steps,
        }
    }
}
