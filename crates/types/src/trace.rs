//! Execution trace returned with every pattern run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::SnapshotStatus;

/// Final disposition of a single step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    /// The capability returned a result that was bound into state.
    Succeeded,
    /// The step's condition evaluated falsy; nothing was dispatched.
    Skipped,
    /// Argument resolution or dispatch failed; the run stopped here.
    Failed,
}

/// One entry per attempted step, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// Zero-based position of the step in the pattern.
    pub index: usize,
    pub capability: String,
    /// Binding name the result was (or would have been) stored under.
    pub binding: String,
    /// Handler that served the call, when routing got that far.
    #[serde(default)]
    pub handler: Option<String>,
    /// Handler-side operation name bound to the capability.
    #[serde(default)]
    pub operation: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
    /// Data source attribution from the result metadata.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
    /// Failure description for failed steps.
    #[serde(default)]
    pub error: Option<String>,
}

/// Self-describing record of a run, tying every output to its snapshot and ledger state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    pub pattern_id: String,
    #[serde(default)]
    pub pattern_version: Option<String>,
    pub snapshot_id: String,
    pub ledger_id: String,
    pub request_id: String,
    pub snapshot_status: SnapshotStatus,
    pub steps: Vec<StepRecord>,
}

impl ExecutionTrace {
    /// Number of steps that finished without failing (succeeded or skipped).
    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|record| record.outcome != StepOutcome::Failed)
            .count()
    }

    /// The failing record, if the run stopped on a step failure.
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.outcome == StepOutcome::Failed)
    }

    /// Distinct data sources consulted by the run, in first-use order.
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for source in self.steps.iter().filter_map(|record| record.source.as_deref()) {
            if !sources.contains(&source) {
                sources.push(source);
            }
        }
        sources
    }
}
