//! Snapshot (pricing pack) status as reported by the reconciliation collaborator.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Readiness of the current pricing pack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Fully computed and safe to serve.
    #[serde(alias = "FRESH")]
    Fresh,
    /// Pre-warm in progress; results would be computed against incomplete inputs.
    #[serde(alias = "WARMING")]
    Warming,
    /// Reconciliation failed; terminal until repaired externally.
    #[serde(alias = "ERROR")]
    Error,
}

impl SnapshotStatus {
    /// Returns true when moving from `self` to `next` is a legal lifecycle transition.
    ///
    /// Legal moves are `warming -> fresh`, `warming -> error`, and `fresh -> warming`.
    pub fn can_transition_to(self, next: SnapshotStatus) -> bool {
        matches!(
            (self, next),
            (SnapshotStatus::Warming, SnapshotStatus::Fresh)
                | (SnapshotStatus::Warming, SnapshotStatus::Error)
                | (SnapshotStatus::Fresh, SnapshotStatus::Warming)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotStatus::Fresh => "fresh",
            SnapshotStatus::Warming => "warming",
            SnapshotStatus::Error => "error",
        }
    }
}

/// Point-in-time report on a snapshot and the ledger state it was built against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotState {
    /// Immutable pricing pack identifier.
    pub snapshot_id: String,
    /// Immutable ledger state identifier paired with the snapshot.
    pub ledger_id: String,
    /// Valuation date the snapshot was computed for.
    pub as_of: NaiveDate,
    /// Current readiness.
    pub status: SnapshotStatus,
    /// Expected completion of a warming snapshot, when known.
    #[serde(default)]
    pub estimated_ready_at: Option<DateTime<Utc>>,
    /// Failure description for snapshots in the error state.
    #[serde(default)]
    pub error: Option<String>,
}
