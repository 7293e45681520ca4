//! Snapshot status collaborators consulted by the freshness gate.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use meridian_types::{SnapshotState, SnapshotStatus};
use tracing::info;

use crate::error::EngineError;

/// Reports the status of pricing-pack snapshots.
#[async_trait]
pub trait SnapshotStatusSource: Send + Sync {
    /// The snapshot new requests are pinned to.
    async fn current(&self) -> Result<SnapshotState, EngineError>;

    /// Status of a specific snapshot; `None` when the source has never heard of it.
    async fn status_of(&self, snapshot_id: &str) -> Result<Option<SnapshotState>, EngineError> {
        let current = self.current().await?;
        Ok((current.snapshot_id == snapshot_id).then_some(current))
    }
}

#[derive(Debug)]
struct Registry {
    current: String,
    snapshots: IndexMap<String, SnapshotState>,
}

/// In-process status source whose lifecycle is driven by explicit calls.
///
/// Only `warming -> fresh`, `warming -> error` and `fresh -> warming` are accepted; an errored
/// snapshot stays errored until [`StaticSnapshotSource::repair`] moves it back to warming.
#[derive(Debug)]
pub struct StaticSnapshotSource {
    registry: Mutex<Registry>,
}

impl StaticSnapshotSource {
    pub fn new(initial: SnapshotState) -> Self {
        let current = initial.snapshot_id.clone();
        let mut snapshots = IndexMap::new();
        snapshots.insert(current.clone(), initial);
        Self {
            registry: Mutex::new(Registry { current, snapshots }),
        }
    }

    /// Records a new snapshot and makes it current.
    pub fn publish(&self, state: SnapshotState) {
        let mut registry = self.lock();
        info!(snapshot = %state.snapshot_id, status = state.status.as_str(), "snapshot published");
        registry.current = state.snapshot_id.clone();
        registry.snapshots.insert(state.snapshot_id.clone(), state);
    }

    /// Moves `snapshot_id` to `next`, rejecting transitions outside the lifecycle.
    pub fn transition(&self, snapshot_id: &str, next: SnapshotStatus) -> Result<SnapshotState, EngineError> {
        let mut registry = self.lock();
        let state = registry
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| EngineError::snapshot_error(snapshot_id, "snapshot is not known to the status source"))?;
        if !state.status.can_transition_to(next) {
            return Err(EngineError::snapshot_error(
                snapshot_id,
                format!("cannot move from {} to {}", state.status.as_str(), next.as_str()),
            ));
        }
        apply_status(state, next);
        info!(snapshot = %snapshot_id, status = next.as_str(), "snapshot status changed");
        Ok(state.clone())
    }

    /// Marks a warming snapshot as failed with `reason`.
    pub fn fail(&self, snapshot_id: &str, reason: impl Into<String>) -> Result<SnapshotState, EngineError> {
        let mut state = self.transition(snapshot_id, SnapshotStatus::Error)?;
        let reason = reason.into();
        let mut registry = self.lock();
        if let Some(stored) = registry.snapshots.get_mut(snapshot_id) {
            stored.error = Some(reason.clone());
        }
        state.error = Some(reason);
        Ok(state)
    }

    /// Moves an errored snapshot back to warming after an external fix.
    pub fn repair(&self, snapshot_id: &str) -> Result<SnapshotState, EngineError> {
        let mut registry = self.lock();
        let state = registry
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| EngineError::snapshot_error(snapshot_id, "snapshot is not known to the status source"))?;
        if state.status != SnapshotStatus::Error {
            return Err(EngineError::snapshot_error(
                snapshot_id,
                format!("only errored snapshots can be repaired, status is {}", state.status.as_str()),
            ));
        }
        apply_status(state, SnapshotStatus::Warming);
        Ok(state.clone())
    }

    /// Updates the completion estimate of a warming snapshot.
    pub fn set_estimated_ready_at(&self, snapshot_id: &str, ready_at: DateTime<Utc>) -> Result<(), EngineError> {
        let mut registry = self.lock();
        let state = registry
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| EngineError::snapshot_error(snapshot_id, "snapshot is not known to the status source"))?;
        state.estimated_ready_at = Some(ready_at);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_status(state: &mut SnapshotState, next: SnapshotStatus) {
    state.status = next;
    state.estimated_ready_at = None;
    if next != SnapshotStatus::Error {
        state.error = None;
    }
}

#[async_trait]
impl SnapshotStatusSource for StaticSnapshotSource {
    async fn current(&self) -> Result<SnapshotState, EngineError> {
        let registry = self.lock();
        registry
            .snapshots
            .get(&registry.current)
            .cloned()
            .ok_or_else(|| EngineError::snapshot_error(registry.current.clone(), "current snapshot is missing"))
    }

    async fn status_of(&self, snapshot_id: &str) -> Result<Option<SnapshotState>, EngineError> {
        Ok(self.lock().snapshots.get(snapshot_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn warming(snapshot_id: &str) -> SnapshotState {
        SnapshotState {
            snapshot_id: snapshot_id.into(),
            ledger_id: "LEDGER_abc123".into(),
            as_of: NaiveDate::from_ymd_opt(2024, 6, 28).expect("date"),
            status: SnapshotStatus::Warming,
            estimated_ready_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_accepts_documented_transitions() {
        let source = StaticSnapshotSource::new(warming("PP_2024-06-28"));
        source.transition("PP_2024-06-28", SnapshotStatus::Fresh).expect("warming -> fresh");
        source.transition("PP_2024-06-28", SnapshotStatus::Warming).expect("fresh -> warming");
        let failed = source.fail("PP_2024-06-28", "price feed gap").expect("warming -> error");

        assert_eq!(failed.status, SnapshotStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("price feed gap"));
        assert!(source.transition("PP_2024-06-28", SnapshotStatus::Fresh).is_err(), "error is terminal");

        let repaired = source.repair("PP_2024-06-28").expect("repair");
        assert_eq!(repaired.status, SnapshotStatus::Warming);
        assert!(repaired.error.is_none());
    }

    #[tokio::test]
    async fn publish_switches_current_snapshot() {
        let source = StaticSnapshotSource::new(warming("PP_2024-06-27"));
        source.publish(warming("PP_2024-06-28"));

        assert_eq!(source.current().await.expect("current").snapshot_id, "PP_2024-06-28");
        assert!(source.status_of("PP_2024-06-27").await.expect("status").is_some());
        assert!(source.status_of("PP_1999-01-01").await.expect("status").is_none());
    }
}
