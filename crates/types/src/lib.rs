//! Shared type definitions for the Meridian execution engine.
//!
//! These types cross crate boundaries: the engine produces them, the REST layer serializes them,
//! and handlers implemented by collaborators consume and return them.

pub mod capability;
pub mod execute;
pub mod pattern;
pub mod snapshot;
pub mod trace;
pub mod value;

pub use capability::{CapabilityResult, ResultMetadata};
pub use execute::{ExecuteRequest, ExecuteResponse};
pub use pattern::{InputType, PatternDefinition, PatternInput, PatternKey, StepDefinition};
pub use snapshot::{SnapshotState, SnapshotStatus};
pub use trace::{ExecutionTrace, StepOutcome, StepRecord};
pub use value::{PathError, Value, parse_path};
