//! # Meridian Engine
//!
//! Executes declarative analytics patterns against a single, immutable pricing snapshot.
//!
//! A request flows through four stages:
//!
//! - **Context**: [`ContextBuilder`] pins the snapshot, ledger, and valuation date and refuses to
//!   start while the snapshot is still warming (unless stale data was explicitly allowed).
//! - **Patterns**: [`PatternStore`] loads, validates, and caches definitions.
//! - **Orchestration**: [`Orchestrator`] walks the steps in order, resolving `{{ }}` templates
//!   against inputs, accumulated state, and the context.
//! - **Dispatch**: [`Runtime`] routes each capability to the one handler that owns it, behind a
//!   per-handler circuit breaker.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use chrono::NaiveDate;
//! use indexmap::IndexMap;
//! use meridian_engine::{
//!     ContextBuilder, ContextRequest, InMemoryPatternSource, Orchestrator, PatternStore, Runtime,
//!     StaticSnapshotSource, runtime::PreviewHandler,
//! };
//! use meridian_types::{SnapshotState, SnapshotStatus, Value};
//!
//! # tokio::runtime::Runtime::new()?.block_on(async {
//! let definition = serde_yaml::from_str(
//!     r#"
//! id: holdings
//! inputs:
//!   portfolio_id: { required: true, type: string }
//! steps:
//!   - capability: ledger.positions
//!     args: { portfolio_id: "{{inputs.portfolio_id}}" }
//!     as: positions
//! outputs: [positions]
//! "#,
//! )?;
//! let store = Arc::new(PatternStore::new(Arc::new(InMemoryPatternSource::with_definitions([definition]))));
//!
//! let mut runtime = Runtime::default();
//! runtime.register(PreviewHandler::registration(["ledger.positions"]))?;
//!
//! let snapshots = Arc::new(StaticSnapshotSource::new(SnapshotState {
//!     snapshot_id: "PP_2024-06-28".into(),
//!     ledger_id: "LEDGER_abc123".into(),
//!     as_of: NaiveDate::from_ymd_opt(2024, 6, 28).unwrap_or_default(),
//!     status: SnapshotStatus::Fresh,
//!     estimated_ready_at: None,
//!     error: None,
//! }));
//! let context = ContextBuilder::new(snapshots).build(ContextRequest::new()).await?;
//!
//! let orchestrator = Orchestrator::new(store, Arc::new(runtime));
//! let inputs = IndexMap::from([("portfolio_id".to_string(), Value::from("P-1"))]);
//! let output = orchestrator.run("holdings", context, inputs).await?;
//! assert_eq!(output.trace.snapshot_id, "PP_2024-06-28");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod pattern;
pub mod resolve;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod trace;

pub use config::{EngineConfig, default_config_path, load_config, load_config_from_path};
pub use context::{ContextBuilder, ContextRequest, RequestContext};
pub use error::{EngineError, ErrorCategory, RegistrationError};
pub use orchestrator::{Orchestrator, RunFailure, RunOutput, prepare_inputs};
pub use pattern::{DirectoryPatternSource, InMemoryPatternSource, PatternSource, PatternStore, ReloadOutcome, validate_pattern};
pub use resolve::{ResolutionScope, resolve_args};
pub use runtime::{
    BreakerConfig, CapabilityCall, CapabilityOperation, Dispatched, FailureKind, HandlerFailure, HandlerRegistration,
    HandlerSnapshot, Runtime,
};
pub use snapshot::{SnapshotStatusSource, StaticSnapshotSource};
pub use state::StateView;
pub use trace::TraceRecorder;
