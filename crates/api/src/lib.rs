//! Meridian API `/v1`: REST endpoints over the execution engine.

pub mod error;
pub mod handlers;
pub mod server;

use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use meridian_engine::{ContextBuilder, Orchestrator};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use server::{ApiServer, RunningApiServer, resolve_bind_address};

/// Time a cancelled run gets to stop at its next step boundary.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Shared, cheaply cloned state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub contexts: ContextBuilder,
    pub run_timeout: Duration,
    pub cancel_grace: Duration,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, contexts: ContextBuilder, run_timeout: Duration) -> Self {
        Self {
            orchestrator,
            contexts,
            run_timeout,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/execute", post(handlers::execute))
        .route("/v1/patterns", get(handlers::list_patterns))
        .route("/v1/runtime/handlers", get(handlers::list_handlers))
        .route("/v1/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
