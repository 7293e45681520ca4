//! Capability router: maps capability names to the single handler that serves them.
//!
//! The routing table is assembled at boot through [`Runtime::register`] and is read-only once the
//! runtime is shared behind an `Arc`. Each handler owns one [`CircuitBreaker`]; dispatch consults
//! it before invoking the bound operation and reports the outcome afterwards.

pub mod breaker;
mod operation;
mod preview;
mod registration;

use std::{collections::HashMap, sync::Arc};

use indexmap::IndexMap;
use meridian_types::{CapabilityResult, Value};
use serde::Serialize;
use tracing::{debug, warn};

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker, ReopenPolicy};
pub use operation::{CapabilityCall, CapabilityOperation, FailureKind, HandlerFailure, SharedOperation};
pub use preview::{PREVIEW_HANDLER_ID, PREVIEW_SOURCE, PreviewHandler};
pub use registration::HandlerRegistration;

use crate::{
    context::RequestContext,
    error::{EngineError, RegistrationError},
    state::StateView,
};

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: CapabilityResult,
    pub handler_id: String,
    pub operation: String,
}

/// Diagnostic view of one registered handler.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerSnapshot {
    pub handler_id: String,
    pub capabilities: Vec<String>,
    pub breaker: BreakerSnapshot,
}

struct Route {
    handler_id: String,
    operation_name: String,
    operation: SharedOperation,
    breaker: Arc<CircuitBreaker>,
}

struct HandlerEntry {
    capabilities: Vec<String>,
    breaker: Arc<CircuitBreaker>,
}

/// Handler table plus per-handler breakers.
pub struct Runtime {
    breaker_config: BreakerConfig,
    handlers: IndexMap<String, HandlerEntry>,
    routes: HashMap<String, Route>,
}

impl Runtime {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        Self {
            breaker_config,
            handlers: IndexMap::new(),
            routes: HashMap::new(),
        }
    }

    /// Adds a handler and all of its capabilities, or nothing at all when any check fails.
    pub fn register(&mut self, registration: HandlerRegistration) -> Result<(), RegistrationError> {
        let handler_id = registration.handler_id().to_string();
        if self.handlers.contains_key(&handler_id) {
            return Err(RegistrationError::DuplicateHandler { handler: handler_id });
        }
        if let Some(capability) = registration.repeated().first() {
            return Err(RegistrationError::DuplicateCapability {
                capability: capability.clone(),
                handler: handler_id.clone(),
                owner: handler_id,
            });
        }
        for capability in registration.capability_names() {
            if capability.trim().is_empty() {
                return Err(RegistrationError::EmptyCapability { handler: handler_id });
            }
            if let Some(existing) = self.routes.get(capability) {
                return Err(RegistrationError::DuplicateCapability {
                    capability: capability.to_string(),
                    handler: handler_id,
                    owner: existing.handler_id.clone(),
                });
            }
        }

        let (handler_id, operations) = registration.into_parts();
        let breaker = Arc::new(CircuitBreaker::new(handler_id.clone(), self.breaker_config));
        let capabilities: Vec<String> = operations.keys().cloned().collect();
        for (capability, operation) in operations {
            let operation_name = operation_name(&capability);
            self.routes.insert(
                capability,
                Route {
                    handler_id: handler_id.clone(),
                    operation_name,
                    operation,
                    breaker: Arc::clone(&breaker),
                },
            );
        }
        debug!(handler = %handler_id, capabilities = capabilities.len(), "registered handler");
        self.handlers.insert(handler_id, HandlerEntry { capabilities, breaker });
        Ok(())
    }

    /// Handler id and operation name bound to `capability`.
    pub fn route(&self, capability: &str) -> Option<(&str, &str)> {
        self.routes
            .get(capability)
            .map(|route| (route.handler_id.as_str(), route.operation_name.as_str()))
    }

    pub fn is_registered(&self, capability: &str) -> bool {
        self.routes.contains_key(capability)
    }

    pub fn handlers(&self) -> Vec<HandlerSnapshot> {
        self.handlers
            .iter()
            .map(|(handler_id, entry)| HandlerSnapshot {
                handler_id: handler_id.clone(),
                capabilities: entry.capabilities.clone(),
                breaker: entry.breaker.snapshot(),
            })
            .collect()
    }

    /// Closes a handler's breaker. Returns false for unknown handlers.
    pub fn reset_breaker(&self, handler_id: &str) -> bool {
        match self.handlers.get(handler_id) {
            Some(entry) => {
                entry.breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Routes one capability call through the owning handler's breaker.
    pub async fn dispatch(
        &self,
        capability: &str,
        context: Arc<RequestContext>,
        state: StateView,
        args: IndexMap<String, Value>,
    ) -> Result<Dispatched, EngineError> {
        let route = self
            .routes
            .get(capability)
            .ok_or_else(|| EngineError::capability_not_registered(capability))?;

        let permit = route.breaker.acquire().map_err(|rejection| {
            debug!(capability = %capability, handler = %route.handler_id, "circuit open; call short-circuited");
            EngineError::HandlerUnavailable {
                handler: route.handler_id.clone(),
                capability: capability.to_string(),
                retry_after: rejection.retry_after,
                last_failure: rejection.last_failure,
            }
        })?;

        let call = CapabilityCall {
            capability: capability.to_string(),
            operation: route.operation_name.clone(),
            context,
            state,
            args,
        };
        debug!(capability = %capability, handler = %route.handler_id, operation = %route.operation_name, "dispatching capability");

        match route.operation.invoke(call).await {
            Ok(mut result) => {
                permit.success();
                if result.metadata.source.trim().is_empty() {
                    result.metadata.source = route.handler_id.clone();
                }
                Ok(Dispatched {
                    result,
                    handler_id: route.handler_id.clone(),
                    operation: route.operation_name.clone(),
                })
            }
            Err(failure) => {
                if failure.kind.counts_against_handler() {
                    permit.failure(&failure.to_string());
                } else {
                    permit.release();
                }
                warn!(
                    capability = %capability,
                    handler = %route.handler_id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "capability failed"
                );
                Err(EngineError::CapabilityExecutionFailed {
                    capability: capability.to_string(),
                    handler: route.handler_id.clone(),
                    operation: route.operation_name.clone(),
                    failure,
                })
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Handler-side operation name for a capability: `metrics.compute_twr` becomes `metrics_compute_twr`.
pub fn operation_name(capability: &str) -> String {
    capability.replace('.', "_")
}
