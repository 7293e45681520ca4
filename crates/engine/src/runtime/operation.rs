//! The handler-side contract: what an operation receives and how it fails.

use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use indexmap::IndexMap;
use meridian_types::{CapabilityResult, Value};
use thiserror::Error;

use crate::{context::RequestContext, state::StateView};

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The caller sent arguments the operation cannot use. Does not count against the handler's breaker.
    InvalidArguments,
    /// A dependency of the handler (provider, database) failed.
    Upstream,
    /// The handler gave up waiting on a dependency.
    Timeout,
    /// Unexpected fault inside the handler.
    Internal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Upstream | FailureKind::Timeout)
    }

    /// Whether this failure is evidence that the handler itself is unhealthy.
    pub fn counts_against_handler(self) -> bool {
        !matches!(self, FailureKind::InvalidArguments)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::Upstream => "upstream",
            FailureKind::Timeout => "timeout",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a capability operation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Upstream, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }
}

/// Everything an operation sees for one invocation.
///
/// The context and state are shared, read-only views; arguments are already resolved.
#[derive(Debug, Clone)]
pub struct CapabilityCall {
    pub capability: String,
    /// Handler-side operation name bound to the capability.
    pub operation: String,
    pub context: Arc<RequestContext>,
    pub state: StateView,
    pub args: IndexMap<String, Value>,
}

impl CapabilityCall {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Returns the argument or an `InvalidArguments` failure naming it.
    pub fn require_arg(&self, name: &str) -> Result<&Value, HandlerFailure> {
        match self.args.get(name) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(HandlerFailure::invalid_arguments(format!(
                "{} requires argument '{}'",
                self.capability, name
            ))),
        }
    }

    pub fn str_arg(&self, name: &str) -> Result<&str, HandlerFailure> {
        let value = self.require_arg(name)?;
        value.as_str().ok_or_else(|| {
            HandlerFailure::invalid_arguments(format!(
                "argument '{}' must be a string, found {}",
                name,
                value.type_name()
            ))
        })
    }

    pub fn f64_arg(&self, name: &str) -> Result<f64, HandlerFailure> {
        let value = self.require_arg(name)?;
        value.as_f64().ok_or_else(|| {
            HandlerFailure::invalid_arguments(format!(
                "argument '{}' must be a number, found {}",
                name,
                value.type_name()
            ))
        })
    }
}

/// One async operation bound to a capability name.
///
/// Closures of the shape `Fn(CapabilityCall) -> impl Future<Output = Result<..>>` implement
/// this trait directly, so simple handlers do not need a dedicated type.
#[async_trait]
pub trait CapabilityOperation: Send + Sync {
    async fn invoke(&self, call: CapabilityCall) -> Result<CapabilityResult, HandlerFailure>;
}

#[async_trait]
impl<F, Fut> CapabilityOperation for F
where
    F: Fn(CapabilityCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CapabilityResult, HandlerFailure>> + Send + 'static,
{
    async fn invoke(&self, call: CapabilityCall) -> Result<CapabilityResult, HandlerFailure> {
        (self)(call).await
    }
}

/// Shared, type-erased operation as stored in the routing table.
pub type SharedOperation = Arc<dyn CapabilityOperation>;
