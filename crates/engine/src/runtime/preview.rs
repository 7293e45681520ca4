//! Dry-run handler that echoes resolved arguments instead of computing anything.

use async_trait::async_trait;
use meridian_types::{CapabilityResult, Value};

use super::{CapabilityCall, CapabilityOperation, HandlerFailure, HandlerRegistration};

pub const PREVIEW_HANDLER_ID: &str = "preview";
pub const PREVIEW_SOURCE: &str = "preview";

/// Serves any set of capabilities by returning the resolved arguments as the result data.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewHandler;

impl PreviewHandler {
    /// Builds a registration binding every capability in `capabilities` to the echo operation.
    pub fn registration<I, S>(capabilities: I) -> HandlerRegistration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        capabilities
            .into_iter()
            .fold(HandlerRegistration::new(PREVIEW_HANDLER_ID), |registration, capability| {
                registration.capability(capability, PreviewHandler)
            })
    }
}

#[async_trait]
impl CapabilityOperation for PreviewHandler {
    async fn invoke(&self, call: CapabilityCall) -> Result<CapabilityResult, HandlerFailure> {
        Ok(CapabilityResult::new(Value::Map(call.args), PREVIEW_SOURCE).with_as_of(call.context.as_of()))
    }
}
