use std::sync::Arc;

use indexmap::IndexMap;

use super::operation::{CapabilityOperation, SharedOperation};

/// A handler's declaration: its id plus the capabilities it serves.
///
/// ```rust
/// use meridian_engine::runtime::{CapabilityCall, HandlerFailure, HandlerRegistration};
/// use meridian_types::CapabilityResult;
///
/// let registration = HandlerRegistration::new("financial_analyst").capability(
///     "metrics.compute_twr",
///     |call: CapabilityCall| async move {
///         Ok::<_, HandlerFailure>(CapabilityResult::new(0.042, format!("pricing_pack:{}", call.context.snapshot_id())))
///     },
/// );
/// assert_eq!(registration.capability_names().collect::<Vec<_>>(), vec!["metrics.compute_twr"]);
/// ```
pub struct HandlerRegistration {
    handler_id: String,
    operations: IndexMap<String, SharedOperation>,
    repeated: Vec<String>,
}

impl HandlerRegistration {
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            operations: IndexMap::new(),
            repeated: Vec::new(),
        }
    }

    /// Binds `operation` to `capability`. Declaring the same capability twice is remembered and
    /// rejected when the registration reaches the runtime.
    pub fn capability<O>(mut self, capability: impl Into<String>, operation: O) -> Self
    where
        O: CapabilityOperation + 'static,
    {
        self.insert(capability.into(), Arc::new(operation));
        self
    }

    /// Binds an already shared operation.
    pub fn shared_capability(mut self, capability: impl Into<String>, operation: SharedOperation) -> Self {
        self.insert(capability.into(), operation);
        self
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub(crate) fn repeated(&self) -> &[String] {
        &self.repeated
    }

    pub(crate) fn into_parts(self) -> (String, IndexMap<String, SharedOperation>) {
        (self.handler_id, self.operations)
    }

    fn insert(&mut self, capability: String, operation: SharedOperation) {
        if self.operations.contains_key(&capability) {
            self.repeated.push(capability);
        } else {
            self.operations.insert(capability, operation);
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("handler_id", &self.handler_id)
            .field("capabilities", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}
