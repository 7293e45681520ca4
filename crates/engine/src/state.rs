//! Immutable execution state shared with each step.

use std::sync::Arc;

use indexmap::IndexMap;
use meridian_types::{PathError, Value};

/// Read-only snapshot of the bindings accumulated by a run.
///
/// Cloning is cheap. [`StateView::with_binding`] produces the next snapshot; a handler holding an
/// earlier view never observes later bindings. The map is copied only while another view shares it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateView {
    bindings: Arc<IndexMap<String, Value>>,
}

impl StateView {
    pub fn new(bindings: IndexMap<String, Value>) -> Self {
        Self {
            bindings: Arc::new(bindings),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    /// Returns the next snapshot with `name` bound to `value`. A later binding replaces an earlier one.
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> StateView {
        Arc::make_mut(&mut self.bindings).insert(name.into(), value);
        self
    }

    /// Follows `path`, whose first segment names a binding.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Result<&Value, PathError> {
        let Some((first, rest)) = path.split_first() else {
            return Err(PathError::MissingKey { segment: String::new() });
        };
        let binding = self.bindings.get(first.as_ref()).ok_or_else(|| PathError::MissingKey {
            segment: first.as_ref().to_string(),
        })?;
        binding.lookup(rest)
    }

    /// Picks `names` out of the state in the given order; unbound names project as null.
    pub fn project(&self, names: &[String]) -> IndexMap<String, Value> {
        names
            .iter()
            .map(|name| (name.clone(), self.bindings.get(name).cloned().unwrap_or_default()))
            .collect()
    }
}
