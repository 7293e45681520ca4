//! Strongly typed pattern definitions.
//!
//! A pattern is the declarative description of one analytics workflow: which inputs it accepts,
//! which capabilities it calls in which order, and which bindings it returns. The models preserve
//! authoring order (via `IndexMap`) so inputs and arguments render and resolve predictably.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Value;

/// Complete, versioned pattern definition as authored in YAML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternDefinition {
    /// Canonical identifier used for lookups and in execution traces.
    pub id: String,
    /// Deployment version; numeric versions in YAML are accepted and stored as text.
    #[serde(default = "default_version", deserialize_with = "deserialize_version")]
    pub version: String,
    /// Optional descriptive copy surfaced by listing endpoints.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared inputs keyed by name, preserving author order.
    #[serde(default)]
    pub inputs: IndexMap<String, PatternInput>,
    /// Ordered list of steps executed strictly sequentially.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Binding names projected out of the final execution state.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl PatternDefinition {
    /// Cache key combining identifier and version.
    pub fn key(&self) -> PatternKey {
        PatternKey::new(&self.id, &self.version)
    }

    /// Capability names referenced by the steps, in first-use order and without duplicates.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.capability.as_str()) {
                names.push(step.capability.as_str());
            }
        }
        names
    }
}

/// Identifier plus version of a loaded pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub id: String,
    pub version: String,
}

impl PatternKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Declaration for a single pattern input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PatternInput {
    /// Whether callers must supply the value. Inputs with a default are never missing.
    #[serde(default)]
    pub required: bool,
    /// Declared primitive type checked before the run starts.
    #[serde(default, rename = "type")]
    pub r#type: InputType,
    /// Value applied when the caller omits the input.
    #[serde(default)]
    pub default: Option<Value>,
    /// Descriptive text for listings.
    #[serde(default)]
    pub description: Option<String>,
}

/// Primitive types an input can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "array")]
    List,
    #[serde(alias = "object")]
    Map,
    #[default]
    Any,
}

impl InputType {
    /// Returns true when `value` satisfies this declared type. Null never satisfies a concrete type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (InputType::Any, _)
                | (InputType::String, Value::String(_))
                | (InputType::Number, Value::Number(_))
                | (InputType::Boolean, Value::Bool(_))
                | (InputType::List, Value::List(_))
                | (InputType::Map, Value::Map(_))
        )
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::List => "list",
            InputType::Map => "map",
            InputType::Any => "any",
        };
        f.write_str(name)
    }
}

/// A single step: one capability invocation whose result is bound under `as`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepDefinition {
    /// Capability name routed to exactly one handler (for example `metrics.compute_twr`).
    #[serde(default)]
    pub capability: String,
    /// Argument template; string leaves may contain `{{inputs.*}}`, `{{state.*}}`, `{{ctx.*}}` tokens.
    #[serde(default)]
    pub args: IndexMap<String, Value>,
    /// Binding name for the capability result in the execution state.
    #[serde(default, rename = "as")]
    pub binding: String,
    /// Optional condition; the step is skipped when it evaluates falsy.
    #[serde(default)]
    pub when: Option<String>,
    /// Optional copy shown in traces and listings.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_version() -> String {
    "1".to_string()
}

fn deserialize_version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Integer(u64),
        Float(f64),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(text) => text,
        RawVersion::Integer(number) => number.to_string(),
        RawVersion::Float(number) => number.to_string(),
    })
}
