//! # Template Resolution
//!
//! Step arguments are [`Value`] trees whose string leaves may reference the run's data through
//! `{{ ... }}` tokens rooted in one of three namespaces:
//!
//! - `{{inputs.portfolio_id}}` - a caller-supplied input (after defaults are applied)
//! - `{{state.positions.0.symbol}}` - a binding produced by an earlier step
//! - `{{ctx.snapshot_id}}` - a field of the request context
//!
//! A leaf that is exactly one token resolves to the referenced value with its type intact. Tokens
//! embedded in surrounding text are rendered as strings and spliced in. Any reference that cannot
//! be followed is an error; the caller never sees partially resolved arguments.
//!
//! ```rust
//! use indexmap::IndexMap;
//! use meridian_engine::{resolve::{ResolutionScope, resolve_args}, state::StateView};
//! use meridian_types::Value;
//!
//! let inputs = IndexMap::from([("portfolio_id".to_string(), Value::from("P-1"))]);
//! let state = StateView::default();
//! let ctx = Value::map([("snapshot_id", "PP_2024-06-28")]);
//! let scope = ResolutionScope::new(&inputs, &state, &ctx);
//!
//! let args = IndexMap::from([
//!     ("portfolio_id".to_string(), Value::from("{{inputs.portfolio_id}}")),
//!     ("label".to_string(), Value::from("pack {{ ctx.snapshot_id }}")),
//! ]);
//! let resolved = resolve_args(&args, &scope).unwrap();
//! assert_eq!(resolved["portfolio_id"], Value::from("P-1"));
//! assert_eq!(resolved["label"], Value::from("pack PP_2024-06-28"));
//! ```

use indexmap::IndexMap;
use meridian_types::{PathError, Value, parse_path};
use thiserror::Error;

use crate::{error::EngineError, state::StateView};

const TOKEN_OPEN: &str = "{{";
const TOKEN_CLOSE: &str = "}}";

/// Namespaces a reference may be rooted in.
pub const NAMESPACES: [&str; 3] = ["inputs", "state", "ctx"];

/// Why a reference could not be followed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("unknown namespace '{0}'; expected inputs, state, or ctx")]
    UnknownNamespace(String),

    #[error("reference must name a key under '{0}'")]
    MissingKey(String),

    #[error("reference is empty")]
    Empty,

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Read-only view of everything a step may reference.
#[derive(Debug, Clone, Copy)]
pub struct ResolutionScope<'a> {
    pub inputs: &'a IndexMap<String, Value>,
    pub state: &'a StateView,
    pub ctx: &'a Value,
}

impl<'a> ResolutionScope<'a> {
    pub fn new(inputs: &'a IndexMap<String, Value>, state: &'a StateView, ctx: &'a Value) -> Self {
        Self { inputs, state, ctx }
    }

    /// Follows a dotted reference such as `state.positions[0].symbol`.
    pub fn lookup(&self, reference: &str) -> Result<&'a Value, ScopeError> {
        let segments = parse_path(reference.trim());
        let Some((namespace, path)) = segments.split_first() else {
            return Err(ScopeError::Empty);
        };
        if path.is_empty() {
            return match namespace.as_str() {
                "inputs" | "state" | "ctx" => Err(ScopeError::MissingKey(namespace.clone())),
                other => Err(ScopeError::UnknownNamespace(other.to_string())),
            };
        }

        match namespace.as_str() {
            "inputs" => {
                let (first, rest) = (&path[0], &path[1..]);
                let value = self
                    .inputs
                    .get(first)
                    .ok_or_else(|| PathError::MissingKey { segment: first.clone() })?;
                Ok(value.lookup(rest)?)
            }
            "state" => Ok(self.state.lookup(path)?),
            "ctx" => Ok(self.ctx.lookup(path)?),
            other => Err(ScopeError::UnknownNamespace(other.to_string())),
        }
    }
}

/// Resolves every argument of a step. Map keys are never treated as templates.
pub fn resolve_args(args: &IndexMap<String, Value>, scope: &ResolutionScope<'_>) -> Result<IndexMap<String, Value>, EngineError> {
    args.iter()
        .map(|(name, value)| Ok((name.clone(), resolve_value(value, scope, name)?)))
        .collect()
}

/// Resolves a value tree. `path` names the position of `value` for error reporting.
pub fn resolve_value(value: &Value, scope: &ResolutionScope<'_>, path: &str) -> Result<Value, EngineError> {
    match value {
        Value::String(text) => resolve_string(text, scope, path),
        Value::List(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| resolve_value(item, scope, &format!("{path}[{index}]")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Value::Map(entries) => entries
            .iter()
            .map(|(key, item)| Ok((key.clone(), resolve_value(item, scope, &format!("{path}.{key}"))?)))
            .collect::<Result<IndexMap<_, _>, EngineError>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}

/// True when any string leaf of `value` contains a reference token.
pub fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(text) => !template_references(text).is_empty(),
        Value::List(items) => items.iter().any(contains_reference),
        Value::Map(entries) => entries.values().any(contains_reference),
        _ => false,
    }
}

/// Every `{{ ... }}` expression in `text`, trimmed, in order of appearance.
pub fn template_references(text: &str) -> Vec<&str> {
    let mut references = Vec::new();
    let mut remaining = text;
    while let Some(start) = remaining.find(TOKEN_OPEN) {
        let after_open = &remaining[start + TOKEN_OPEN.len()..];
        let Some(end) = after_open.find(TOKEN_CLOSE) else {
            break;
        };
        references.push(after_open[..end].trim());
        remaining = &after_open[end + TOKEN_CLOSE.len()..];
    }
    references
}

fn resolve_string(text: &str, scope: &ResolutionScope<'_>, path: &str) -> Result<Value, EngineError> {
    if let Some(expression) = whole_token(text) {
        return lookup_expression(expression, scope, path).cloned();
    }

    let mut output = String::new();
    let mut remaining = text;
    let mut substituted = false;
    while let Some(start) = remaining.find(TOKEN_OPEN) {
        let (before, from_open) = remaining.split_at(start);
        let after_open = &from_open[TOKEN_OPEN.len()..];
        let Some(end) = after_open.find(TOKEN_CLOSE) else {
            // Unterminated token: keep the remaining text as written.
            break;
        };
        output.push_str(before);
        let expression = after_open[..end].trim();
        output.push_str(&lookup_expression(expression, scope, path)?.render());
        remaining = &after_open[end + TOKEN_CLOSE.len()..];
        substituted = true;
    }

    if !substituted {
        return Ok(Value::String(text.to_string()));
    }
    output.push_str(remaining);
    Ok(Value::String(output))
}

/// The inner expression when `text` is exactly one token (surrounding whitespace allowed).
fn whole_token(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix(TOKEN_OPEN)?.strip_suffix(TOKEN_CLOSE)?;
    if inner.contains(TOKEN_OPEN) || inner.contains(TOKEN_CLOSE) {
        return None;
    }
    Some(inner.trim())
}

fn lookup_expression<'a>(expression: &str, scope: &ResolutionScope<'a>, path: &str) -> Result<&'a Value, EngineError> {
    scope
        .lookup(expression)
        .map_err(|error| EngineError::template_unresolved(path, expression, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        inputs: IndexMap<String, Value>,
        state: StateView,
        ctx: Value,
    }

    impl Fixture {
        fn new() -> Self {
            let positions = Value::List(vec![
                Value::map([("symbol", Value::from("AAPL")), ("quantity", Value::from(10))]),
                Value::map([("symbol", Value::from("MSFT")), ("quantity", Value::from(4))]),
            ]);
            Self {
                inputs: IndexMap::from([
                    ("portfolio_id".to_string(), Value::from("P-1")),
                    ("lookback_days".to_string(), Value::from(252)),
                ]),
                state: StateView::default().with_binding("positions", positions),
                ctx: Value::map([("snapshot_id", "PP_2024-06-28"), ("ledger_id", "LEDGER_abc123")]),
            }
        }

        fn scope(&self) -> ResolutionScope<'_> {
            ResolutionScope::new(&self.inputs, &self.state, &self.ctx)
        }
    }

    #[test]
    fn whole_token_keeps_value_type() {
        let fixture = Fixture::new();
        let scope = fixture.scope();

        assert_eq!(
            resolve_value(&Value::from("{{inputs.lookback_days}}"), &scope, "days").expect("number"),
            Value::from(252)
        );
        assert_eq!(
            resolve_value(&Value::from("{{ state.positions.1.symbol }}"), &scope, "symbol").expect("symbol"),
            Value::from("MSFT")
        );
        assert_eq!(
            resolve_value(&Value::from("{{state.positions[0].quantity}}"), &scope, "qty").expect("bracket index"),
            Value::from(10)
        );
        let positions = resolve_value(&Value::from("{{state.positions}}"), &scope, "positions").expect("list");
        assert_eq!(positions.as_list().map(<[Value]>::len), Some(2));
    }

    #[test]
    fn embedded_tokens_are_interpolated() {
        let fixture = Fixture::new();
        let resolved = resolve_value(
            &Value::from("{{inputs.portfolio_id}} @ {{ctx.snapshot_id}} ({{inputs.lookback_days}}d)"),
            &fixture.scope(),
            "label",
        )
        .expect("interpolated");
        assert_eq!(resolved, Value::from("P-1 @ PP_2024-06-28 (252d)"));
    }

    #[test]
    fn nested_structures_resolve_and_keys_stay_literal() {
        let fixture = Fixture::new();
        let args = IndexMap::from([(
            "request".to_string(),
            Value::map([
                ("{{inputs.portfolio_id}}", Value::from("{{ctx.ledger_id}}")),
                ("symbols", Value::List(vec![Value::from("{{state.positions.0.symbol}}"), Value::from(true)])),
            ]),
        )]);

        let resolved = resolve_args(&args, &fixture.scope()).expect("resolved");
        let request = resolved["request"].as_map().expect("map");
        assert_eq!(request["{{inputs.portfolio_id}}"], Value::from("LEDGER_abc123"));
        assert_eq!(
            request["symbols"],
            Value::List(vec![Value::from("AAPL"), Value::from(true)])
        );
    }

    #[test]
    fn missing_state_binding_names_argument_and_expression() {
        let fixture = Fixture::new();
        let args = IndexMap::from([(
            "filters".to_string(),
            Value::map([("benchmarks", Value::List(vec![Value::from("{{state.benchmarks}}")]))]),
        )]);

        let error = resolve_args(&args, &fixture.scope()).expect_err("unresolved");
        match error {
            EngineError::TemplateUnresolved { path, expression, reason } => {
                assert_eq!(path, "filters.benchmarks[0]");
                assert_eq!(expression, "state.benchmarks");
                assert!(reason.contains("benchmarks"), "reason: {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_namespace_and_non_container_traversal_fail() {
        let fixture = Fixture::new();
        let scope = fixture.scope();

        let unknown = resolve_value(&Value::from("{{env.HOME}}"), &scope, "home").expect_err("namespace");
        assert!(unknown.to_string().contains("unknown namespace 'env'"));

        let traversal = resolve_value(&Value::from("{{inputs.portfolio_id.name}}"), &scope, "name").expect_err("scalar");
        assert!(matches!(traversal, EngineError::TemplateUnresolved { .. }));

        let embedded = resolve_value(&Value::from("id={{inputs.missing}}"), &scope, "id").expect_err("embedded");
        assert!(matches!(embedded, EngineError::TemplateUnresolved { ref expression, .. } if expression == "inputs.missing"));
    }

    #[test]
    fn token_free_values_pass_through_and_resolution_is_idempotent() {
        let fixture = Fixture::new();
        let scope = fixture.scope();
        let plain = Value::map([
            ("currency", Value::from("USD")),
            ("weights", Value::List(vec![Value::from(0.5), Value::Null])),
            ("unterminated", Value::from("{{inputs.portfolio_id")),
        ]);
        assert_eq!(resolve_value(&plain, &scope, "args").expect("plain"), plain);

        let templated = Value::map([("portfolio", Value::from("{{inputs.portfolio_id}}"))]);
        let once = resolve_value(&templated, &scope, "args").expect("once");
        let twice = resolve_value(&once, &scope, "args").expect("twice");
        assert_eq!(once, twice);
        assert!(!contains_reference(&once));
        assert!(contains_reference(&templated));
    }

    #[test]
    fn template_references_lists_expressions() {
        assert_eq!(
            template_references("{{ inputs.a }} and {{state.b}} then {{ unterminated"),
            vec!["inputs.a", "state.b"]
        );
    }
}
