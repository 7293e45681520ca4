//! Tagged value model shared by pattern arguments, execution state, and capability results.
//!
//! Pattern authors write arguments as free-form YAML/JSON, handlers return nested payloads, and
//! the template resolver walks both. Keeping a single closed set of variants lets callers tell a
//! missing key apart from a value of the wrong shape without inspecting raw JSON.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A dynamically shaped value flowing through pattern execution.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent or explicit null.
    #[default]
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Numeric value; integers are stored as `f64` and rendered without a fractional part.
    Number(f64),
    /// UTF-8 text.
    String(String),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Key/value mapping preserving authoring order.
    Map(IndexMap<String, Value>),
}

/// Reason a dotted path could not be followed through a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("key '{segment}' is missing")]
    MissingKey { segment: String },

    #[error("index {segment} is out of bounds for a list of length {len}")]
    IndexOutOfBounds { segment: String, len: usize },

    #[error("segment '{segment}' is not a valid list index")]
    InvalidIndex { segment: String },

    #[error("cannot read '{segment}' from a {found} value")]
    NotAContainer { segment: String, found: &'static str },
}

impl Value {
    /// Builds a map value from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(entries.into_iter().map(|(key, value)| (key.into(), value.into())).collect())
    }

    /// Returns the lowercase name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Truthiness used by step conditions.
    ///
    /// Null, `false`, zero, and empty strings, lists, and maps are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(flag) => *flag,
            Value::Number(number) => *number != 0.0 && !number.is_nan(),
            Value::String(text) => !text.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }

    /// Follows `path` through nested maps and lists.
    ///
    /// List segments must be base-10 indices. An empty path returns `self`.
    pub fn lookup<S: AsRef<str>>(&self, path: &[S]) -> Result<&Value, PathError> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = match current {
                Value::Map(map) => map.get(segment).ok_or_else(|| PathError::MissingKey {
                    segment: segment.to_string(),
                })?,
                Value::List(items) => {
                    let index = segment.parse::<usize>().map_err(|_| PathError::InvalidIndex {
                        segment: segment.to_string(),
                    })?;
                    items.get(index).ok_or_else(|| PathError::IndexOutOfBounds {
                        segment: segment.to_string(),
                        len: items.len(),
                    })?
                }
                other => {
                    return Err(PathError::NotAContainer {
                        segment: segment.to_string(),
                        found: other.type_name(),
                    });
                }
            };
        }
        Ok(current)
    }

    /// Renders the value the way it appears when spliced into surrounding text.
    ///
    /// Strings are emitted verbatim, null becomes an empty string, integral numbers drop the
    /// fractional part, and containers are rendered as compact JSON.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(flag) => flag.to_string(),
            Value::Number(number) => render_number(*number),
            Value::String(text) => text.clone(),
            Value::List(_) | Value::Map(_) => serde_json::Value::from(self.clone()).to_string(),
        }
    }
}

/// Splits `positions[0].symbol` or `positions.0.symbol` into `["positions", "0", "symbol"]`.
pub fn parse_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut characters = path.chars().peekable();

    while let Some(character) = characters.next() {
        match character {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                for next_character in characters.by_ref() {
                    if next_character == ']' {
                        break;
                    }
                    inner.push(next_character);
                }
                let inner = inner.trim();
                if !inner.is_empty() {
                    segments.push(inner.to_string());
                }
            }
            _ => current.push(character),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn render_number(number: f64) -> String {
    if is_integral(number) {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

fn is_integral(number: f64) -> bool {
    number.is_finite() && number.fract() == 0.0 && number.abs() < 9.0e15
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(flag) => serializer.serialize_bool(*flag),
            Value::Number(number) if is_integral(*number) => serializer.serialize_i64(*number as i64),
            Value::Number(number) => serializer.serialize_f64(*number),
            Value::String(text) => serializer.serialize_str(text),
            Value::List(items) => serializer.collect_seq(items),
            Value::Map(map) => serializer.collect_map(map),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(flag) => Value::Bool(flag),
            serde_json::Value::Number(number) => number.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(text) => Value::String(text),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => Value::Map(map.into_iter().map(|(key, value)| (key, Value::from(value))).collect()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(flag) => serde_json::Value::Bool(flag),
            Value::Number(number) if is_integral(number) => serde_json::Value::from(number as i64),
            Value::Number(number) => serde_json::Number::from_f64(number)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(text) => serde_json::Value::String(text),
            Value::List(items) => serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect()),
            Value::Map(map) => serde_json::Value::Object(map.into_iter().map(|(key, value)| (key, serde_json::Value::from(value))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(value: IndexMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn portfolio() -> Value {
        Value::from(json!({
            "portfolio_id": "pf-1",
            "positions": [
                {"symbol": "AAPL", "qty": 10},
                {"symbol": "MSFT", "qty": 4.5}
            ]
        }))
    }

    #[test]
    fn lookup_follows_maps_and_list_indices() {
        let value = portfolio();
        let symbol = value.lookup(&["positions", "1", "symbol"]).expect("symbol");
        assert_eq!(symbol, &Value::from("MSFT"));
    }

    #[test]
    fn lookup_distinguishes_missing_from_wrong_shape() {
        let value = portfolio();
        assert!(matches!(value.lookup(&["benchmark"]), Err(PathError::MissingKey { .. })));
        assert!(matches!(
            value.lookup(&["portfolio_id", "name"]),
            Err(PathError::NotAContainer { found: "string", .. })
        ));
        assert!(matches!(
            value.lookup(&["positions", "7"]),
            Err(PathError::IndexOutOfBounds { len: 2, .. })
        ));
        assert!(matches!(value.lookup(&["positions", "first"]), Err(PathError::InvalidIndex { .. })));
    }

    #[test]
    fn parse_path_accepts_bracket_and_dot_indices() {
        assert_eq!(parse_path("positions[0].symbol"), vec!["positions", "0", "symbol"]);
        assert_eq!(parse_path("positions.0.symbol"), vec!["positions", "0", "symbol"]);
        assert_eq!(parse_path("a..b"), vec!["a", "b"]);
    }

    #[test]
    fn render_drops_fraction_for_integral_numbers() {
        assert_eq!(Value::from(10).render(), "10");
        assert_eq!(Value::from(4.5).render(), "4.5");
        assert_eq!(Value::Null.render(), "");
        assert_eq!(Value::from(vec![Value::from(1), Value::from("x")]).render(), r#"[1,"x"]"#);
    }

    #[test]
    fn truthiness_matches_condition_semantics() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::from("no").is_truthy());
        assert!(Value::from(-1).is_truthy());
    }

    #[test]
    fn deserializes_from_yaml_and_serializes_integers_compactly() {
        let parsed: Value = serde_yaml::from_str("qty: 3\nweight: 0.25\nactive: true\nnote: ~\n").expect("yaml value");
        let map = parsed.as_map().expect("map");
        assert_eq!(map["qty"], Value::Number(3.0));
        assert_eq!(map["note"], Value::Null);

        let rendered = serde_json::to_string(&parsed).expect("serialize");
        assert_eq!(rendered, r#"{"qty":3,"weight":0.25,"active":true,"note":null}"#);
    }
}
