//! Step condition (`when`) validation and evaluation.
//!
//! Supported syntax:
//!
//! - paths rooted at `inputs.`, `state.`, or `ctx.` (list indices as `.0` or `[0]`)
//! - JSON literals (`"text"`, `42`, `true`, `null`, `["a","b"]`) and single-quoted strings
//! - `==`, `!=`, `&&`, `||`, leading `!`, and `left.includes(right)`
//!
//! A bare operand is tested for truthiness: null, false, 0, "", and empty containers are falsy.
//! A path that does not resolve evaluates as null, so an optional binding can gate a step without
//! failing the run. Syntax is checked when a pattern loads; evaluation itself never fails.

use anyhow::{Result, bail};
use meridian_types::Value;

use crate::resolve::ResolutionScope;

/// Trims whitespace and strips an outer `{{ ... }}` wrapper.
pub fn normalize_condition(raw_expression: &str) -> &str {
    let trimmed = raw_expression.trim();
    match trimmed.strip_prefix("{{").and_then(|inner| inner.strip_suffix("}}")) {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

/// Validates a condition expression against the supported syntax.
pub fn validate_condition(expression: &str) -> Result<()> {
    let trimmed = normalize_condition(expression);
    if trimmed.is_empty() {
        bail!("expression cannot be empty");
    }

    if contains_operator(trimmed, "===") || contains_operator(trimmed, "!==") {
        bail!("strict equality operators are unsupported; use '==' or '!='");
    }
    if contains_operator(trimmed, ">=")
        || contains_operator(trimmed, "<=")
        || contains_operator(trimmed, ">")
        || contains_operator(trimmed, "<")
    {
        bail!("unsupported comparison operator; only '==', '!=', '&&', '||', '!' and '.includes(...)' are supported");
    }

    validate_node(trimmed)
}

/// Evaluates a condition against the current scope.
pub fn eval_condition(expression: &str, scope: &ResolutionScope<'_>) -> bool {
    eval_node(normalize_condition(expression), scope)
}

fn validate_node(expression: &str) -> Result<()> {
    if let Some(parts) = split_expression(expression, "||") {
        return parts.into_iter().try_for_each(validate_node);
    }
    if let Some(parts) = split_expression(expression, "&&") {
        return parts.into_iter().try_for_each(validate_node);
    }

    let (_, inner) = strip_leading_negations(expression);
    let inner = inner.trim();
    if inner.is_empty() {
        bail!("expression cannot end with negation operator");
    }

    if let Some((left, right)) = split_includes(inner) {
        if right.is_empty() {
            bail!("includes expression is missing an argument");
        }
        validate_operand(left)?;
        return validate_operand(right);
    }

    for operator in ["!=", "=="] {
        if let Some(position) = find_top_level_operator(inner, operator) {
            let left = inner[..position].trim();
            let right = inner[position + operator.len()..].trim();
            if left.is_empty() || right.is_empty() {
                bail!("comparison expression must include both left and right operands");
            }
            validate_operand(left)?;
            return validate_operand(right);
        }
    }

    validate_operand(inner)
}

fn validate_operand(expression: &str) -> Result<()> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        bail!("operand cannot be empty");
    }
    if parse_literal(trimmed).is_some() {
        return Ok(());
    }
    if !is_supported_path(trimmed) {
        bail!("unsupported expression '{}'; supported roots are inputs.*, state.*, and ctx.*", trimmed);
    }
    Ok(())
}

fn eval_node(expression: &str, scope: &ResolutionScope<'_>) -> bool {
    if let Some(parts) = split_expression(expression, "||") {
        return parts.into_iter().any(|part| eval_node(part, scope));
    }
    if let Some(parts) = split_expression(expression, "&&") {
        return parts.into_iter().all(|part| eval_node(part, scope));
    }

    let (negations, inner) = strip_leading_negations(expression);
    let result = eval_term(inner.trim(), scope);
    if negations % 2 == 1 { !result } else { result }
}

fn eval_term(expression: &str, scope: &ResolutionScope<'_>) -> bool {
    if let Some((left, right)) = split_includes(expression) {
        let haystack = resolve_operand(left, scope);
        let needle = resolve_operand(right, scope);
        return match (&haystack, &needle) {
            (Value::List(items), _) => items.iter().any(|item| loosely_equal(item, &needle)),
            (Value::String(text), Value::String(fragment)) => text.contains(fragment.as_str()),
            _ => false,
        };
    }
    if let Some(position) = find_top_level_operator(expression, "!=") {
        let left = resolve_operand(&expression[..position], scope);
        let right = resolve_operand(&expression[position + 2..], scope);
        return !loosely_equal(&left, &right);
    }
    if let Some(position) = find_top_level_operator(expression, "==") {
        let left = resolve_operand(&expression[..position], scope);
        let right = resolve_operand(&expression[position + 2..], scope);
        return loosely_equal(&left, &right);
    }
    resolve_operand(expression, scope).is_truthy()
}

/// Literal or resolved path value; unresolved paths become null.
fn resolve_operand(expression: &str, scope: &ResolutionScope<'_>) -> Value {
    let trimmed = expression.trim();
    if let Some(literal) = parse_literal(trimmed) {
        return literal;
    }
    scope.lookup(trimmed).cloned().unwrap_or(Value::Null)
}

/// Values are equal when they match exactly, or when both are scalars with the same rendering
/// (`"252" == 252`).
fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    let scalar = |value: &Value| matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_));
    scalar(left) && scalar(right) && left.render() == right.render()
}

fn parse_literal(expression: &str) -> Option<Value> {
    if expression.len() >= 2 && expression.starts_with('\'') && expression.ends_with('\'') {
        return Some(Value::from(&expression[1..expression.len() - 1]));
    }
    if !looks_like_json_literal(expression) {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(expression).ok().map(Value::from)
}

fn looks_like_json_literal(expression: &str) -> bool {
    let starts_like_number = expression
        .chars()
        .next()
        .map(|character| character == '-' || character.is_ascii_digit())
        .unwrap_or(false);
    expression.starts_with('[')
        || expression.starts_with('{')
        || expression.starts_with('"')
        || expression == "null"
        || expression == "true"
        || expression == "false"
        || starts_like_number
}

fn is_supported_path(expression: &str) -> bool {
    if expression.contains(char::is_whitespace) {
        return false;
    }
    let Some((namespace, rest)) = expression.split_once('.') else {
        return false;
    };
    matches!(namespace, "inputs" | "state" | "ctx") && rest.split('.').all(validate_path_segment)
}

fn validate_path_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }

    let mut chars = segment.chars().peekable();
    let mut saw_base = false;
    while let Some(character) = chars.peek().copied() {
        if character == '[' {
            break;
        }
        if !is_identifier_character(character) {
            return false;
        }
        saw_base = true;
        chars.next();
    }

    if !saw_base {
        return false;
    }

    while let Some(character) = chars.next() {
        if character != '[' {
            return false;
        }
        let mut saw_digit = false;
        loop {
            let Some(next_character) = chars.next() else {
                return false;
            };
            if next_character == ']' {
                if !saw_digit {
                    return false;
                }
                break;
            }
            if !next_character.is_ascii_digit() {
                return false;
            }
            saw_digit = true;
        }
    }

    true
}

fn is_identifier_character(character: char) -> bool {
    character.is_ascii_alphanumeric() || character == '_' || character == '-'
}

/// Splits `left.includes(right)` at the top level.
fn split_includes(expression: &str) -> Option<(&str, &str)> {
    let index = find_top_level_operator(expression, ".includes(")?;
    let (left, with_call) = expression.split_at(index);
    let right = with_call.trim_start_matches(".includes(").trim();
    let right = right.strip_suffix(')').unwrap_or(right).trim();
    Some((left.trim(), right))
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0usize;

    while start < expression.len() {
        match find_top_level_operator(&expression[start..], operator) {
            Some(relative_index) => {
                let absolute_index = start + relative_index;
                parts.push(expression[start..absolute_index].trim());
                start = absolute_index + operator.len();
            }
            None => {
                parts.push(expression[start..].trim());
                break;
            }
        }
    }

    if parts.len() > 1 { Some(parts) } else { None }
}

fn strip_leading_negations(expression: &str) -> (usize, &str) {
    let mut count = 0usize;
    let mut remainder = expression.trim_start();
    while let Some(stripped) = remainder.strip_prefix('!') {
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        remainder = stripped.trim_start();
    }
    (count, remainder)
}

fn contains_operator(expression: &str, operator: &str) -> bool {
    find_top_level_operator(expression, operator).is_some()
}

/// Byte offset of `operator` outside quotes and parentheses.
fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut depth = 0i32;

    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                continue;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                continue;
            }
            '(' | '[' if !in_single_quote && !in_double_quote => {
                depth += 1;
                continue;
            }
            ')' | ']' if !in_single_quote && !in_double_quote => {
                depth = (depth - 1).max(0);
                continue;
            }
            _ => {}
        }

        if !in_single_quote && !in_double_quote && depth == 0 && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }

    None
}
