//! Structural checks applied to every definition before it is cached.

use std::collections::HashSet;

use meridian_types::{PatternDefinition, Value};

use crate::{
    condition::validate_condition,
    resolve::{NAMESPACES, template_references},
};

/// Returns every problem found in `definition`; an empty list means it may be cached.
///
/// Checks: non-empty id and step list, each step names a capability and an `as` binding, no
/// binding shadows a declared input, `when` expressions parse, argument templates use a known
/// namespace, and each declared output is produced by a step or is a declared input. Two steps
/// binding the same name is allowed; the later binding wins at run time.
pub fn validate_pattern(definition: &PatternDefinition) -> Vec<String> {
    let mut violations = Vec::new();

    if definition.id.trim().is_empty() {
        violations.push("pattern id cannot be empty".to_string());
    }
    if definition.steps.is_empty() {
        violations.push("pattern must declare at least one step".to_string());
    }

    let mut bound: HashSet<&str> = HashSet::new();
    for (index, step) in definition.steps.iter().enumerate() {
        if step.capability.trim().is_empty() {
            violations.push(format!("step {index} is missing a capability name"));
        }
        if step.binding.trim().is_empty() {
            violations.push(format!("step {index} is missing an 'as' binding"));
        } else if definition.inputs.contains_key(&step.binding) {
            violations.push(format!(
                "step {index} binds '{}' which collides with a declared input",
                step.binding
            ));
        } else {
            bound.insert(step.binding.as_str());
        }
        if let Some(condition) = &step.when
            && let Err(error) = validate_condition(condition)
        {
            violations.push(format!("step {index} has an invalid 'when' expression: {error}"));
        }
        for (name, value) in &step.args {
            collect_reference_violations(value, &format!("step {index} argument '{name}'"), &mut violations);
        }
    }

    for output in &definition.outputs {
        if !bound.contains(output.as_str()) && !definition.inputs.contains_key(output) {
            violations.push(format!("output '{output}' is not bound by any step or declared as an input"));
        }
    }

    violations
}

fn collect_reference_violations(value: &Value, location: &str, violations: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for reference in template_references(text) {
                let namespace = reference.split(['.', '[']).next().unwrap_or_default();
                if !NAMESPACES.contains(&namespace) {
                    violations.push(format!(
                        "{location} references '{reference}'; expected a path under inputs, state, or ctx"
                    ));
                }
            }
        }
        Value::List(items) => {
            for item in items {
                collect_reference_violations(item, location, violations);
            }
        }
        Value::Map(entries) => {
            for item in entries.values() {
                collect_reference_violations(item, location, violations);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml_text: &str) -> PatternDefinition {
        serde_yaml::from_str(yaml_text).expect("pattern yaml")
    }

    #[test]
    fn well_formed_pattern_has_no_violations() {
        let definition = parse(
            r#"
id: portfolio_overview
inputs:
  portfolio_id: { required: true, type: string }
steps:
  - capability: ledger.positions
    args: { portfolio_id: "{{inputs.portfolio_id}}" }
    as: positions
  - capability: metrics.compute_twr
    args: { positions: "{{state.positions}}", pack: "{{ctx.snapshot_id}}" }
    as: twr
    when: "state.positions"
  - capability: metrics.compute_twr
    as: twr
outputs: [portfolio_id, positions, twr]
"#,
        );
        assert!(validate_pattern(&definition).is_empty());
    }

    #[test]
    fn reports_each_structural_problem() {
        let definition = parse(
            r#"
id: broken
inputs:
  portfolio_id: { required: true }
steps:
  - capability: ""
    as: positions
  - capability: ledger.positions
  - capability: ledger.positions
    as: portfolio_id
  - capability: pricing.get
    args: { home: "{{env.HOME}}" }
    as: prices
    when: "inputs.portfolio_id > 3"
outputs: [missing]
"#,
        );
        let violations = validate_pattern(&definition);
        let joined = violations.join("\n");

        assert!(joined.contains("step 0 is missing a capability name"), "{joined}");
        assert!(joined.contains("step 1 is missing an 'as' binding"), "{joined}");
        assert!(joined.contains("collides with a declared input"), "{joined}");
        assert!(joined.contains("invalid 'when' expression"), "{joined}");
        assert!(joined.contains("references 'env.HOME'"), "{joined}");
        assert!(joined.contains("output 'missing'"), "{joined}");
        assert_eq!(violations.len(), 6);
    }

    #[test]
    fn empty_step_list_is_rejected() {
        let definition = parse("id: empty\nsteps: []\n");
        assert_eq!(validate_pattern(&definition), vec!["pattern must declare at least one step".to_string()]);
    }
}
