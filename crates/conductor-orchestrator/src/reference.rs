//! Reference expressions used to wire data between steps.
//!
//! Pipelines understand `$var[.path]`, `@stepId[.path]` and `input.<path>`;
//! any other value is a literal. Step `outputs` paths are `.` (the whole
//! result) or `.field.nested`.
//!
//! Chains understand `input[.path]`, `<stepId>.result` (objects and arrays
//! rendered as JSON text), `<stepId>.result.<path>`, the `<stepId>.<path>`
//! shorthand, a bare `<stepId>` and `.` (the most recently recorded result,
//! unmodified).

use crate::context::ExecutionContext;
use serde_json::{Map, Value};
use tracing::warn;

/// Walk a dotted path into `value`. Empty segments are skipped, so `""`, `"."`
/// and `".a"` are all valid. Array elements are addressed by index.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Extract the value a step `outputs` path points at.
pub fn extract_output(result: &Value, path: &str) -> Option<Value> {
    lookup_path(result, path).cloned()
}

// --- Pipeline references ---

/// Resolve one pipeline reference. Non-string values and strings without a
/// reference prefix are returned as literals; unresolvable references are `null`.
pub fn resolve_pipeline_reference(reference: &Value, context: &ExecutionContext) -> Value {
    let Value::String(text) = reference else {
        return reference.clone();
    };

    if let Some(rest) = text.strip_prefix('$') {
        let (name, path) = split_head(rest);
        return context
            .variable(name)
            .and_then(|v| lookup_path(v, path))
            .cloned()
            .unwrap_or(Value::Null);
    }

    if let Some(rest) = text.strip_prefix('@') {
        let (step_id, path) = split_head(rest);
        return context
            .step_result(step_id)
            .and_then(|r| lookup_path(&r.result, path))
            .cloned()
            .unwrap_or(Value::Null);
    }

    if let Some(path) = text.strip_prefix("input.") {
        return lookup_path(&context.input, path)
            .cloned()
            .unwrap_or(Value::Null);
    }

    reference.clone()
}

/// Resolve every entry of a step's `inputs` map.
pub fn resolve_inputs(inputs: &Map<String, Value>, context: &ExecutionContext) -> Map<String, Value> {
    inputs
        .iter()
        .map(|(name, reference)| (name.clone(), resolve_pipeline_reference(reference, context)))
        .collect()
}

fn split_head(text: &str) -> (&str, &str) {
    text.split_once('.').unwrap_or((text, ""))
}

// --- Chain references ---

/// Resolve one chain reference, or `None` when it points at nothing.
pub fn resolve_chain_reference(reference: &str, context: &ExecutionContext) -> Option<Value> {
    let reference = reference.trim();

    if reference == "." {
        return context.step_results.last().map(|r| r.result.clone());
    }

    if reference == "input" {
        return Some(context.input.clone());
    }
    if let Some(path) = reference.strip_prefix("input.") {
        return lookup_path(&context.input, path).cloned();
    }

    let (step_id, rest) = match reference.split_once('.') {
        Some((id, rest)) => (id, Some(rest)),
        None => (reference, None),
    };
    let result = &context.step_result(step_id)?.result;

    match rest {
        None => Some(result.clone()),
        Some("result") => Some(match result {
            Value::Object(_) | Value::Array(_) => Value::String(result.to_string()),
            other => other.clone(),
        }),
        Some(rest) => {
            let path = rest.strip_prefix("result.").unwrap_or(rest);
            lookup_path(result, path).cloned()
        }
    }
}

/// Resolve a mapping of name -> chain reference, skipping (and logging)
/// entries that do not resolve.
pub fn resolve_chain_mapping<'a, I>(mapping: I, context: &ExecutionContext) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut resolved = Map::new();
    for (name, reference) in mapping {
        match resolve_chain_reference(reference, context) {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => {
                warn!(name = %name, reference = %reference, "Unresolved chain reference");
            }
        }
    }
    resolved
}
