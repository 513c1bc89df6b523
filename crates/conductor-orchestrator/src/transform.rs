use serde_json::Value;
use tracing::debug;

/// Apply the named transform to `value`. Unknown names pass the value through.
pub fn apply_transform(name: &str, value: Value) -> Result<Value, String> {
    match name {
        "uppercase" => Ok(Value::String(as_text(&value).to_uppercase())),
        "lowercase" => Ok(Value::String(as_text(&value).to_lowercase())),
        "json_parse" => match value {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|e| format!("json_parse failed: {e}")),
            other => Ok(other),
        },
        "json_stringify" => Ok(Value::String(value.to_string())),
        "number" => Ok(to_number(&value)),
        "string" => Ok(Value::String(as_text(&value))),
        unknown => {
            debug!(transform = %unknown, "Unknown transform, passing value through");
            Ok(value)
        }
    }
}

/// Strings verbatim, `null` as the empty string, anything else as JSON text.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Numeric conversion; anything that is not a number yields `null`.
fn to_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::Bool(b) => Value::from(u8::from(*b)),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Value::from(int)
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map_or(Value::Null, Value::Number)
            }
        }
        _ => Value::Null,
    }
}
