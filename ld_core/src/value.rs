use serde_json::Value;

/// Key/value map used for job execution context
pub type ContextMap = serde_json::Map<String, Value>;

/// Truthiness in the dialect job contexts are written in: `null`, `false`,
/// `0` (any numeric zero), and `""` are falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
