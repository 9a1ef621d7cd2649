use serde_json::Value;
use tracing::warn;

/// Non-tensor auxiliary data of a checkpoint, in insertion order.
pub type Metadata = serde_json::Map<String, Value>;

/// A native value that may or may not have a faithful JSON form.
pub trait ToMetadata {
    /// `None` when the value cannot be represented as JSON.
    fn to_json(&self) -> Option<Value>;

    /// Deterministic text used in place of values `to_json` rejects.
    fn describe(&self) -> String;
}

impl ToMetadata for Value {
    fn to_json(&self) -> Option<Value> {
        Some(self.clone())
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// Convert `value` for storage under `key`, stringifying it when no JSON form
/// exists. The substitution is lossy and logged.
pub fn sanitize<T: ToMetadata + ?Sized>(key: &str, value: &T) -> Value {
    match value.to_json() {
        Some(json) => json,
        None => {
            let text = value.describe();
            warn!(
                key,
                fallback = %text,
                "metadata value is not JSON-serializable, storing its string form"
            );
            Value::String(text)
        }
    }
}
