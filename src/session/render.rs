//! Depth-limited rendering of result items.
//!
//! Every item goes on the wire as compact JSON. Containers nested deeper
//! than the request's depth are collapsed to a placeholder string, so a
//! huge or self-similar structure can't blow up a response.
//!
//! ```text
//! depth 0: {"a":{"b":1}}  ->  {"a":"{...}"}
//! depth 1: {"a":{"b":1}}  ->  {"a":{"b":1}}
//! ```

use serde_json::{Map, Value};

/// Placeholder for a collapsed object.
pub const COLLAPSED_OBJECT: &str = "{...}";

/// Placeholder for a collapsed array.
pub const COLLAPSED_ARRAY: &str = "[...]";

/// Render one item as compact JSON text.
///
/// The root sits at level 0. A container at level `L` is expanded while
/// `L <= depth`; scalars are always rendered in full.
pub fn render_item(item: &Value, depth: usize) -> String {
    limit(item, 0, depth).to_string()
}

fn limit(value: &Value, level: usize, depth: usize) -> Value {
    match value {
        Value::Object(_) if level > depth => Value::String(COLLAPSED_OBJECT.to_string()),
        Value::Array(_) if level > depth => Value::String(COLLAPSED_ARRAY.to_string()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), limit(v, level + 1, depth)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| limit(v, level + 1, depth)).collect())
        }
        scalar => scalar.clone(),
    }
}
