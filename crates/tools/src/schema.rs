//! Tool argument schemas.
//!
//! Every tool's schema is its own fields merged with the common fields
//! shared by all provider-backed tools.

use {
    serde::Deserialize,
    serde_json::{Map, Value, json},
    uuid::Uuid,
};

use relay_protocol::{ErrorKind, ErrorShape};

/// Fields accepted by every provider-backed tool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommonArgs {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub thinking_mode: Option<String>,
    pub images: Vec<String>,
    pub files: Vec<String>,
    pub use_websearch: bool,
    pub continuation_id: Option<Uuid>,
    pub stream: bool,
}

impl CommonArgs {
    /// Extract the common fields, ignoring anything tool-specific.
    pub fn from_arguments(arguments: &Map<String, Value>) -> Result<Self, ErrorShape> {
        serde_json::from_value(Value::Object(arguments.clone())).map_err(|e| {
            ErrorShape::new(ErrorKind::InvalidRequest, format!("invalid arguments: {e}"))
        })
    }
}

/// JSON-Schema properties for the common fields.
fn common_properties() -> Map<String, Value> {
    let mut props = Map::new();
    props.insert(
        "model".into(),
        json!({ "type": "string", "description": "Model alias or 'auto' for routed selection" }),
    );
    props.insert(
        "temperature".into(),
        json!({ "type": "number", "minimum": 0.0, "maximum": 2.0 }),
    );
    props.insert(
        "thinking_mode".into(),
        json!({ "type": "string", "enum": ["minimal", "low", "medium", "high", "max"] }),
    );
    props.insert(
        "images".into(),
        json!({ "type": "array", "items": { "type": "string" } }),
    );
    props.insert(
        "files".into(),
        json!({ "type": "array", "items": { "type": "string" } }),
    );
    props.insert("use_websearch".into(), json!({ "type": "boolean" }));
    props.insert(
        "continuation_id".into(),
        json!({ "type": "string", "format": "uuid" }),
    );
    props.insert("stream".into(), json!({ "type": "boolean" }));
    props
}

/// Build a tool schema from tool-specific properties plus the common set.
/// Tool-specific fields win on name collision.
#[must_use]
pub fn tool_schema(specific: Value, required: &[&str]) -> Value {
    let mut props = common_properties();
    if let Value::Object(specific) = specific {
        for (key, value) in specific {
            props.insert(key, value);
        }
    }
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

/// Fetch a required string argument.
pub fn required_str<'a>(
    arguments: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ErrorShape> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ErrorShape::new(
                ErrorKind::InvalidRequest,
                format!("missing required argument: {key}"),
            )
        })
}

/// Fetch an optional positive integer argument.
pub fn optional_u64(arguments: &Map<String, Value>, key: &str) -> Option<u64> {
    arguments.get(key).and_then(Value::as_u64)
}
