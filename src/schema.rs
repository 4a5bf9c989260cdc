//! JSON Schema wrapper used for tool parameters and typed output.
//!
//! The runtime only needs the draft 2020-12 subset providers understand:
//! object/array/string/number/integer/boolean with `properties`, `required`,
//! `enum`, `description`, `nullable`, `format` and `$ref`/`$defs`. Schemas
//! are carried as raw [`serde_json::Value`]s; this type adds the handful of
//! operations the mappers rely on, most importantly `$ref` inlining.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonSchema(Value);

impl JsonSchema {
    pub fn new(value: Value) -> Self {
        JsonSchema(value)
    }

    /// An object schema from `(name, schema)` properties; `required` lists
    /// property names. A required property is implicitly non-nullable.
    pub fn object(properties: Vec<(&str, JsonSchema)>, required: &[&str]) -> Self {
        let props: Map<String, Value> = properties
            .into_iter()
            .map(|(name, schema)| (name.to_string(), schema.0))
            .collect();
        JsonSchema(json!({
            "type": "object",
            "properties": props,
            "required": required,
        }))
    }

    pub fn string() -> Self {
        JsonSchema(json!({"type": "string"}))
    }

    pub fn number() -> Self {
        JsonSchema(json!({"type": "number"}))
    }

    pub fn integer() -> Self {
        JsonSchema(json!({"type": "integer"}))
    }

    pub fn boolean() -> Self {
        JsonSchema(json!({"type": "boolean"}))
    }

    pub fn array(items: JsonSchema) -> Self {
        JsonSchema(json!({"type": "array", "items": items.0}))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        if let Value::Object(map) = &mut self.0 {
            map.insert("description".to_string(), json!(description.into()));
        }
        self
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn schema_type(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn properties(&self) -> Option<&Map<String, Value>> {
        self.0.get("properties").and_then(Value::as_object)
    }

    pub fn required(&self) -> Vec<&str> {
        self.0
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Inline every `$ref` pointing into `#/$defs/...` and strip the
    /// `$defs` table. Unknown or cyclic references are protocol errors
    /// because a provider would reject the schema anyway.
    pub fn resolve_refs(&self) -> Result<JsonSchema> {
        let defs = self
            .0
            .get("$defs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut resolved = resolve_value(&self.0, &defs, &mut Vec::new())?;
        if let Value::Object(map) = &mut resolved {
            map.remove("$defs");
        }
        Ok(JsonSchema(resolved))
    }
}

impl From<Value> for JsonSchema {
    fn from(value: Value) -> Self {
        JsonSchema(value)
    }
}

fn resolve_value(
    value: &Value,
    defs: &Map<String, Value>,
    stack: &mut Vec<String>,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                let name = reference
                    .strip_prefix("#/$defs/")
                    .ok_or_else(|| unsupported_ref(reference))?;
                if stack.iter().any(|seen| seen == name) {
                    return Err(Error::configuration(format!(
                        "cyclic $ref through '#/$defs/{}'",
                        name
                    )));
                }
                let target = defs
                    .get(name)
                    .ok_or_else(|| unsupported_ref(reference))?;
                stack.push(name.to_string());
                let resolved = resolve_value(target, defs, stack)?;
                stack.pop();
                return Ok(resolved);
            }
            let mut out = Map::new();
            for (key, inner) in map {
                out.insert(key.clone(), resolve_value(inner, defs, stack)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_value(item, defs, stack)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn unsupported_ref(reference: &str) -> Error {
    Error::configuration(format!(
        "unresolvable $ref '{}': only '#/$defs/<name>' references are supported",
        reference
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_builder() {
        let schema = JsonSchema::object(
            vec![
                ("city", JsonSchema::string()),
                ("country", JsonSchema::string()),
            ],
            &["city"],
        );
        assert_eq!(schema.schema_type(), Some("object"));
        assert_eq!(schema.required(), vec!["city"]);
        assert!(schema.properties().unwrap().contains_key("country"));
    }

    #[test]
    fn test_resolve_refs_inlines_defs() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "home": {"$ref": "#/$defs/address"},
                "work": {"$ref": "#/$defs/address"}
            },
            "required": ["home"],
            "$defs": {
                "address": {
                    "type": "object",
                    "properties": {"street": {"type": "string"}},
                    "required": ["street"]
                }
            }
        }));

        let resolved = schema.resolve_refs().unwrap();
        let value = resolved.as_value();
        assert!(value.get("$defs").is_none());
        assert_eq!(
            value["properties"]["home"]["properties"]["street"]["type"],
            json!("string")
        );
        assert_eq!(
            value["properties"]["work"]["required"],
            json!(["street"])
        );
    }

    #[test]
    fn test_resolve_refs_nested_defs() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {"person": {"$ref": "#/$defs/person"}},
            "$defs": {
                "person": {
                    "type": "object",
                    "properties": {"address": {"$ref": "#/$defs/address"}}
                },
                "address": {"type": "string"}
            }
        }));

        let resolved = schema.resolve_refs().unwrap();
        assert_eq!(
            resolved.as_value()["properties"]["person"]["properties"]["address"]["type"],
            json!("string")
        );
    }

    #[test]
    fn test_resolve_refs_rejects_unknown() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {"x": {"$ref": "#/$defs/missing"}}
        }));
        assert!(schema.resolve_refs().is_err());
    }

    #[test]
    fn test_resolve_refs_rejects_cycle() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {"node": {"$ref": "#/$defs/node"}},
            "$defs": {
                "node": {
                    "type": "object",
                    "properties": {"next": {"$ref": "#/$defs/node"}}
                }
            }
        }));
        assert!(schema.resolve_refs().is_err());
    }

    #[test]
    fn test_resolve_refs_rejects_external() {
        let schema = JsonSchema::new(json!({
            "$ref": "https://example.com/schema.json"
        }));
        assert!(schema.resolve_refs().is_err());
    }
}
