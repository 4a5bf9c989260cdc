//! Canonical message model shared by every provider.
//!
//! A conversation is an ordered sequence of [`Message`]s, each carrying one
//! or more [`Part`]s. Tool results are attributed to [`Role::User`] because
//! they are input to the next model turn; provider mappers translate this
//! canonical shape into whatever each wire format expects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Model,
}

/// A tool invocation emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Outcome of a tool invocation: either a JSON payload or an error string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Ok { value: Value },
    Error { message: String },
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error { .. })
    }

    /// Serialize the outcome the way it is transmitted to a provider:
    /// success payloads as their JSON text, errors as `{"error": ...}`.
    pub fn to_wire_string(&self) -> String {
        match self {
            ToolOutcome::Ok { value } => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error { message } => {
                serde_json::json!({ "error": message }).to_string()
            }
        }
    }
}

/// The outcome paired with the call that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    pub id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

/// The smallest unit of content within a [`Message`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    /// Inline binary payload
    Data {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// External reference
    Link {
        uri: String,
        mime_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ToolCall(ToolCallPart),
    ToolResult(ToolResultPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn data(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Part::Data {
            bytes,
            mime_type: mime_type.into(),
            name: None,
        }
    }

    pub fn link(uri: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Part::Link {
            uri: uri.into(),
            mime_type: mime_type.into(),
            name: None,
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Part::ToolCall(ToolCallPart {
            id: id.into(),
            name: name.into(),
            arguments,
        })
    }

    pub fn tool_ok(id: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Part::ToolResult(ToolResultPart {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Ok { value },
        })
    }

    pub fn tool_error(
        id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Part::ToolResult(ToolResultPart {
            id: id.into(),
            name: name.into(),
            outcome: ToolOutcome::Error {
                message: message.into(),
            },
        })
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Part::Text { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            metadata: Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// Concatenation of all text parts, in order
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResultPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            Role::System => "System",
            Role::User => "User",
            Role::Model => "Model",
        };
        write!(f, "{}: {}", role, self.text())?;
        for call in self.tool_calls() {
            write!(f, " [call {} -> {}]", call.id, call.name)?;
        }
        for result in self.tool_results() {
            write!(f, " [result {}]", result.id)?;
        }
        Ok(())
    }
}

/// Check the structural invariants a well-formed history must satisfy:
/// at most one leading system message, user/model alternation after it,
/// and every tool call paired with exactly one later result of the same
/// id and name.
pub fn validate_history(history: &[Message]) -> std::result::Result<(), String> {
    let mut expected: Option<Role> = None;
    for (idx, msg) in history.iter().enumerate() {
        match msg.role {
            Role::System => {
                if idx != 0 {
                    return Err(format!("system message at index {} is not first", idx));
                }
            }
            role => {
                if let Some(want) = expected {
                    if role != want {
                        return Err(format!(
                            "expected {:?} at index {}, found {:?}",
                            want, idx, role
                        ));
                    }
                }
                expected = Some(match role {
                    Role::User => Role::Model,
                    _ => Role::User,
                });
            }
        }
    }

    // Pairing: walk calls and results in order.
    let mut outstanding: Vec<(&str, &str)> = Vec::new();
    let mut seen_results: Vec<&str> = Vec::new();
    for msg in history {
        for call in msg.tool_calls() {
            if call.id.is_empty() {
                return Err(format!("tool call '{}' has an empty id", call.name));
            }
            if outstanding.iter().any(|(id, _)| *id == call.id) {
                return Err(format!("duplicate outstanding tool call id '{}'", call.id));
            }
            outstanding.push((&call.id, &call.name));
        }
        for result in msg.tool_results() {
            if seen_results.contains(&result.id.as_str()) {
                return Err(format!("duplicate tool result id '{}'", result.id));
            }
            let pos = outstanding.iter().position(|(id, name)| {
                *id == result.id && *name == result.name
            });
            match pos {
                Some(i) => {
                    outstanding.remove(i);
                    seen_results.push(&result.id);
                }
                None => {
                    return Err(format!(
                        "tool result '{}' ({}) has no preceding call",
                        result.id, result.name
                    ))
                }
            }
        }
    }
    if let Some((id, name)) = outstanding.first() {
        return Err(format!("tool call '{}' ({}) has no result", id, name));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_text_concatenates_text_parts_only() {
        let msg = Message::model(vec![
            Part::text("Hello"),
            Part::tool_call("c1", "weather", Map::new()),
            Part::text(" world"),
        ]);
        assert_eq!(msg.text(), "Hello world");
    }

    #[test]
    fn test_tool_call_and_result_extraction() {
        let msg = Message::user(vec![
            Part::tool_ok("c1", "weather", json!({"temp": 21})),
            Part::text("extra"),
        ]);
        assert_eq!(msg.tool_calls().len(), 0);
        let results = msg.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "weather");
        assert!(!results[0].outcome.is_error());
    }

    #[test]
    fn test_outcome_wire_string() {
        let ok = ToolOutcome::Ok {
            value: json!({"temp": 21}),
        };
        assert_eq!(ok.to_wire_string(), r#"{"temp":21}"#);

        let plain = ToolOutcome::Ok {
            value: json!("sunny"),
        };
        assert_eq!(plain.to_wire_string(), "sunny");

        let err = ToolOutcome::Error {
            message: "boom".to_string(),
        };
        assert_eq!(err.to_wire_string(), r#"{"error":"boom"}"#);
    }

    #[test]
    fn test_part_serde_round_trip() {
        let part = Part::tool_call("c1", "weather", args(&[("city", json!("Boston"))]));
        let encoded = serde_json::to_string(&part).unwrap();
        assert!(encoded.contains(r#""kind":"tool_call""#));
        let decoded: Part = serde_json::from_str(&encoded).unwrap();
        assert_eq!(part, decoded);
    }

    #[test]
    fn test_data_part_base64_round_trip() {
        let part = Part::data(vec![0xDE, 0xAD, 0xBE, 0xEF], "application/octet-stream");
        let encoded = serde_json::to_value(&part).unwrap();
        assert_eq!(encoded["bytes"], json!("3q2+7w=="));
        let decoded: Part = serde_json::from_value(encoded).unwrap();
        assert_eq!(part, decoded);
    }

    #[test]
    fn test_validate_history_accepts_alternation() {
        let history = vec![
            Message::system("be brief"),
            Message::user_text("hi"),
            Message::model_text("hello"),
            Message::user_text("bye"),
            Message::model_text("goodbye"),
        ];
        assert!(validate_history(&history).is_ok());
    }

    #[test]
    fn test_validate_history_rejects_misplaced_system() {
        let history = vec![Message::user_text("hi"), Message::system("too late")];
        assert!(validate_history(&history).is_err());
    }

    #[test]
    fn test_validate_history_rejects_double_user() {
        let history = vec![Message::user_text("a"), Message::user_text("b")];
        assert!(validate_history(&history).is_err());
    }

    #[test]
    fn test_validate_history_requires_paired_results() {
        let unpaired = vec![
            Message::user_text("weather?"),
            Message::model(vec![Part::tool_call("c1", "weather", Map::new())]),
        ];
        assert!(validate_history(&unpaired).is_err());

        let paired = vec![
            Message::user_text("weather?"),
            Message::model(vec![Part::tool_call("c1", "weather", Map::new())]),
            Message::user(vec![Part::tool_ok("c1", "weather", json!({"temp": 3}))]),
            Message::model_text("3 degrees"),
        ];
        assert!(validate_history(&paired).is_ok());
    }

    #[test]
    fn test_validate_history_rejects_mismatched_result_name() {
        let history = vec![
            Message::user_text("weather?"),
            Message::model(vec![Part::tool_call("c1", "weather", Map::new())]),
            Message::user(vec![Part::tool_ok("c1", "temperature", json!(null))]),
        ];
        assert!(validate_history(&history).is_err());
    }
}
