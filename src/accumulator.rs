//! Folding of streamed partial messages into one coherent whole.
//!
//! Providers emit text in arbitrary chunks and tool-call fragments keyed by
//! call id; this module is the only place that knows how to stitch them
//! back together without losing part ordering.

use crate::message::{Message, Part};

/// Append each part of `chunk` into `existing`.
///
/// Text is concatenated into the trailing text part when one is adjacent;
/// tool calls merge into an existing call with the same non-empty id,
/// taking the newer name/arguments when they are non-empty. Everything
/// else is appended unchanged. Chunk metadata overrides existing keys.
pub fn accumulate(existing: &mut Message, chunk: &Message) {
    for part in &chunk.parts {
        match part {
            Part::Text { text } => {
                if let Some(Part::Text { text: last }) = existing.parts.last_mut() {
                    last.push_str(text);
                } else {
                    existing.parts.push(part.clone());
                }
            }
            Part::ToolCall(incoming) if !incoming.id.is_empty() => {
                let slot = existing.parts.iter_mut().find_map(|p| match p {
                    Part::ToolCall(call) if call.id == incoming.id => Some(call),
                    _ => None,
                });
                match slot {
                    Some(call) => {
                        if !incoming.name.is_empty() {
                            call.name = incoming.name.clone();
                        }
                        if !incoming.arguments.is_empty() {
                            call.arguments = incoming.arguments.clone();
                        }
                    }
                    None => existing.parts.push(part.clone()),
                }
            }
            _ => existing.parts.push(part.clone()),
        }
    }
    for (key, value) in &chunk.metadata {
        existing.metadata.insert(key.clone(), value.clone());
    }
}

/// Final pass over an accumulated message: collapse all text parts, in
/// order, into a single text part sitting where the first one was; drop
/// the text entirely when it is empty; keep non-text parts in their
/// original order. Idempotent.
pub fn consolidate(message: Message) -> Message {
    let mut text = String::new();
    let mut first_text_pos: Option<usize> = None;
    let mut rest: Vec<Part> = Vec::new();

    for part in message.parts {
        match part {
            Part::Text { text: chunk } => {
                if first_text_pos.is_none() {
                    first_text_pos = Some(rest.len());
                }
                text.push_str(&chunk);
            }
            other => rest.push(other),
        }
    }

    if !text.is_empty() {
        let pos = first_text_pos.unwrap_or(0).min(rest.len());
        rest.insert(pos, Part::Text { text });
    }

    Message {
        role: message.role,
        parts: rest,
        metadata: message.metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::{json, Map, Value};

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_text_chunks_concatenate() {
        let mut acc = Message::model(Vec::new());
        for chunk in ["Hel", "lo ", "world"] {
            accumulate(&mut acc, &Message::model_text(chunk));
        }
        let done = consolidate(acc);
        assert_eq!(done.parts.len(), 1);
        assert_eq!(done.text(), "Hello world");
    }

    #[test]
    fn test_tool_call_merges_by_id() {
        let mut acc = Message::model(Vec::new());
        // First sight: id + name, no arguments yet
        accumulate(
            &mut acc,
            &Message::model(vec![Part::tool_call("c1", "weather", Map::new())]),
        );
        // Completion: same id, full arguments
        accumulate(
            &mut acc,
            &Message::model(vec![Part::tool_call(
                "c1",
                "",
                args(&[("city", json!("Boston"))]),
            )]),
        );

        let calls = acc.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "weather");
        assert_eq!(calls[0].arguments["city"], json!("Boston"));
    }

    #[test]
    fn test_distinct_ids_stay_separate() {
        let mut acc = Message::model(Vec::new());
        accumulate(
            &mut acc,
            &Message::model(vec![
                Part::tool_call("c1", "weather", args(&[("city", json!("Seattle"))])),
                Part::tool_call("c2", "temperature", args(&[("city", json!("Chicago"))])),
            ]),
        );
        assert_eq!(acc.tool_calls().len(), 2);
    }

    #[test]
    fn test_text_around_tool_call_keeps_order() {
        let mut acc = Message::model(Vec::new());
        accumulate(&mut acc, &Message::model_text("Checking"));
        accumulate(
            &mut acc,
            &Message::model(vec![Part::tool_call("c1", "weather", Map::new())]),
        );
        accumulate(&mut acc, &Message::model_text(" now"));

        let done = consolidate(acc);
        // Single text part, placed where text first appeared
        assert_eq!(done.parts.len(), 2);
        assert_eq!(done.parts[0].as_text(), Some("Checking now"));
        assert!(matches!(done.parts[1], Part::ToolCall(_)));
    }

    #[test]
    fn test_consolidate_drops_empty_text() {
        let acc = Message::model(vec![Part::text(""), Part::tool_call("c1", "t", Map::new())]);
        let done = consolidate(acc);
        assert_eq!(done.parts.len(), 1);
        assert!(matches!(done.parts[0], Part::ToolCall(_)));
    }

    #[test]
    fn test_consolidate_idempotent() {
        let mut acc = Message::model(Vec::new());
        accumulate(&mut acc, &Message::model_text("a"));
        accumulate(
            &mut acc,
            &Message::model(vec![Part::tool_call("c1", "t", Map::new())]),
        );
        accumulate(&mut acc, &Message::model_text("b"));

        let once = consolidate(acc);
        let twice = consolidate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_accumulate_fold_equals_concat() {
        let chunks = ["The", " windy", " city", " is", " Chicago"];
        let mut acc = Message::model(Vec::new());
        for chunk in chunks {
            accumulate(&mut acc, &Message::model_text(chunk));
        }
        let done = consolidate(acc);
        assert_eq!(done.text(), chunks.concat());
    }
}
