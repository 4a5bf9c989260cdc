//! Anthropic Messages wire mapping and SSE streaming.

use crate::error::{Error, Result};
use crate::message::{Message, Part, Role};
use crate::model::{
    ChatModel, ChatModelOptions, ChatResult, ChatStream, FinishReason, Usage,
};
use crate::providers::{ModelInfo, Provider};
use crate::tool::Tool;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicChatModel {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: String,
    temperature: Option<f32>,
    max_tokens: u32,
    tools: Vec<Arc<Tool>>,
}

impl AnthropicChatModel {
    pub(crate) fn new(provider: &Provider, options: ChatModelOptions, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: provider.name.clone(),
            model: options
                .model_name
                .unwrap_or_else(|| provider.default_models.chat.clone()),
            base_url: options
                .base_url
                .unwrap_or_else(|| provider.base_url.clone()),
            api_key,
            temperature: options.temperature,
            // The Messages API requires max_tokens on every request
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            tools: options.tools,
        }
    }

    fn build_request(&self, history: &[Message]) -> Result<CreateMessageRequest> {
        let (messages, system) = to_wire_messages(history, &self.provider_name)?;
        Ok(CreateMessageRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages,
            system,
            temperature: self.temperature,
            stream: true,
            tools: if self.tools.is_empty() {
                None
            } else {
                Some(self.tools.iter().map(|t| wire_tool(t)).collect())
            },
            tool_choice: if self.tools.is_empty() {
                None
            } else {
                Some(WireToolChoice::Auto)
            },
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn send_stream(&self, history: &[Message]) -> Result<ChatStream> {
        let request = self.build_request(history)?;

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::api(format!(
                "{} HTTP {}: {}",
                self.provider_name, status, text
            )));
        }

        let provider_name = self.provider_name.clone();
        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);

            // (id, name, partial json) for the tool_use block in flight
            let mut current_tool: Option<(String, String, String)> = None;
            let mut stop_reason: Option<String> = None;
            let mut prompt_tokens: Option<u64> = None;
            let mut output_tokens: Option<u64> = None;
            let mut response_id: Option<String> = None;
            let mut model_name: Option<String> = None;

            while let Some(event_result) = event_stream.next().await {
                let event = match event_result {
                    Ok(event) => event,
                    Err(err) => {
                        yield Err(Error::stream(format!(
                            "{} stream error: {}",
                            provider_name, err
                        )));
                        return;
                    }
                };
                if event.event == "message_stop" {
                    break;
                }
                if event.data.trim().is_empty() {
                    continue;
                }

                match event.event.as_str() {
                    "message_start" => {
                        if let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) {
                            response_id = Some(start.message.id);
                            model_name = start.message.model;
                            prompt_tokens = Some(start.message.usage.input_tokens);
                        }
                    }
                    "content_block_start" => {
                        let block: ContentBlockStart = match serde_json::from_str(&event.data) {
                            Ok(block) => block,
                            Err(err) => {
                                yield Err(Error::protocol(
                                    &provider_name,
                                    format!("failed to parse content_block_start: {}", err),
                                ));
                                return;
                            }
                        };
                        if let WireContentBlock::ToolUse { id, name, input } = block.content_block {
                            // Surface the call immediately; arguments follow
                            // as input_json_delta fragments.
                            yield Ok(ChatResult::new(Message::model(vec![Part::tool_call(
                                id.clone(),
                                name.clone(),
                                serde_json::Map::new(),
                            )])));
                            let seed = if input.is_null() {
                                String::new()
                            } else {
                                input.to_string()
                            };
                            let seed = if seed == "{}" { String::new() } else { seed };
                            current_tool = Some((id, name, seed));
                        }
                    }
                    "content_block_delta" => {
                        let delta: ContentBlockDelta = match serde_json::from_str(&event.data) {
                            Ok(delta) => delta,
                            Err(err) => {
                                yield Err(Error::protocol(
                                    &provider_name,
                                    format!("failed to parse content_block_delta: {}", err),
                                ));
                                return;
                            }
                        };
                        match delta.delta {
                            ContentDelta::TextDelta { text } => {
                                if !text.is_empty() {
                                    yield Ok(ChatResult::new(Message::model_text(text)));
                                }
                            }
                            ContentDelta::InputJsonDelta { partial_json } => {
                                if let Some((_, _, ref mut buffer)) = current_tool {
                                    buffer.push_str(&partial_json);
                                }
                            }
                            ContentDelta::ThinkingDelta { .. } => {}
                        }
                    }
                    "content_block_stop" => {
                        if let Some((id, name, buffer)) = current_tool.take() {
                            let arguments = if buffer.trim().is_empty() {
                                serde_json::Map::new()
                            } else {
                                match serde_json::from_str::<Value>(&buffer) {
                                    Ok(Value::Object(map)) => map,
                                    Ok(_) | Err(_) => {
                                        yield Err(Error::protocol(
                                            &provider_name,
                                            format!(
                                                "tool_use '{}' produced non-object arguments",
                                                name
                                            ),
                                        ));
                                        return;
                                    }
                                }
                            };
                            yield Ok(ChatResult::new(Message::model(vec![Part::tool_call(
                                id, name, arguments,
                            )])));
                        }
                    }
                    "message_delta" => {
                        if let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) {
                            stop_reason = delta.delta.stop_reason;
                            if let Some(usage) = delta.usage {
                                output_tokens = Some(usage.output_tokens);
                            }
                        }
                    }
                    _ => {}
                }
            }

            let mut terminal = ChatResult::new(Message::model(Vec::new()));
            terminal.finish_reason = map_stop_reason(stop_reason.as_deref());
            terminal.usage = Usage {
                prompt_tokens,
                response_tokens: output_tokens,
                total_tokens: match (prompt_tokens, output_tokens) {
                    (Some(p), Some(o)) => Some(p + o),
                    _ => None,
                },
            };
            terminal.id = response_id;
            if let Some(model_name) = model_name {
                terminal
                    .metadata
                    .insert("model".to_string(), Value::String(model_name));
            }
            yield Ok(terminal);
        };

        Ok(Box::pin(output))
    }
}

// ============================================================================
// Canonical -> wire mapping
// ============================================================================

fn to_wire_messages(
    history: &[Message],
    provider: &str,
) -> Result<(Vec<WireMessage>, Option<String>)> {
    let mut messages = Vec::new();
    let mut system: Option<String> = None;

    for msg in history {
        match msg.role {
            Role::System => {
                if system.is_none() {
                    system = Some(msg.text());
                }
            }
            Role::User => {
                let mut blocks = Vec::new();
                // Tool results lead the turn so they sit adjacent to the
                // assistant tool_use blocks they answer.
                for result in msg.tool_results() {
                    blocks.push(WireContentBlock::ToolResult {
                        tool_use_id: result.id.clone(),
                        content: result.outcome.to_wire_string(),
                        is_error: if result.outcome.is_error() {
                            Some(true)
                        } else {
                            None
                        },
                    });
                }
                for part in &msg.parts {
                    match part {
                        Part::Text { text } => {
                            blocks.push(WireContentBlock::Text { text: text.clone() })
                        }
                        Part::Data {
                            bytes, mime_type, ..
                        } => blocks.push(data_block(bytes, mime_type)),
                        Part::Link {
                            uri, mime_type, ..
                        } => {
                            if mime_type.starts_with("image/") {
                                blocks.push(WireContentBlock::Image {
                                    source: ImageSource {
                                        source_type: "url".to_string(),
                                        media_type: None,
                                        data: None,
                                        url: Some(uri.clone()),
                                    },
                                });
                            } else {
                                blocks.push(WireContentBlock::Text { text: uri.clone() });
                            }
                        }
                        Part::ToolResult(_) => {}
                        Part::ToolCall(call) => {
                            return Err(Error::protocol(
                                provider,
                                format!("tool call '{}' in a user message", call.name),
                            ));
                        }
                    }
                }
                if !blocks.is_empty() {
                    messages.push(WireMessage {
                        role: "user".to_string(),
                        content: blocks,
                    });
                }
            }
            Role::Model => {
                let mut blocks = Vec::new();
                for part in &msg.parts {
                    match part {
                        Part::Text { text } => {
                            if !text.is_empty() {
                                blocks.push(WireContentBlock::Text { text: text.clone() });
                            }
                        }
                        Part::ToolCall(call) => blocks.push(WireContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: Value::Object(call.arguments.clone()),
                        }),
                        _ => {}
                    }
                }
                if !blocks.is_empty() {
                    messages.push(WireMessage {
                        role: "assistant".to_string(),
                        content: blocks,
                    });
                }
            }
        }
    }

    Ok((messages, system))
}

fn data_block(bytes: &[u8], mime_type: &str) -> WireContentBlock {
    if mime_type.starts_with("image/") {
        WireContentBlock::Image {
            source: ImageSource {
                source_type: "base64".to_string(),
                media_type: Some(mime_type.to_string()),
                data: Some(STANDARD.encode(bytes)),
                url: None,
            },
        }
    } else if mime_type.starts_with("text/") {
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => WireContentBlock::Text { text },
            Err(_) => WireContentBlock::Text {
                text: format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes)),
            },
        }
    } else {
        WireContentBlock::Text {
            text: format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes)),
        }
    }
}

fn wire_tool(tool: &Tool) -> WireTool {
    WireTool {
        name: tool.name.clone(),
        description: Some(tool.description.clone()),
        input_schema: tool.input_schema.as_value().clone(),
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Unspecified,
        None => FinishReason::Stop,
    }
}

/// GET /models
pub(crate) async fn list_models(base_url: &str, api_key: &str) -> Result<Vec<ModelInfo>> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/models", base_url))
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::api(format!(
            "model listing failed with HTTP {}",
            response.status()
        )));
    }
    let body: ModelsResponse = response.json().await?;
    Ok(body
        .data
        .into_iter()
        .map(|m| ModelInfo {
            id: m.id,
            display_name: m.display_name,
        })
        .collect())
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<WireToolChoice>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireToolChoice {
    Auto,
}

// Streaming event payloads

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    id: String,
    #[serde(default)]
    model: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    content_block: WireContentBlock,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: ContentDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
    #[serde(default)]
    usage: Option<UsageDelta>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageDelta {
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_system_message_becomes_system_param() {
        let history = vec![Message::system("be brief"), Message::user_text("hi")];
        let (messages, system) = to_wire_messages(&history, "anthropic").unwrap();
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(messages.len(), 1);
        let value = serde_json::to_value(&messages).unwrap();
        assert_eq!(value[0]["role"], json!("user"));
        assert_eq!(value[0]["content"][0]["type"], json!("text"));
    }

    #[test]
    fn test_model_turn_maps_to_tool_use_blocks() {
        let history = vec![Message::model(vec![
            Part::text("checking"),
            Part::tool_call("toolu_1", "weather", args(&[("city", json!("Boston"))])),
        ])];
        let (messages, _) = to_wire_messages(&history, "anthropic").unwrap();
        let value = serde_json::to_value(&messages).unwrap();
        assert_eq!(value[0]["role"], json!("assistant"));
        assert_eq!(value[0]["content"][1]["type"], json!("tool_use"));
        assert_eq!(value[0]["content"][1]["id"], json!("toolu_1"));
        assert_eq!(
            value[0]["content"][1]["input"]["city"],
            json!("Boston")
        );
    }

    #[test]
    fn test_batched_tool_results_stay_in_one_user_message() {
        let history = vec![Message::user(vec![
            Part::tool_ok("toolu_1", "weather", json!({"temp": 20})),
            Part::tool_error("toolu_2", "temperature", "no data"),
        ])];
        let (messages, _) = to_wire_messages(&history, "anthropic").unwrap();
        assert_eq!(messages.len(), 1);
        let value = serde_json::to_value(&messages).unwrap();
        let blocks = value[0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], json!("tool_result"));
        assert_eq!(blocks[0]["tool_use_id"], json!("toolu_1"));
        assert!(blocks[0].get("is_error").is_none());
        assert_eq!(blocks[1]["is_error"], json!(true));
    }

    #[test]
    fn test_image_data_becomes_base64_source() {
        let history = vec![Message::user(vec![Part::data(vec![1, 2, 3], "image/png")])];
        let (messages, _) = to_wire_messages(&history, "anthropic").unwrap();
        let value = serde_json::to_value(&messages).unwrap();
        let source = &value[0]["content"][0]["source"];
        assert_eq!(source["type"], json!("base64"));
        assert_eq!(source["media_type"], json!("image/png"));
        assert_eq!(source["data"], json!("AQID"));
    }

    #[test]
    fn test_image_link_becomes_url_source() {
        let history = vec![Message::user(vec![Part::link(
            "https://example.com/cat.jpg",
            "image/jpeg",
        )])];
        let (messages, _) = to_wire_messages(&history, "anthropic").unwrap();
        let value = serde_json::to_value(&messages).unwrap();
        let source = &value[0]["content"][0]["source"];
        assert_eq!(source["type"], json!("url"));
        assert_eq!(source["url"], json!("https://example.com/cat.jpg"));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(map_stop_reason(None), FinishReason::Stop);
        assert_eq!(
            map_stop_reason(Some("mystery")),
            FinishReason::Unspecified
        );
    }
}
