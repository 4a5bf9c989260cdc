//! OpenAI chat-completions wire family.
//!
//! Serves api.openai.com and the OpenAI-compatible proxies (OpenRouter,
//! Together, Mistral, Cohere compatibility mode, Ollama) that speak the
//! same protocol under a different base URL. Compatible servers are not
//! all equally faithful: tool-call deltas may arrive without ids, in
//! which case ids are synthesized on emission.

use crate::coordinator::synthesize_id;
use crate::error::{Error, Result};
use crate::message::{Message, Part, Role, ToolCallPart};
use crate::model::{
    BatchEmbeddingsResult, ChatModel, ChatModelOptions, ChatResult, ChatStream, EmbeddingsModel,
    EmbeddingsModelOptions, EmbeddingsResult, FinishReason, Usage,
};
use crate::providers::{ModelInfo, Provider};
use crate::schema::JsonSchema;
use crate::tool::Tool;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Chat model
// ============================================================================

pub struct OpenAiChatModel {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    tools: Vec<Arc<Tool>>,
    output_schema: Option<JsonSchema>,
}

impl OpenAiChatModel {
    pub(crate) fn new(
        provider: &Provider,
        options: ChatModelOptions,
        api_key: Option<String>,
    ) -> Self {
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
            max_tokens: options.max_tokens,
            tools: options.tools,
            output_schema: options.output_schema,
        }
    }

    fn build_request(&self, history: &[Message]) -> Result<ChatCompletionRequest> {
        let response_format = match &self.output_schema {
            Some(schema) => Some(response_format_for(schema)?),
            None => None,
        };
        Ok(ChatCompletionRequest {
            model: self.model.clone(),
            messages: to_wire_messages(history, &self.provider_name)?,
            temperature: self.temperature,
            max_completion_tokens: self.max_tokens,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            tools: if self.tools.is_empty() {
                None
            } else {
                Some(self.tools.iter().map(|t| wire_tool(t)).collect())
            },
            response_format,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn send_stream(&self, history: &[Message]) -> Result<ChatStream> {
        let request = self.build_request(history)?;

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;
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

            let mut assembler = ToolCallAssembler::new();
            let mut index_to_id: HashMap<usize, String> = HashMap::new();
            let mut finish: Option<FinishReason> = None;
            let mut usage = Usage::default();
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
                if event.data == "[DONE]" {
                    break;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(Error::protocol(
                            &provider_name,
                            format!("failed to parse chunk: {}", err),
                        ));
                        return;
                    }
                };

                if response_id.is_none() {
                    response_id = chunk.id.clone();
                }
                if model_name.is_none() {
                    model_name = chunk.model.clone();
                }
                if let Some(wire_usage) = &chunk.usage {
                    usage = convert_usage(wire_usage);
                }

                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            yield Ok(ChatResult::new(Message::model_text(content)));
                        }
                    }

                    if let Some(deltas) = choice.delta.tool_calls {
                        for delta in deltas {
                            let id = match &delta.id {
                                Some(id) if !id.is_empty() => {
                                    index_to_id.insert(delta.index, id.clone());
                                    id.clone()
                                }
                                _ => match index_to_id.get(&delta.index) {
                                    Some(known) => known.clone(),
                                    None => {
                                        // Compatible server omitted the id
                                        let minted = synthesize_id();
                                        index_to_id.insert(delta.index, minted.clone());
                                        minted
                                    }
                                },
                            };

                            let name = delta.function.as_ref().and_then(|f| f.name.clone());
                            let fragment =
                                delta.function.as_ref().and_then(|f| f.arguments.clone());

                            if assembler.announce(&id, name.as_deref()) {
                                // First sight: surface the call so accumulation
                                // can begin before the arguments are complete.
                                yield Ok(ChatResult::new(Message::model(vec![
                                    Part::tool_call(
                                        id.clone(),
                                        name.clone().unwrap_or_default(),
                                        serde_json::Map::new(),
                                    ),
                                ])));
                            }
                            assembler.push_fragment(&id, fragment.as_deref());
                        }
                    }

                    if let Some(reason) = choice.finish_reason {
                        finish = Some(map_finish_reason(&reason));
                    }
                }
            }

            let calls = match assembler.into_calls() {
                Ok(calls) => calls,
                Err(err) => {
                    yield Err(Error::protocol(
                        &provider_name,
                        format!("malformed tool-call arguments: {}", err),
                    ));
                    return;
                }
            };

            let has_calls = !calls.is_empty();
            let mut terminal = ChatResult::new(Message::model(
                calls.into_iter().map(Part::ToolCall).collect(),
            ));
            terminal.finish_reason = finish.unwrap_or(if has_calls {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            });
            terminal.usage = usage;
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

fn to_wire_messages(history: &[Message], provider: &str) -> Result<Vec<WireMessage>> {
    let mut wire = Vec::new();
    for msg in history {
        match msg.role {
            Role::System => wire.push(WireMessage::System { content: msg.text() }),
            Role::User => {
                // One role:"tool" entry per result, ids preserved verbatim
                for result in msg.tool_results() {
                    wire.push(WireMessage::Tool {
                        content: result.outcome.to_wire_string(),
                        tool_call_id: result.id.clone(),
                    });
                }
                if let Some(content) = user_content(msg, provider)? {
                    wire.push(WireMessage::User { content });
                }
            }
            Role::Model => {
                let text = msg.text();
                let calls = msg.tool_calls();
                let tool_calls = if calls.is_empty() {
                    None
                } else {
                    Some(
                        calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                call_type: "function".to_string(),
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: Value::Object(call.arguments.clone()).to_string(),
                                },
                            })
                            .collect(),
                    )
                };
                wire.push(WireMessage::Assistant {
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls,
                });
            }
        }
    }
    Ok(wire)
}

fn user_content(msg: &Message, provider: &str) -> Result<Option<UserContent>> {
    let mut parts = Vec::new();
    let mut plain_text_only = true;

    for part in &msg.parts {
        match part {
            Part::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            Part::Data {
                bytes, mime_type, ..
            } => {
                if mime_type.starts_with("image/") {
                    plain_text_only = false;
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(bytes, mime_type),
                        },
                    });
                } else if mime_type.starts_with("text/") {
                    match String::from_utf8(bytes.clone()) {
                        Ok(text) => parts.push(ContentPart::Text { text }),
                        Err(_) => parts.push(ContentPart::Text {
                            text: data_url(bytes, mime_type),
                        }),
                    }
                } else {
                    parts.push(ContentPart::Text {
                        text: data_url(bytes, mime_type),
                    });
                }
            }
            Part::Link {
                uri, mime_type, ..
            } => {
                if mime_type.starts_with("image/") {
                    plain_text_only = false;
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url: uri.clone() },
                    });
                } else {
                    parts.push(ContentPart::Text { text: uri.clone() });
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

    if parts.is_empty() {
        return Ok(None);
    }
    if plain_text_only {
        let text: String = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        return Ok(Some(UserContent::Text(text)));
    }
    Ok(Some(UserContent::Parts(parts)))
}

fn data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

fn wire_tool(tool: &Tool) -> WireTool {
    WireTool {
        tool_type: "function".to_string(),
        function: WireFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.as_value().clone(),
        },
    }
}

fn response_format_for(schema: &JsonSchema) -> Result<Value> {
    let resolved = schema.resolve_refs()?;
    Ok(json!({
        "type": "json_schema",
        "json_schema": {
            "name": "response",
            "strict": true,
            "schema": resolved.into_value(),
        }
    }))
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Unspecified,
    }
}

fn convert_usage(usage: &WireUsage) -> Usage {
    Usage {
        prompt_tokens: Some(usage.prompt_tokens),
        response_tokens: Some(usage.completion_tokens),
        total_tokens: Some(usage.prompt_tokens + usage.completion_tokens),
    }
}

// ============================================================================
// Streaming tool-call assembly
// ============================================================================

/// Assembles parallel tool calls from argument deltas, preserving the
/// order in which calls first appeared on the wire.
struct ToolCallAssembler {
    calls: Vec<PartialCall>,
}

struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    fn new() -> Self {
        Self { calls: Vec::new() }
    }

    /// Record the call/name. Returns true the first time an id is seen.
    fn announce(&mut self, id: &str, name: Option<&str>) -> bool {
        if let Some(call) = self.calls.iter_mut().find(|c| c.id == id) {
            if let Some(name) = name {
                if !name.is_empty() {
                    call.name = name.to_string();
                }
            }
            return false;
        }
        self.calls.push(PartialCall {
            id: id.to_string(),
            name: name.unwrap_or_default().to_string(),
            arguments: String::new(),
        });
        true
    }

    fn push_fragment(&mut self, id: &str, fragment: Option<&str>) {
        if let (Some(call), Some(fragment)) =
            (self.calls.iter_mut().find(|c| c.id == id), fragment)
        {
            call.arguments.push_str(fragment);
        }
    }

    fn into_calls(self) -> std::result::Result<Vec<ToolCallPart>, serde_json::Error> {
        self.calls
            .into_iter()
            .map(|partial| {
                let arguments = if partial.arguments.trim().is_empty() {
                    serde_json::Map::new()
                } else {
                    match serde_json::from_str::<Value>(&partial.arguments)? {
                        Value::Object(map) => map,
                        other => {
                            let mut map = serde_json::Map::new();
                            map.insert("value".to_string(), other);
                            map
                        }
                    }
                };
                Ok(ToolCallPart {
                    id: partial.id,
                    name: partial.name,
                    arguments,
                })
            })
            .collect()
    }
}

// ============================================================================
// Embeddings
// ============================================================================

pub struct OpenAiEmbeddingsModel {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiEmbeddingsModel {
    pub(crate) fn new(
        provider: &Provider,
        options: EmbeddingsModelOptions,
        model_name: String,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: provider.name.clone(),
            model: model_name,
            base_url: options
                .base_url
                .unwrap_or_else(|| provider.base_url.clone()),
            api_key,
        }
    }

    async fn request(&self, input: &[String]) -> Result<BatchEmbeddingsResult> {
        let mut builder = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&json!({ "model": self.model, "input": input }));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await?;
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

        let body: EmbeddingsResponse = response.json().await?;
        let mut data = body.data;
        data.sort_by_key(|entry| entry.index);
        let usage = body
            .usage
            .map(|u| Usage {
                prompt_tokens: Some(u.prompt_tokens),
                response_tokens: None,
                total_tokens: u.total_tokens.or(Some(u.prompt_tokens)),
            })
            .unwrap_or_default();
        Ok(BatchEmbeddingsResult {
            embeddings: data.into_iter().map(|entry| entry.embedding).collect(),
            usage,
        })
    }
}

#[async_trait]
impl EmbeddingsModel for OpenAiEmbeddingsModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed_query(&self, text: &str) -> Result<EmbeddingsResult> {
        let mut batch = self.request(&[text.to_string()]).await?;
        let embedding = if batch.embeddings.is_empty() {
            return Err(Error::protocol(
                &self.provider_name,
                "embeddings response contained no vectors",
            ));
        } else {
            batch.embeddings.swap_remove(0)
        };
        Ok(EmbeddingsResult {
            embedding,
            usage: batch.usage,
        })
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<BatchEmbeddingsResult> {
        self.request(texts).await
    }
}

/// GET /models for the OpenAI wire family
pub(crate) async fn list_models(base_url: &str, api_key: Option<&str>) -> Result<Vec<ModelInfo>> {
    let client = reqwest::Client::new();
    let mut builder = client.get(format!("{}/models", base_url));
    if let Some(key) = api_key {
        builder = builder.header("Authorization", format!("Bearer {}", key));
    }
    let response = builder.send().await?;
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
            display_name: None,
        })
        .collect())
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: UserContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingsUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsUsage {
    prompt_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}
