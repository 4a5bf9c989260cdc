//! Google Gemini wire mapping, streaming and schema adaptation.
//!
//! Gemini departs from the OpenAI family in two ways that matter here:
//! function calls carry no ids (ids are synthesized on emission and
//! results pair by function name), and tool schemas are an OpenAPI-style
//! subset that wants explicit `nullable` flags instead of `required`-only
//! semantics.

use crate::coordinator::synthesize_id;
use crate::error::{Error, Result};
use crate::message::{Message, Part, Role};
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
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

pub struct GoogleChatModel {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    tools: Vec<Arc<Tool>>,
    /// Adapted schema for native typed output, when requested
    response_schema: Option<Value>,
}

impl GoogleChatModel {
    pub(crate) fn new(
        provider: &Provider,
        options: ChatModelOptions,
        api_key: String,
    ) -> Result<Self> {
        let response_schema = match &options.output_schema {
            Some(schema) => Some(adapt_schema(schema)?),
            None => None,
        };
        Ok(Self {
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
            response_schema,
        })
    }

    fn build_request(&self, history: &[Message]) -> Result<GenerateContentRequest> {
        let (contents, system_instruction) = to_wire_contents(history, &self.provider_name)?;

        let tools = if self.tools.is_empty() {
            None
        } else {
            let mut declarations = Vec::with_capacity(self.tools.len());
            for tool in &self.tools {
                declarations.push(FunctionDeclaration {
                    name: tool.name.clone(),
                    description: Some(tool.description.clone()),
                    parameters: adapt_schema(&tool.input_schema)?,
                });
            }
            Some(vec![WireTools {
                function_declarations: declarations,
            }])
        };

        let tool_config = tools.as_ref().map(|_| ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: "AUTO".to_string(),
            },
        });

        Ok(GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            tool_config,
            generation_config: Some(GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
                response_mime_type: self
                    .response_schema
                    .as_ref()
                    .map(|_| "application/json".to_string()),
                response_schema: self.response_schema.clone(),
            }),
        })
    }
}

#[async_trait]
impl ChatModel for GoogleChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn send_stream(&self, history: &[Message]) -> Result<ChatStream> {
        let request = self.build_request(history)?;

        let response = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, self.model
            ))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
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

            let mut finish: Option<FinishReason> = None;
            let mut usage: Option<Usage> = None;
            let mut response_id: Option<String> = None;
            let mut model_version: Option<String> = None;
            let mut emitted_calls = false;

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
                if event.data.trim().is_empty() || event.data == "[DONE]" {
                    continue;
                }

                let frame: GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(frame) => frame,
                    Err(err) => {
                        yield Err(Error::protocol(
                            &provider_name,
                            format!("failed to parse frame: {}", err),
                        ));
                        return;
                    }
                };

                if response_id.is_none() {
                    response_id = frame.response_id;
                }
                if model_version.is_none() {
                    model_version = frame.model_version;
                }
                if let Some(meta) = &frame.usage_metadata {
                    usage = Some(convert_usage(meta));
                }

                if let Some(candidate) = frame.candidates.unwrap_or_default().into_iter().next() {
                    if let Some(content) = candidate.content {
                        for part in content.parts {
                            if let Some(text) = part.text {
                                if !text.is_empty() {
                                    yield Ok(ChatResult::new(Message::model_text(text)));
                                }
                            }
                            if let Some(call) = part.function_call {
                                emitted_calls = true;
                                // No wire id: mint one so pairing survives
                                // round-trips through other providers.
                                let arguments = match call.args {
                                    Value::Object(map) => map,
                                    Value::Null => Map::new(),
                                    other => {
                                        let mut map = Map::new();
                                        map.insert("value".to_string(), other);
                                        map
                                    }
                                };
                                yield Ok(ChatResult::new(Message::model(vec![
                                    Part::tool_call(synthesize_id(), call.name, arguments),
                                ])));
                            }
                        }
                    }
                    if let Some(reason) = candidate.finish_reason {
                        finish = Some(map_finish_reason(&reason));
                    }
                }
            }

            let mut terminal = ChatResult::new(Message::model(Vec::new()));
            terminal.finish_reason = if emitted_calls {
                FinishReason::ToolCalls
            } else {
                finish.unwrap_or(FinishReason::Stop)
            };
            terminal.usage = usage.unwrap_or_default();
            terminal.id = response_id;
            if let Some(model_version) = model_version {
                terminal
                    .metadata
                    .insert("model".to_string(), Value::String(model_version));
            }
            yield Ok(terminal);
        };

        Ok(Box::pin(output))
    }
}

// ============================================================================
// Canonical -> wire mapping
// ============================================================================

fn to_wire_contents(
    history: &[Message],
    provider: &str,
) -> Result<(Vec<WireContent>, Option<WireContent>)> {
    let mut contents = Vec::new();
    let mut system_instruction: Option<WireContent> = None;

    for msg in history {
        match msg.role {
            Role::System => {
                if system_instruction.is_none() {
                    system_instruction = Some(WireContent {
                        role: None,
                        parts: vec![WirePart::text(msg.text())],
                    });
                }
            }
            Role::User => {
                let mut parts = Vec::new();
                for part in &msg.parts {
                    match part {
                        Part::Text { text } => parts.push(WirePart::text(text.clone())),
                        Part::Data {
                            bytes, mime_type, ..
                        } => parts.push(data_part(bytes, mime_type)),
                        Part::Link {
                            uri, mime_type, ..
                        } => {
                            if mime_type.starts_with("image/") {
                                parts.push(WirePart {
                                    file_data: Some(FileData {
                                        mime_type: mime_type.clone(),
                                        file_uri: uri.clone(),
                                    }),
                                    ..Default::default()
                                });
                            } else {
                                parts.push(WirePart::text(uri.clone()));
                            }
                        }
                        // All results of one batch stay in one user turn as
                        // functionResponse parts, paired by function name.
                        Part::ToolResult(result) => parts.push(WirePart {
                            function_response: Some(FunctionResponse {
                                name: result.name.clone(),
                                response: tool_response_value(result),
                            }),
                            ..Default::default()
                        }),
                        Part::ToolCall(call) => {
                            return Err(Error::protocol(
                                provider,
                                format!("tool call '{}' in a user message", call.name),
                            ));
                        }
                    }
                }
                if !parts.is_empty() {
                    contents.push(WireContent {
                        role: Some("user".to_string()),
                        parts,
                    });
                }
            }
            Role::Model => {
                let mut parts = Vec::new();
                for part in &msg.parts {
                    match part {
                        Part::Text { text } => {
                            if !text.is_empty() {
                                parts.push(WirePart::text(text.clone()));
                            }
                        }
                        Part::ToolCall(call) => parts.push(WirePart {
                            function_call: Some(FunctionCall {
                                name: call.name.clone(),
                                args: Value::Object(call.arguments.clone()),
                            }),
                            ..Default::default()
                        }),
                        _ => {}
                    }
                }
                if !parts.is_empty() {
                    contents.push(WireContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
        }
    }

    Ok((contents, system_instruction))
}

fn data_part(bytes: &[u8], mime_type: &str) -> WirePart {
    if mime_type.starts_with("text/") {
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => WirePart::text(text),
            Err(_) => WirePart::text(format!(
                "data:{};base64,{}",
                mime_type,
                STANDARD.encode(bytes)
            )),
        }
    } else {
        WirePart {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(bytes),
            }),
            ..Default::default()
        }
    }
}

/// Gemini wants an object payload in functionResponse; wrap anything else.
fn tool_response_value(result: &crate::message::ToolResultPart) -> Value {
    use crate::message::ToolOutcome;
    match &result.outcome {
        ToolOutcome::Ok { value } => match value {
            Value::Object(_) => value.clone(),
            other => serde_json::json!({ "result": other }),
        },
        ToolOutcome::Error { message } => serde_json::json!({ "error": message }),
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "BLOCKLIST" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        _ => FinishReason::Unspecified,
    }
}

fn convert_usage(meta: &UsageMetadata) -> Usage {
    let prompt = meta.prompt_token_count;
    let response = meta.candidates_token_count;
    Usage {
        prompt_tokens: prompt,
        response_tokens: response,
        total_tokens: meta.total_token_count.or(match (prompt, response) {
            (Some(p), Some(r)) => Some(p + r),
            _ => None,
        }),
    }
}

// ============================================================================
// Schema adaptation
// ============================================================================

/// Translate a JSON Schema into the Gemini subset: `$ref`s inlined,
/// unsupported keywords stripped, and `nullable` derived from `required`
/// (a required property is non-nullable, everything else is nullable).
pub(crate) fn adapt_schema(schema: &JsonSchema) -> Result<Value> {
    let resolved = schema.resolve_refs()?;
    Ok(adapt_value(resolved.as_value(), false))
}

fn adapt_value(value: &Value, nullable: bool) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };

    let mut out = Map::new();
    for key in ["type", "format", "description", "enum"] {
        if let Some(kept) = map.get(key) {
            out.insert(key.to_string(), kept.clone());
        }
    }

    if let Some(items) = map.get("items") {
        out.insert("items".to_string(), adapt_value(items, false));
    }

    if let Some(properties) = map.get("properties").and_then(Value::as_object) {
        let required: HashSet<&str> = map
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut adapted = Map::new();
        for (name, property) in properties {
            adapted.insert(
                name.clone(),
                adapt_value(property, !required.contains(name.as_str())),
            );
        }
        out.insert("properties".to_string(), Value::Object(adapted));
        if !required.is_empty() {
            out.insert(
                "required".to_string(),
                map.get("required").cloned().unwrap_or(Value::Null),
            );
        }
    }

    if nullable || map.get("nullable").and_then(Value::as_bool) == Some(true) {
        out.insert("nullable".to_string(), Value::Bool(true));
    }

    Value::Object(out)
}

// ============================================================================
// Embeddings
// ============================================================================

pub struct GoogleEmbeddingsModel {
    client: reqwest::Client,
    provider_name: String,
    model: String,
    base_url: String,
    api_key: String,
}

impl GoogleEmbeddingsModel {
    pub(crate) fn new(
        provider: &Provider,
        options: EmbeddingsModelOptions,
        model_name: String,
        api_key: String,
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

    fn content_for(text: &str) -> Value {
        serde_json::json!({ "parts": [{ "text": text }] })
    }
}

#[async_trait]
impl EmbeddingsModel for GoogleEmbeddingsModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed_query(&self, text: &str) -> Result<EmbeddingsResult> {
        let response = self
            .client
            .post(format!(
                "{}/models/{}:embedContent",
                self.base_url, self.model
            ))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&serde_json::json!({ "content": Self::content_for(text) }))
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

        let body: EmbedContentResponse = response.json().await?;
        Ok(EmbeddingsResult {
            embedding: body.embedding.values,
            usage: Usage::default(),
        })
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<BatchEmbeddingsResult> {
        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": Self::content_for(text),
                })
            })
            .collect();

        let response = self
            .client
            .post(format!(
                "{}/models/{}:batchEmbedContents",
                self.base_url, self.model
            ))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&serde_json::json!({ "requests": requests }))
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

        let body: BatchEmbedContentsResponse = response.json().await?;
        Ok(BatchEmbeddingsResult {
            embeddings: body.embeddings.into_iter().map(|e| e.values).collect(),
            usage: Usage::default(),
        })
    }
}

/// GET /models
pub(crate) async fn list_models(base_url: &str, api_key: &str) -> Result<Vec<ModelInfo>> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/models", base_url))
        .header("x-goog-api-key", api_key)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::api(format!(
            "model listing failed with HTTP {}",
            response.status()
        )));
    }
    let body: ListModelsResponse = response.json().await?;
    Ok(body
        .models
        .into_iter()
        .map(|m| ModelInfo {
            display_name: m.display_name,
            id: m
                .name
                .strip_prefix("models/")
                .map(str::to_string)
                .unwrap_or(m.name),
        })
        .collect())
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTools>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<FileData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl WirePart {
    fn text(text: impl Into<String>) -> Self {
        WirePart {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct FileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct FunctionCallingConfig {
    mode: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedContentsResponse {
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
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
    fn test_system_message_becomes_instruction() {
        let history = vec![Message::system("be brief"), Message::user_text("hi")];
        let (contents, system) = to_wire_contents(&history, "google").unwrap();
        assert_eq!(contents.len(), 1);
        let system = system.unwrap();
        assert!(system.role.is_none());
        assert_eq!(system.parts[0].text.as_deref(), Some("be brief"));
    }

    #[test]
    fn test_model_turn_drops_ids_from_function_calls() {
        let history = vec![Message::model(vec![Part::tool_call(
            "call_abc",
            "weather",
            args(&[("city", json!("Boston"))]),
        )])];
        let (contents, _) = to_wire_contents(&history, "google").unwrap();
        let value = serde_json::to_value(&contents).unwrap();
        assert_eq!(value[0]["role"], json!("model"));
        let call = &value[0]["parts"][0]["functionCall"];
        assert_eq!(call["name"], json!("weather"));
        assert_eq!(call["args"]["city"], json!("Boston"));
        assert!(call.get("id").is_none());
    }

    #[test]
    fn test_tool_results_batch_into_one_user_turn() {
        let history = vec![Message::user(vec![
            Part::tool_ok("c1", "weather", json!({"temp": 20})),
            Part::tool_error("c2", "temperature", "no data"),
        ])];
        let (contents, _) = to_wire_contents(&history, "google").unwrap();
        assert_eq!(contents.len(), 1);
        let value = serde_json::to_value(&contents).unwrap();
        assert_eq!(value[0]["role"], json!("user"));
        let parts = value[0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["functionResponse"]["name"], json!("weather"));
        assert_eq!(
            parts[0]["functionResponse"]["response"]["temp"],
            json!(20)
        );
        assert_eq!(
            parts[1]["functionResponse"]["response"]["error"],
            json!("no data")
        );
    }

    #[test]
    fn test_non_object_tool_payload_is_wrapped() {
        let part = crate::message::ToolResultPart {
            id: "c1".to_string(),
            name: "lookup".to_string(),
            outcome: crate::message::ToolOutcome::Ok {
                value: json!("plain string"),
            },
        };
        assert_eq!(
            tool_response_value(&part),
            json!({"result": "plain string"})
        );
    }

    #[test]
    fn test_image_data_becomes_inline_data() {
        let history = vec![Message::user(vec![Part::data(vec![1, 2, 3], "image/png")])];
        let (contents, _) = to_wire_contents(&history, "google").unwrap();
        let value = serde_json::to_value(&contents).unwrap();
        let inline = &value[0]["parts"][0]["inlineData"];
        assert_eq!(inline["mimeType"], json!("image/png"));
        assert_eq!(inline["data"], json!("AQID"));
    }

    #[test]
    fn test_adapt_schema_marks_optional_properties_nullable() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "city": {"type": "string"},
                "country": {"type": "string"}
            },
            "required": ["city"],
            "additionalProperties": false
        }));
        let adapted = adapt_schema(&schema).unwrap();
        assert!(adapted.get("additionalProperties").is_none());
        assert!(adapted["properties"]["city"].get("nullable").is_none());
        assert_eq!(
            adapted["properties"]["country"]["nullable"],
            json!(true)
        );
        assert_eq!(adapted["required"], json!(["city"]));
    }

    #[test]
    fn test_adapt_schema_resolves_refs_and_recurses() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "tags": {
                    "type": "array",
                    "items": {"$ref": "#/$defs/tag"}
                }
            },
            "required": ["tags"],
            "$defs": {
                "tag": {
                    "type": "object",
                    "properties": {"label": {"type": "string"}},
                    "required": ["label"]
                }
            }
        }));
        let adapted = adapt_schema(&schema).unwrap();
        let items = &adapted["properties"]["tags"]["items"];
        assert_eq!(items["type"], json!("object"));
        assert!(items["properties"]["label"].get("nullable").is_none());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), FinishReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(map_finish_reason("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(
            map_finish_reason("MALFORMED_FUNCTION_CALL"),
            FinishReason::Error
        );
        assert_eq!(map_finish_reason("OTHER"), FinishReason::Unspecified);
    }
}
