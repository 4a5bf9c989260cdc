//! Provider-facing model traits and the shared result types.

use crate::error::Result;
use crate::message::Message;
use crate::schema::JsonSchema;
use crate::tool::Tool;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;

/// Token usage for one request or one whole conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn new(prompt: u64, response: u64) -> Self {
        Self {
            prompt_tokens: Some(prompt),
            response_tokens: Some(response),
            total_tokens: Some(prompt + response),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.response_tokens.is_none()
            && self.total_tokens.is_none()
    }

    /// Sum another usage report into this one; absent counters on either
    /// side are treated as zero once the other side reports.
    pub fn add(&mut self, other: &Usage) {
        fn merge(a: &mut Option<u64>, b: Option<u64>) {
            if let Some(value) = b {
                *a = Some(a.unwrap_or(0) + value);
            }
        }
        merge(&mut self.prompt_tokens, other.prompt_tokens);
        merge(&mut self.response_tokens, other.response_tokens);
        merge(&mut self.total_tokens, other.total_tokens);
    }
}

/// Why a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    #[default]
    Unspecified,
}

/// One response element: a streamed frame (`ChatResult<Message>`) or the
/// user-facing result of a whole conversation (`ChatResult<String>` /
/// `ChatResult<T>`).
#[derive(Debug, Clone)]
pub struct ChatResult<T> {
    pub id: Option<String>,
    pub output: T,
    /// Messages added by this element. Streamed text chunks leave this
    /// empty; message-boundary elements carry the consolidated message.
    pub messages: Vec<Message>,
    pub finish_reason: FinishReason,
    pub metadata: Map<String, Value>,
    pub usage: Usage,
}

impl<T> ChatResult<T> {
    pub fn new(output: T) -> Self {
        Self {
            id: None,
            output,
            messages: Vec::new(),
            finish_reason: FinishReason::Unspecified,
            metadata: Map::new(),
            usage: Usage::default(),
        }
    }

    pub fn map_output<U>(self, f: impl FnOnce(T) -> U) -> ChatResult<U> {
        ChatResult {
            id: self.id,
            output: f(self.output),
            messages: self.messages,
            finish_reason: self.finish_reason,
            metadata: self.metadata,
            usage: self.usage,
        }
    }
}

/// A lazy sequence of partial-message frames from a provider.
///
/// Contract for implementors: text arrives as text parts in wire order;
/// tool calls may first appear with empty arguments and are completed by
/// a later frame with the same id; usage and the finish reason are
/// reported exactly once, on the terminal frame.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatResult<Message>>> + Send>>;

/// A chat-capable model bound to one provider endpoint
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// Open one streamed completion over `history`. The returned stream
    /// owns its connection; dropping it cancels the request.
    async fn send_stream(&self, history: &[Message]) -> Result<ChatStream>;
}

/// Options for constructing a chat model through a provider factory
#[derive(Clone, Default)]
pub struct ChatModelOptions {
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Vec<Arc<Tool>>,
    pub output_schema: Option<JsonSchema>,
}

/// Result of embedding a single query
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingsResult {
    pub embedding: Vec<f32>,
    pub usage: Usage,
}

/// Result of embedding a batch of documents
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEmbeddingsResult {
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Usage,
}

#[async_trait]
pub trait EmbeddingsModel: Send + Sync {
    fn name(&self) -> &str;

    async fn embed_query(&self, text: &str) -> Result<EmbeddingsResult>;

    async fn embed_documents(&self, texts: &[String]) -> Result<BatchEmbeddingsResult>;
}

/// Options for constructing an embeddings model
#[derive(Clone, Default)]
pub struct EmbeddingsModelOptions {
    pub model_name: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_add_sums_counters() {
        let mut total = Usage::default();
        total.add(&Usage::new(10, 5));
        total.add(&Usage::new(7, 3));
        assert_eq!(total.prompt_tokens, Some(17));
        assert_eq!(total.response_tokens, Some(8));
        assert_eq!(total.total_tokens, Some(25));
    }

    #[test]
    fn test_usage_add_treats_missing_as_zero() {
        let mut total = Usage::default();
        total.add(&Usage {
            prompt_tokens: Some(4),
            response_tokens: None,
            total_tokens: None,
        });
        assert_eq!(total.prompt_tokens, Some(4));
        assert_eq!(total.response_tokens, None);
        assert!(!total.is_empty());
    }

    #[test]
    fn test_chat_result_map_output() {
        let mut result = ChatResult::new("21".to_string());
        result.finish_reason = FinishReason::Stop;
        let mapped = result.map_output(|s| s.parse::<i32>().unwrap());
        assert_eq!(mapped.output, 21);
        assert_eq!(mapped.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_finish_reason_default_is_unspecified() {
        assert_eq!(FinishReason::default(), FinishReason::Unspecified);
    }
}
