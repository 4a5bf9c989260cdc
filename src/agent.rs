//! The user-facing facade: bind a provider, a tool set and a
//! conversation method, then drive conversations to completion.
//!
//! An agent holds no conversational state. History is a parameter and the
//! caller owns it; every `send*` call builds its own [`StreamingState`],
//! constructs the chat model lazily and drops it at return.

use crate::error::{Error, Result};
use crate::message::{Message, Part, Role};
use crate::model::{
    BatchEmbeddingsResult, ChatModelOptions, ChatResult, EmbeddingsModelOptions,
    EmbeddingsResult, FinishReason, Usage,
};
use crate::orchestrator::{
    return_result_tool, DefaultStreamingOrchestrator, StreamingState,
    TypedOutputStrategy, TypedOutputStreamingOrchestrator, DEFAULT_ITERATION_CAP,
};
use crate::providers::{Capability, ModelSpec, Provider, Providers};
use crate::schema::JsonSchema;
use crate::tool::{Tool, ToolSet};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of user-facing chunks; the final element carries the finish
/// reason and the summed usage.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<ChatResult<String>>> + Send>>;

/// Optional inputs to a `send*` call
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Prior conversation, owned by the caller and passed by value
    pub history: Vec<Message>,
    /// Extra parts appended to the prompt message (images, files, links)
    pub attachments: Vec<Part>,
}

#[derive(Debug)]
pub struct Agent {
    provider: Arc<Provider>,
    spec: ModelSpec,
    tools: Vec<Arc<Tool>>,
    system: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    api_key: Option<String>,
    base_url: Option<String>,
    iteration_cap: usize,
}

impl Agent {
    /// Parse a model string (`openai`, `openai:gpt-4o`,
    /// `openai?chat=gpt-4o&embeddings=...`) and resolve its provider.
    /// Credentials are not checked here; a missing API key surfaces when
    /// the first model is constructed.
    pub fn new(model: &str) -> Result<Self> {
        let spec = ModelSpec::parse(model)?;
        let provider = Providers::get(&spec.provider)?;
        Ok(Self {
            provider,
            spec,
            tools: Vec::new(),
            system: None,
            temperature: None,
            max_tokens: None,
            api_key: None,
            base_url: None,
            iteration_cap: DEFAULT_ITERATION_CAP,
        })
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Tool>) -> Self {
        self.tools.extend(tools.into_iter().map(Arc::new));
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_iteration_cap(mut self, cap: usize) -> Self {
        self.iteration_cap = cap;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn model_spec(&self) -> &ModelSpec {
        &self.spec
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    pub async fn send(&self, prompt: impl Into<String>) -> Result<ChatResult<String>> {
        self.send_with(prompt, SendOptions::default()).await
    }

    pub async fn send_with(
        &self,
        prompt: impl Into<String>,
        options: SendOptions,
    ) -> Result<ChatResult<String>> {
        let user_message = user_message(prompt.into(), &options.attachments);
        let stream = self.open_stream(user_message.clone(), options.history, None)?;
        let mut result = collect(stream).await?;
        result.messages.insert(0, user_message);
        Ok(result)
    }

    pub fn send_stream(&self, prompt: impl Into<String>) -> Result<AgentStream> {
        self.send_stream_with(prompt, SendOptions::default())
    }

    pub fn send_stream_with(
        &self,
        prompt: impl Into<String>,
        options: SendOptions,
    ) -> Result<AgentStream> {
        let user_message = user_message(prompt.into(), &options.attachments);
        self.open_stream(user_message, options.history, None)
    }

    /// Request a response conforming to `schema`, deserialized into `T`.
    pub async fn send_for<T: DeserializeOwned>(
        &self,
        prompt: impl Into<String>,
        schema: JsonSchema,
    ) -> Result<ChatResult<T>> {
        self.send_for_with(prompt, schema, SendOptions::default())
            .await
    }

    pub async fn send_for_with<T: DeserializeOwned>(
        &self,
        prompt: impl Into<String>,
        schema: JsonSchema,
        options: SendOptions,
    ) -> Result<ChatResult<T>> {
        let user_message = user_message(prompt.into(), &options.attachments);
        let stream = self.open_stream(user_message.clone(), options.history, Some(schema))?;
        let mut result = collect(stream).await?;
        result.messages.insert(0, user_message);
        let typed: T = serde_json::from_str(&result.output)?;
        Ok(result.map_output(|_| typed))
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    pub async fn embed_query(&self, text: &str) -> Result<EmbeddingsResult> {
        let model = self.provider.create_embeddings_model(self.embeddings_options())?;
        model.embed_query(text).await
    }

    pub async fn embed_documents(&self, texts: &[String]) -> Result<BatchEmbeddingsResult> {
        let model = self.provider.create_embeddings_model(self.embeddings_options())?;
        model.embed_documents(texts).await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn chat_options(
        &self,
        output_schema: Option<JsonSchema>,
        tools: &[Arc<Tool>],
    ) -> ChatModelOptions {
        ChatModelOptions {
            model_name: self.spec.chat.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.to_vec(),
            output_schema,
        }
    }

    fn embeddings_options(&self) -> EmbeddingsModelOptions {
        EmbeddingsModelOptions {
            model_name: self.spec.embeddings.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
        }
    }

    fn open_stream(
        &self,
        user_message: Message,
        history: Vec<Message>,
        output_schema: Option<JsonSchema>,
    ) -> Result<AgentStream> {
        let full_history = compose_history(
            self.system.as_deref(),
            history,
            user_message,
        );

        match output_schema {
            None => {
                let model = self
                    .provider
                    .create_chat_model(self.chat_options(None, &self.tools))?;
                let state = StreamingState::new(full_history, ToolSet::new(&self.tools));
                let orchestrator = DefaultStreamingOrchestrator::new(self.iteration_cap);
                Ok(Box::pin(orchestrator.run(Arc::from(model), state)))
            }
            Some(schema) => {
                let strategy =
                    typed_output_strategy(&self.provider, !self.tools.is_empty());
                match strategy {
                    TypedOutputStrategy::Native => {
                        let model = self
                            .provider
                            .create_chat_model(self.chat_options(Some(schema), &self.tools))?;
                        let state =
                            StreamingState::new(full_history, ToolSet::new(&self.tools));
                        let orchestrator = TypedOutputStreamingOrchestrator::new(
                            self.iteration_cap,
                            strategy,
                        );
                        Ok(Box::pin(orchestrator.run(Arc::from(model), state)))
                    }
                    TypedOutputStrategy::ReturnResultTool => {
                        let mut tools = self.tools.clone();
                        tools.push(Arc::new(return_result_tool(schema)));
                        let model = self
                            .provider
                            .create_chat_model(self.chat_options(None, &tools))?;
                        let state = StreamingState::new(full_history, ToolSet::new(&tools));
                        let orchestrator = TypedOutputStreamingOrchestrator::new(
                            self.iteration_cap,
                            strategy,
                        );
                        Ok(Box::pin(orchestrator.run(Arc::from(model), state)))
                    }
                }
            }
        }
    }
}

/// Native typed output needs the capability, and additionally the
/// with-tools variant when user tools are present; everything else takes
/// the `return_result` route.
pub(crate) fn typed_output_strategy(provider: &Provider, has_tools: bool) -> TypedOutputStrategy {
    let native = provider.has_capability(Capability::TypedOutput)
        && (!has_tools || provider.has_capability(Capability::TypedOutputWithTools));
    if native {
        TypedOutputStrategy::Native
    } else {
        TypedOutputStrategy::ReturnResultTool
    }
}

fn user_message(prompt: String, attachments: &[Part]) -> Message {
    let mut parts = vec![Part::text(prompt)];
    parts.extend(attachments.iter().cloned());
    Message::user(parts)
}

/// `system? + caller history + prompt`. A caller-supplied leading system
/// message wins over the agent's own.
pub(crate) fn compose_history(
    system: Option<&str>,
    history: Vec<Message>,
    user_message: Message,
) -> Vec<Message> {
    let mut composed = Vec::with_capacity(history.len() + 2);
    if let Some(system) = system {
        let caller_has_system = matches!(history.first(), Some(m) if m.role == Role::System);
        if !caller_has_system {
            composed.push(Message::system(system));
        }
    }
    composed.extend(history);
    composed.push(user_message);
    composed
}

/// Fold a chunk stream into one result: outputs concatenate, boundary
/// messages append, the terminal element supplies finish reason, usage,
/// metadata and id.
pub(crate) async fn collect(mut stream: AgentStream) -> Result<ChatResult<String>> {
    let mut output = String::new();
    let mut messages = Vec::new();
    let mut finish_reason = FinishReason::Unspecified;
    let mut metadata = serde_json::Map::new();
    let mut usage = Usage::default();
    let mut id = None;

    while let Some(item) = stream.next().await {
        let item = item?;
        output.push_str(&item.output);
        messages.extend(item.messages);
        if item.finish_reason != FinishReason::Unspecified {
            finish_reason = item.finish_reason;
        }
        if !item.usage.is_empty() {
            usage = item.usage;
        }
        for (key, value) in item.metadata {
            metadata.insert(key, value);
        }
        if item.id.is_some() {
            id = item.id;
        }
    }

    Ok(ChatResult {
        id,
        output,
        messages,
        finish_reason,
        metadata,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_unknown_provider() {
        let err = Agent::new("martian:probe-1").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_new_rejects_malformed_model_string() {
        assert!(Agent::new("").is_err());
        assert!(Agent::new("openai?bogus=1").is_err());
    }

    #[test]
    #[cfg(feature = "openai")]
    fn test_new_resolves_alias_and_model_name() {
        let agent = Agent::new("gpt:gpt-4o-mini").unwrap();
        assert_eq!(agent.provider().name, "openai");
        assert_eq!(agent.model_spec().chat.as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    #[cfg(feature = "openai")]
    fn test_agent_construction_needs_no_credentials() {
        // Key resolution is lazy; constructing the agent must not fail
        // even with no key anywhere.
        let agent = Agent::new("openai").unwrap().with_iteration_cap(3);
        assert_eq!(agent.iteration_cap, 3);
    }

    #[test]
    fn test_compose_history_inserts_system_once() {
        let composed = compose_history(
            Some("be brief"),
            vec![Message::user_text("a"), Message::model_text("b")],
            Message::user_text("c"),
        );
        assert_eq!(composed.len(), 4);
        assert_eq!(composed[0].role, Role::System);
        assert_eq!(composed[3].text(), "c");
    }

    #[test]
    fn test_compose_history_keeps_caller_system() {
        let composed = compose_history(
            Some("agent system"),
            vec![Message::system("caller system"), Message::user_text("a"), Message::model_text("b")],
            Message::user_text("c"),
        );
        assert_eq!(composed[0].text(), "caller system");
        assert_eq!(
            composed.iter().filter(|m| m.role == Role::System).count(),
            1
        );
    }

    #[test]
    #[cfg(all(feature = "openai", feature = "anthropic"))]
    fn test_typed_output_strategy_selection() {
        let openai = Providers::get("openai").unwrap();
        let anthropic = Providers::get("anthropic").unwrap();
        let cohere = Providers::get("cohere").unwrap();

        assert_eq!(
            typed_output_strategy(&openai, false),
            TypedOutputStrategy::Native
        );
        assert_eq!(
            typed_output_strategy(&openai, true),
            TypedOutputStrategy::Native
        );
        // Anthropic has no native typed output at all
        assert_eq!(
            typed_output_strategy(&anthropic, false),
            TypedOutputStrategy::ReturnResultTool
        );
        // Cohere-like: tools force the return_result route
        assert_eq!(
            typed_output_strategy(&cohere, true),
            TypedOutputStrategy::ReturnResultTool
        );
    }

    #[test]
    #[cfg(feature = "google")]
    fn test_google_typed_output_with_tools_uses_return_result() {
        let google = Providers::get("google").unwrap();
        assert_eq!(
            typed_output_strategy(&google, false),
            TypedOutputStrategy::Native
        );
        assert_eq!(
            typed_output_strategy(&google, true),
            TypedOutputStrategy::ReturnResultTool
        );
    }
}
