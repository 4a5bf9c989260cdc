//! Provider-neutral agent runtime for multi-turn tool-calling LLM
//! conversations.
//!
//! One [`Agent`] API works across OpenAI-style chat completions,
//! Anthropic Messages, Google Gemini and OpenAI-compatible proxies. The
//! runtime streams responses, stitches partial chunks into whole
//! messages, dispatches tool calls, splices their results back into
//! history and re-streams until the model is done.
//!
//! ```no_run
//! use agentic::{tool, Agent, JsonSchema};
//! use serde_json::json;
//!
//! # async fn example() -> agentic::Result<()> {
//! let weather = tool("weather", "Current weather for a location")
//!     .schema(JsonSchema::object(
//!         vec![("location", JsonSchema::string())],
//!         &["location"],
//!     ))
//!     .build(|args| async move {
//!         let _ = args;
//!         Ok(json!({"temp": 21, "cond": "sunny"}))
//!     });
//!
//! let agent = Agent::new("openai:gpt-4o")?.with_tool(weather);
//! let result = agent.send("What's the weather in Boston?").await?;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod agent;
pub mod coordinator;
pub mod environment;
pub mod error;
pub mod message;
pub mod model;
pub mod orchestrator;
pub mod providers;
pub mod schema;
pub mod tool;


pub use agent::{Agent, AgentStream, SendOptions};
pub use coordinator::ToolIdCoordinator;
pub use environment::AgentEnvironment;
pub use error::{Error, Result};
pub use message::{
    validate_history, Message, Part, Role, ToolCallPart, ToolOutcome, ToolResultPart,
};
pub use model::{
    BatchEmbeddingsResult, ChatModel, ChatModelOptions, ChatResult, ChatStream, EmbeddingsModel,
    EmbeddingsModelOptions, EmbeddingsResult, FinishReason, Usage,
};
pub use orchestrator::{
    DefaultStreamingOrchestrator, StreamingState, TypedOutputStrategy,
    TypedOutputStreamingOrchestrator, DEFAULT_ITERATION_CAP, RETURN_RESULT_TOOL,
};
pub use providers::{Capability, ModelInfo, ModelSpec, Provider, Providers};
pub use schema::JsonSchema;
pub use tool::{tool, Tool, ToolExecutor, ToolSet};
