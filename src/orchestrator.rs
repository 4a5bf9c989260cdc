//! The iterated drive loop: stream a model response, accumulate it,
//! detect tool calls, execute them, splice the results into history and
//! re-stream until the model finishes.
//!
//! Cancellation is drop-based. The returned stream owns the model handle
//! and the in-flight provider stream; abandoning it closes the connection
//! and skips any pending tool invocations.

use crate::accumulator;
use crate::coordinator::ToolIdCoordinator;
use crate::error::Result;
use crate::message::{Message, Part, ToolCallPart};
use crate::model::{ChatModel, ChatResult, FinishReason, Usage};
use crate::schema::JsonSchema;
use crate::tool::{Tool, ToolExecutor, ToolSet};
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::mem;
use std::sync::Arc;

/// Upper bound on tool-calling rounds within one conversation
pub const DEFAULT_ITERATION_CAP: usize = 10;

/// Name of the synthetic tool injected for tool-based typed output
pub const RETURN_RESULT_TOOL: &str = "return_result";

/// Per-request mutable state, exclusively owned by one orchestrator run
pub struct StreamingState {
    pub history: Vec<Message>,
    pub tools: ToolSet,
    pub accumulated: Message,
    pub last_frame: Option<ChatResult<Message>>,
    pub done: bool,
    pub should_prefix_next_message: bool,
    pub is_first_chunk_of_message: bool,
    pub coordinator: ToolIdCoordinator,
    pub suppressed_text: Vec<String>,
    pub suppressed_call_metadata: Map<String, Value>,
    pub total_usage: Usage,
}

impl StreamingState {
    pub fn new(history: Vec<Message>, tools: ToolSet) -> Self {
        Self {
            history,
            tools,
            accumulated: Message::model(Vec::new()),
            last_frame: None,
            done: false,
            should_prefix_next_message: false,
            is_first_chunk_of_message: true,
            coordinator: ToolIdCoordinator::new(),
            suppressed_text: Vec::new(),
            suppressed_call_metadata: Map::new(),
            total_usage: Usage::default(),
        }
    }
}

/// The plain multi-turn loop
pub struct DefaultStreamingOrchestrator {
    pub iteration_cap: usize,
}

impl Default for DefaultStreamingOrchestrator {
    fn default() -> Self {
        Self {
            iteration_cap: DEFAULT_ITERATION_CAP,
        }
    }
}

impl DefaultStreamingOrchestrator {
    pub fn new(iteration_cap: usize) -> Self {
        Self { iteration_cap }
    }

    pub fn run(
        self,
        model: Arc<dyn ChatModel>,
        state: StreamingState,
    ) -> impl Stream<Item = Result<ChatResult<String>>> + Send {
        drive(model, state, self.iteration_cap, false)
    }
}

/// How a typed-output request reaches the schema-conforming payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedOutputStrategy {
    /// The model is configured with a JSON-schema response format and the
    /// consolidated text is the payload.
    Native,
    /// A synthetic `return_result` tool is injected; the payload is the
    /// arguments of its call.
    ReturnResultTool,
}

/// The loop used when the caller supplies an output schema
pub struct TypedOutputStreamingOrchestrator {
    pub iteration_cap: usize,
    pub strategy: TypedOutputStrategy,
}

impl TypedOutputStreamingOrchestrator {
    pub fn new(iteration_cap: usize, strategy: TypedOutputStrategy) -> Self {
        Self {
            iteration_cap,
            strategy,
        }
    }

    pub fn run(
        self,
        model: Arc<dyn ChatModel>,
        state: StreamingState,
    ) -> impl Stream<Item = Result<ChatResult<String>>> + Send {
        let intercept = matches!(self.strategy, TypedOutputStrategy::ReturnResultTool);
        drive(model, state, self.iteration_cap, intercept)
    }
}

/// The synthetic tool whose input schema is the caller's output schema.
/// The handler only echoes its arguments; the orchestrator intercepts the
/// call before dispatch, so the handler exists for the pairing invariant,
/// not for real work.
pub fn return_result_tool(schema: JsonSchema) -> Tool {
    Tool::new(
        RETURN_RESULT_TOOL,
        "Return the final result of this conversation to the caller. \
         Call this exactly once, with the complete result as arguments.",
        schema,
        |arguments| async move { Ok(Value::Object(arguments)) },
    )
}

fn drive(
    model: Arc<dyn ChatModel>,
    mut state: StreamingState,
    iteration_cap: usize,
    intercept_return_result: bool,
) -> impl Stream<Item = Result<ChatResult<String>>> + Send {
    let cap = iteration_cap.max(1);

    async_stream::stream! {
        let mut iterations = 0usize;

        loop {
            if iterations >= cap {
                log::warn!(
                    "tool-calling iteration cap ({}) reached; terminating conversation",
                    cap
                );
                let mut capped = ChatResult::new(String::new());
                capped.finish_reason = FinishReason::Error;
                capped.usage = state.total_usage;
                capped
                    .metadata
                    .insert("iteration_cap".to_string(), json!(cap));
                state.done = true;
                yield Ok(capped);
                return;
            }
            iterations += 1;

            // Reset per-message state
            state.accumulated = Message::model(Vec::new());
            state.is_first_chunk_of_message = true;

            let mut frames = match model.send_stream(&state.history).await {
                Ok(frames) => frames,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            while let Some(frame_result) = frames.next().await {
                let frame = match frame_result {
                    Ok(frame) => frame,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };

                let text = frame.output.text();
                if !text.is_empty() {
                    if intercept_return_result {
                        // Ancillary text around a return_result call is not
                        // part of the payload; hold it for metadata.
                        state.suppressed_text.push(text);
                    } else {
                        let prefix =
                            state.should_prefix_next_message && state.is_first_chunk_of_message;
                        let mut chunk = ChatResult::new(if prefix {
                            format!("\n{}", text)
                        } else {
                            text
                        });
                        chunk.id = frame.id.clone();
                        state.is_first_chunk_of_message = false;
                        yield Ok(chunk);
                    }
                }

                accumulator::accumulate(&mut state.accumulated, &frame.output);
                state.total_usage.add(&frame.usage);
                state.last_frame = Some(frame);
            }
            drop(frames);

            let mut final_message =
                accumulator::consolidate(mem::replace(&mut state.accumulated, Message::model(Vec::new())));

            // Register every call, minting ids the provider did not supply
            let mut calls: Vec<ToolCallPart> = Vec::new();
            for part in final_message.parts.iter_mut() {
                if let Part::ToolCall(call) = part {
                    let id = state.coordinator.register_call(
                        if call.id.is_empty() {
                            None
                        } else {
                            Some(call.id.as_str())
                        },
                        &call.name,
                    );
                    call.id = id;
                    calls.push(call.clone());
                }
            }

            state.history.push(final_message.clone());

            let (frame_finish, frame_metadata, frame_id) = match &state.last_frame {
                Some(frame) => (
                    frame.finish_reason,
                    frame.metadata.clone(),
                    frame.id.clone(),
                ),
                None => (FinishReason::Unspecified, Map::new(), None),
            };

            if calls.is_empty() {
                let mut done = ChatResult::new(String::new());
                done.messages = vec![final_message];
                done.finish_reason = frame_finish;
                done.metadata = frame_metadata;
                done.usage = state.total_usage;
                done.id = frame_id;
                state.done = true;
                yield Ok(done);
                return;
            }

            // Message boundary: surface the consolidated model turn
            let mut boundary = ChatResult::new(String::new());
            boundary.messages = vec![final_message];
            boundary.finish_reason = FinishReason::ToolCalls;
            boundary.metadata = frame_metadata;
            boundary.id = frame_id.clone();
            yield Ok(boundary);

            let return_call = if intercept_return_result {
                calls.iter().find(|call| call.name == RETURN_RESULT_TOOL).cloned()
            } else {
                None
            };

            // Execute the batch sequentially; results keep call order. A
            // return_result call is answered synthetically, not dispatched.
            let mut result_parts = Vec::with_capacity(calls.len());
            for call in &calls {
                if return_call.as_ref().is_some_and(|rr| rr.id == call.id) {
                    result_parts.push(Part::tool_ok(
                        call.id.clone(),
                        call.name.clone(),
                        Value::Object(call.arguments.clone()),
                    ));
                } else {
                    let result = ToolExecutor::execute_single(call, &state.tools).await;
                    result_parts.push(Part::ToolResult(result));
                }
                state.coordinator.consume(&call.id);
            }

            let results_message = Message::user(result_parts);
            state.history.push(results_message.clone());
            state.should_prefix_next_message = true;

            if let Some(call) = return_call {
                let payload = Value::Object(call.arguments.clone()).to_string();
                state
                    .suppressed_call_metadata
                    .insert("tool_call_id".to_string(), json!(call.id));
                state
                    .suppressed_call_metadata
                    .insert("tool_name".to_string(), json!(call.name));

                let mut done = ChatResult::new(payload);
                done.messages = vec![results_message];
                done.finish_reason = FinishReason::Stop;
                done.usage = state.total_usage;
                done.id = frame_id;
                if !state.suppressed_text.is_empty() {
                    done.metadata.insert(
                        "suppressed_text".to_string(),
                        json!(state.suppressed_text.join("")),
                    );
                }
                done.metadata.insert(
                    "suppressed_tool_call".to_string(),
                    Value::Object(state.suppressed_call_metadata.clone()),
                );
                state.done = true;
                yield Ok(done);
                return;
            }

            let mut splice = ChatResult::new(String::new());
            splice.messages = vec![results_message];
            splice.finish_reason = FinishReason::ToolCalls;
            yield Ok(splice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_clean() {
        let state = StreamingState::new(vec![Message::user_text("hi")], ToolSet::default());
        assert_eq!(state.history.len(), 1);
        assert!(state.is_first_chunk_of_message);
        assert!(!state.should_prefix_next_message);
        assert!(!state.done);
        assert!(state.coordinator.is_empty());
    }

    #[test]
    fn test_return_result_tool_shape() {
        let schema = JsonSchema::object(vec![("city", JsonSchema::string())], &["city"]);
        let tool = return_result_tool(schema.clone());
        assert_eq!(tool.name, RETURN_RESULT_TOOL);
        assert_eq!(tool.input_schema, schema);
    }

    #[tokio::test]
    async fn test_return_result_tool_echoes_arguments() {
        let schema = JsonSchema::object(vec![("city", JsonSchema::string())], &["city"]);
        let tool = return_result_tool(schema);
        let mut arguments = Map::new();
        arguments.insert("city".to_string(), json!("Chicago"));
        let value = tool.invoke(arguments.clone()).await.unwrap();
        assert_eq!(value, Value::Object(arguments));
    }

    #[test]
    fn test_default_orchestrator_cap() {
        let orchestrator = DefaultStreamingOrchestrator::default();
        assert_eq!(orchestrator.iteration_cap, DEFAULT_ITERATION_CAP);
    }
}
