//! Tool definitions and sequential execution.
//!
//! A [`Tool`] pairs a name, a description and a JSON-schema parameter
//! declaration with an async handler. Handlers are stored as pinned boxed
//! futures behind an `Arc` so tools of different concrete types live in
//! one [`ToolSet`] and can be shared across concurrent requests.

use crate::message::{Part, ToolCallPart, ToolOutcome, ToolResultPart};
use crate::schema::JsonSchema;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type ToolFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Map<String, Value>) -> ToolFuture + Send + Sync>;

/// A callable tool exposed to the model
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: JsonSchema,
    handler: ToolHandler,
}

impl Tool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: JsonSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Invoke the handler. An absent argument map is passed as empty.
    pub async fn invoke(&self, arguments: Map<String, Value>) -> std::result::Result<Value, String> {
        (self.handler)(arguments).await
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Start building a tool: `tool("weather", "Current weather").schema(...).build(handler)`
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder {
        name: name.into(),
        description: description.into(),
        schema: None,
    }
}

pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Option<JsonSchema>,
}

impl ToolBuilder {
    pub fn schema(mut self, schema: JsonSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        let schema = self
            .schema
            .unwrap_or_else(|| JsonSchema::object(Vec::new(), &[]));
        Tool::new(self.name, self.description, schema, handler)
    }
}

/// Immutable name -> tool snapshot held by one request
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<Tool>>,
}

impl ToolSet {
    pub fn new(tools: &[Arc<Tool>]) -> Self {
        let mut map = HashMap::new();
        for tool in tools {
            map.insert(tool.name.clone(), Arc::clone(tool));
        }
        Self { tools: map }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Tool>> {
        self.tools.get(name)
    }

    pub fn insert(&mut self, tool: Arc<Tool>) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }
}

/// Sequential batch executor. Tool failures become error-carrying result
/// parts; only system-level errors escape the orchestrator.
pub struct ToolExecutor;

impl ToolExecutor {
    /// Execute every call in order; results preserve call order.
    pub async fn execute_batch(calls: &[ToolCallPart], tools: &ToolSet) -> Vec<ToolResultPart> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(Self::execute_single(call, tools).await);
        }
        results
    }

    pub async fn execute_single(call: &ToolCallPart, tools: &ToolSet) -> ToolResultPart {
        let Some(tool) = tools.get(&call.name) else {
            log::warn!("model invoked unregistered tool '{}'", call.name);
            return ToolResultPart {
                id: call.id.clone(),
                name: call.name.clone(),
                outcome: ToolOutcome::Error {
                    message: format!("Tool {} not found", call.name),
                },
            };
        };

        log::debug!("executing tool '{}' ({})", call.name, call.id);
        let outcome = match tool.invoke(call.arguments.clone()).await {
            Ok(value) => ToolOutcome::Ok { value },
            Err(message) => {
                log::debug!("tool '{}' failed: {}", call.name, message);
                ToolOutcome::Error { message }
            }
        };

        ToolResultPart {
            id: call.id.clone(),
            name: call.name.clone(),
            outcome,
        }
    }

    /// Convenience for the orchestrator: wrap a batch of results as the
    /// parts of a single user-role message.
    pub fn results_to_parts(results: Vec<ToolResultPart>) -> Vec<Part> {
        results.into_iter().map(Part::ToolResult).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_tool() -> Arc<Tool> {
        Arc::new(
            tool("weather", "Current weather for a location")
                .schema(JsonSchema::object(
                    vec![("location", JsonSchema::string())],
                    &["location"],
                ))
                .build(|args| async move {
                    let location = args
                        .get("location")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "missing location".to_string())?;
                    Ok(json!({"location": location, "temp": 21, "cond": "sunny"}))
                }),
        )
    }

    fn call(id: &str, name: &str, args_value: Value) -> ToolCallPart {
        ToolCallPart {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args_value.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_execute_success() {
        let tools = ToolSet::new(&[weather_tool()]);
        let result =
            ToolExecutor::execute_single(&call("c1", "weather", json!({"location": "Boston"})), &tools)
                .await;
        assert_eq!(result.id, "c1");
        assert_eq!(result.name, "weather");
        match result.outcome {
            ToolOutcome::Ok { value } => assert_eq!(value["location"], json!("Boston")),
            ToolOutcome::Error { message } => panic!("unexpected error: {}", message),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let tools = ToolSet::new(&[]);
        let result =
            ToolExecutor::execute_single(&call("c1", "missing", json!({})), &tools).await;
        match result.outcome {
            ToolOutcome::Error { message } => {
                assert_eq!(message, "Tool missing not found")
            }
            _ => panic!("expected error outcome"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_result() {
        let tools = ToolSet::new(&[weather_tool()]);
        // Missing required argument makes the handler fail
        let result = ToolExecutor::execute_single(&call("c1", "weather", json!({})), &tools).await;
        assert!(result.outcome.is_error());
    }

    #[tokio::test]
    async fn test_batch_preserves_call_order() {
        let tools = ToolSet::new(&[weather_tool()]);
        let calls = vec![
            call("c1", "weather", json!({"location": "Seattle"})),
            call("c2", "missing", json!({})),
            call("c3", "weather", json!({"location": "Chicago"})),
        ];
        let results = ToolExecutor::execute_batch(&calls, &tools).await;
        assert_eq!(
            results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3"]
        );
        assert!(!results[0].outcome.is_error());
        assert!(results[1].outcome.is_error());
        assert!(!results[2].outcome.is_error());
    }

    #[test]
    fn test_toolset_lookup() {
        let set = ToolSet::new(&[weather_tool()]);
        assert!(set.get("weather").is_some());
        assert!(set.get("nope").is_none());
        assert_eq!(set.len(), 1);
    }
}
