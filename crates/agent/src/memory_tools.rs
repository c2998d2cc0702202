//! Memory operations exposed as ordinary registry tools, so every read and
//! write of agent memory is gated and audited like any other call.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use tollgate_core::memory::{MemoryStore, NewUsage};

use crate::tools::{Tool, ToolContext, ToolError, ToolRegistry};

pub const SEARCH_USAGE_TOOL: &str = "search_saved_correct_tool_uses";
pub const SAVE_USAGE_TOOL: &str = "save_question_tool_args";
pub const SAVE_TEXT_TOOL: &str = "save_text_memory";
pub const SEARCH_TEXT_TOOL: &str = "search_text_memories";

const DEFAULT_LIMIT: usize = 5;
const DEFAULT_THRESHOLD: f32 = 0.7;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

/// Registers all four memory tools with no required groups.
pub fn register_memory_tools(
    registry: &mut ToolRegistry,
    memory: Arc<dyn MemoryStore>,
) -> Result<(), ToolError> {
    let unrestricted: [&str; 0] = [];
    registry.register(SearchUsageTool { memory: Arc::clone(&memory) }, unrestricted)?;
    registry.register(SaveUsageTool { memory: Arc::clone(&memory) }, unrestricted)?;
    registry.register(SaveTextTool { memory: Arc::clone(&memory) }, unrestricted)?;
    registry.register(SearchTextTool { memory }, unrestricted)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SearchUsageArgs {
    question: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_threshold")]
    similarity_threshold: f32,
    #[serde(default)]
    tool_name: Option<String>,
}

pub struct SearchUsageTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for SearchUsageTool {
    fn name(&self) -> &str {
        SEARCH_USAGE_TOOL
    }

    fn description(&self) -> &str {
        "Search previously saved successful tool calls for questions similar to this one"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "default": DEFAULT_LIMIT},
                "similarity_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "default": DEFAULT_THRESHOLD
                },
                "tool_name": {"type": "string"}
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<Value> {
        let args: SearchUsageArgs = serde_json::from_value(arguments)?;
        let hits = self
            .memory
            .search_usage(
                &args.question,
                args.limit,
                args.similarity_threshold,
                args.tool_name.as_deref(),
            )
            .await?;
        let matches: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "id": hit.record.id,
                    "question": hit.record.question,
                    "tool_name": hit.record.tool_name,
                    "args": hit.record.arguments,
                    "success": hit.record.success,
                    "similarity": hit.score,
                    "saved_at": hit.record.timestamp,
                })
            })
            .collect();
        Ok(json!({"count": matches.len(), "matches": matches}))
    }
}

#[derive(Debug, Deserialize)]
struct SaveUsageArgs {
    question: String,
    tool_name: String,
    #[serde(default)]
    args: Map<String, Value>,
}

pub struct SaveUsageTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for SaveUsageTool {
    fn name(&self) -> &str {
        SAVE_USAGE_TOOL
    }

    fn description(&self) -> &str {
        "Save a question together with the tool and arguments that answered it correctly"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "tool_name": {"type": "string"},
                "args": {"type": "object"}
            },
            "required": ["question", "tool_name", "args"]
        })
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<Value> {
        let args: SaveUsageArgs = serde_json::from_value(arguments)?;
        let usage = NewUsage::new(args.question, args.tool_name, Value::Object(args.args))
            .with_metadata("saved_by", Value::String(context.principal.id.clone()))
            .with_metadata("conversation_id", Value::String(context.conversation_id.clone()));
        let record = self.memory.write_usage(usage).await?;
        Ok(json!({"saved": true, "id": record.id, "tool_name": record.tool_name}))
    }
}

#[derive(Debug, Deserialize)]
struct SaveTextArgs {
    content: String,
}

pub struct SaveTextTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for SaveTextTool {
    fn name(&self) -> &str {
        SAVE_TEXT_TOOL
    }

    fn description(&self) -> &str {
        "Save a piece of domain knowledge such as a business definition or schema note"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"content": {"type": "string"}},
            "required": ["content"]
        })
    }

    async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<Value> {
        let args: SaveTextArgs = serde_json::from_value(arguments)?;
        let record = self.memory.write_text(&args.content).await?;
        Ok(json!({"saved": true, "id": record.id}))
    }
}

#[derive(Debug, Deserialize)]
struct SearchTextArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_threshold")]
    similarity_threshold: f32,
}

pub struct SearchTextTool {
    memory: Arc<dyn MemoryStore>,
}

#[async_trait]
impl Tool for SearchTextTool {
    fn name(&self) -> &str {
        SEARCH_TEXT_TOOL
    }

    fn description(&self) -> &str {
        "Search saved domain knowledge for text similar to the query"
    }

    fn parameter_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1, "default": DEFAULT_LIMIT},
                "similarity_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 1,
                    "default": DEFAULT_THRESHOLD
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<Value> {
        let args: SearchTextArgs = serde_json::from_value(arguments)?;
        let hits =
            self.memory.search_text(&args.query, args.limit, args.similarity_threshold).await?;
        let matches: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "id": hit.record.id,
                    "content": hit.record.content,
                    "similarity": hit.score,
                    "saved_at": hit.record.timestamp,
                })
            })
            .collect();
        Ok(json!({"count": matches.len(), "matches": matches}))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use tollgate_core::audit::InMemoryAuditSink;
    use tollgate_core::domain::principal::Principal;
    use tollgate_core::memory::{InMemoryMemoryStore, MemoryStore};

    use super::{
        register_memory_tools, SAVE_TEXT_TOOL, SAVE_USAGE_TOOL, SEARCH_TEXT_TOOL, SEARCH_USAGE_TOOL,
    };
    use crate::tools::{ToolContext, ToolRegistry};

    fn setup() -> (ToolRegistry, Arc<InMemoryMemoryStore>, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let memory = Arc::new(InMemoryMemoryStore::default());
        let mut registry = ToolRegistry::new(Arc::new(audit.clone()));
        register_memory_tools(&mut registry, memory.clone()).expect("register");
        (registry, memory, audit)
    }

    fn context() -> ToolContext {
        ToolContext::new(Principal::new("analyst-7"), "conv-9", "req-1")
    }

    #[test]
    fn memory_tools_are_visible_to_everyone() {
        let (registry, _, _) = setup();
        let names: Vec<String> = registry
            .schemas_for(&Principal::new("nobody"))
            .into_iter()
            .map(|schema| schema.name)
            .collect();
        assert_eq!(
            names,
            vec![SEARCH_USAGE_TOOL, SAVE_USAGE_TOOL, SAVE_TEXT_TOOL, SEARCH_TEXT_TOOL]
        );
    }

    #[tokio::test]
    async fn saved_usage_is_found_again_and_stamped_with_caller() {
        let (registry, memory, audit) = setup();
        let saved = registry
            .execute(
                SAVE_USAGE_TOOL,
                json!({
                    "question": "monthly revenue by region",
                    "tool_name": "run_sql",
                    "args": {"sql": "SELECT region, SUM(amount) FROM orders GROUP BY region"}
                }),
                &context(),
            )
            .await
            .expect("outcome");
        assert!(saved.success, "{:?}", saved.error);

        let found = registry
            .execute(
                SEARCH_USAGE_TOOL,
                json!({"question": "monthly revenue by region", "similarity_threshold": 0.9}),
                &context(),
            )
            .await
            .expect("outcome");

        let result = found.result.expect("result");
        assert_eq!(result["count"], json!(1));
        assert_eq!(result["matches"][0]["tool_name"], json!("run_sql"));

        let stored = memory.recent_usage(1).await.expect("recent");
        assert_eq!(stored[0].metadata.get("saved_by"), Some(&json!("analyst-7")));
        assert_eq!(audit.events_of_type("invocation").len(), 2);
    }

    #[tokio::test]
    async fn text_memory_round_trips_through_tools() {
        let (registry, _, _) = setup();
        registry
            .execute(
                SAVE_TEXT_TOOL,
                json!({"content": "churn means an account cancelled within the quarter"}),
                &context(),
            )
            .await
            .expect("outcome");

        let query = json!({
            "query": "churn means an account cancelled",
            "similarity_threshold": 0.5
        });
        let found = registry.execute(SEARCH_TEXT_TOOL, query, &context()).await.expect("outcome");

        let result = found.result.expect("result");
        assert_eq!(result["count"], json!(1));
        let content = result["matches"][0]["content"].as_str();
        assert!(content.is_some_and(|content| content.starts_with("churn")));
    }

    #[tokio::test]
    async fn malformed_arguments_fail_the_call() {
        let (registry, _, _) = setup();
        let outcome = registry
            .execute(SEARCH_TEXT_TOOL, json!({"limit": 3}), &context())
            .await
            .expect("outcome");
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().is_some_and(|error| error.contains("query")));
    }
}
