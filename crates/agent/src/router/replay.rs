use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use tollgate_core::config::MemoryConfig;
use tollgate_core::domain::conversation::Message;
use tollgate_core::memory::{MemoryError, MemoryStore};

use super::{RouteContext, RouterError, RoutingDecision, WorkflowRouter};
use crate::components::UiComponent;
use crate::tools::{ToolContext, ToolRegistry};

pub const DEFAULT_REPLAY_THRESHOLD: f32 = 0.97;

const CANDIDATES: usize = 3;
const SUMMARY_CHARS: usize = 280;

/// Answers a question that matches a saved successful tool call closely
/// enough by running that call again.
pub struct ReplayRouter {
    registry: Arc<ToolRegistry>,
    memory: Arc<dyn MemoryStore>,
    threshold: f32,
    tool_name: Option<String>,
}

impl ReplayRouter {
    pub fn new(registry: Arc<ToolRegistry>, memory: Arc<dyn MemoryStore>) -> Self {
        Self { registry, memory, threshold: DEFAULT_REPLAY_THRESHOLD, tool_name: None }
    }

    /// Uses `memory.replay_threshold`.
    pub fn from_config(
        config: &MemoryConfig,
        registry: Arc<ToolRegistry>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self::new(registry, memory).with_threshold(config.replay_threshold)
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Only replay calls of this tool.
    pub fn for_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }
}

#[async_trait]
impl WorkflowRouter for ReplayRouter {
    fn name(&self) -> &str {
        "replay"
    }

    async fn route(
        &self,
        message: &str,
        context: RouteContext<'_>,
    ) -> Result<RoutingDecision, RouterError> {
        let question = message.trim();
        if question.is_empty() || question.starts_with('/') {
            return Ok(RoutingDecision::pass_through());
        }

        let hits = match self
            .memory
            .search_usage(question, CANDIDATES, self.threshold, self.tool_name.as_deref())
            .await
        {
            Ok(hits) => hits,
            Err(MemoryError::Unsupported(operation)) => {
                debug!(
                    event_name = "router.replay.unsupported",
                    operation,
                    "memory backend cannot search usage"
                );
                return Ok(RoutingDecision::pass_through());
            }
            Err(error) => return Err(error.into()),
        };
        let Some(hit) = hits.into_iter().find(|hit| hit.record.success) else {
            return Ok(RoutingDecision::pass_through());
        };

        let tool_context = ToolContext::new(
            context.principal.clone(),
            context.conversation.id.to_string(),
            context.request_id,
        )
        .with_question(question);
        let arguments = Value::Object(hit.record.arguments.clone());
        let execution = self.registry.execute(&hit.record.tool_name, arguments, &tool_context);
        let outcome = match execution.await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                debug!(
                    event_name = "router.replay.failed",
                    tool_name = %outcome.tool_name,
                    request_id = context.request_id,
                    "replayed call failed, deferring to reasoning"
                );
                return Ok(RoutingDecision::pass_through());
            }
            Err(error) => {
                debug!(
                    event_name = "router.replay.refused",
                    request_id = context.request_id,
                    error = %error,
                    "replay not permitted, deferring to reasoning"
                );
                return Ok(RoutingDecision::pass_through());
            }
        };

        info!(
            event_name = "router.replay.hit",
            tool_name = %outcome.tool_name,
            memory_id = %hit.record.id,
            score = hit.score,
            request_id = context.request_id,
            "answered from saved tool call"
        );

        let summary = summarize(outcome.result.as_ref());
        let assistant_text = format!("Reused a saved `{}` call: {summary}", outcome.tool_name);
        let user_text = question.to_string();
        Ok(RoutingDecision::respond(vec![
            UiComponent::ToolResult {
                tool_name: outcome.tool_name.clone(),
                success: true,
                summary: summary.clone(),
            },
            UiComponent::text(format!(
                "This question matched a saved `{}` call, so I ran it again.",
                outcome.tool_name
            )),
        ])
        .with_mutation(move |conversation| {
            conversation.append(Message::user(user_text));
            conversation.append(Message::assistant(assistant_text));
        }))
    }
}

fn summarize(result: Option<&Value>) -> String {
    let rendered = match result {
        Some(Value::String(text)) => text.clone(),
        Some(value) => value.to_string(),
        None => String::new(),
    };
    if rendered.chars().count() <= SUMMARY_CHARS {
        return rendered;
    }
    let mut truncated: String = rendered.chars().take(SUMMARY_CHARS).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use serde_json::json;

    use tollgate_core::audit::InMemoryAuditSink;
    use tollgate_core::config::{AppConfig, MemoryConfig};
    use tollgate_core::domain::conversation::{Conversation, ConversationId, Role};
    use tollgate_core::domain::principal::Principal;
    use tollgate_core::memory::{InMemoryMemoryStore, MemoryStore, NewUsage};

    use super::ReplayRouter;
    use crate::components::UiComponent;
    use crate::router::{RouteContext, WorkflowRouter};
    use crate::tools::test_tools::EchoTool;
    use crate::tools::ToolRegistry;

    async fn setup(audit: &InMemoryAuditSink) -> ReplayRouter {
        let memory = Arc::new(InMemoryMemoryStore::default());
        let usages = [
            NewUsage::new("top ten customers by revenue", "list_customers", json!({"limit": 10})),
            NewUsage::new("export every table", "export_all_data", json!({})),
            NewUsage::new("churned accounts this quarter", "list_customers", json!({})).failed(),
        ];
        for usage in usages {
            memory.write_usage(usage).await.expect("write");
        }

        let mut registry = ToolRegistry::new(Arc::new(audit.clone()));
        registry.register(EchoTool("list_customers"), Vec::<String>::new()).expect("register");
        registry.register(EchoTool("export_all_data"), ["admin"]).expect("register");
        ReplayRouter::new(Arc::new(registry), memory)
    }

    fn conversation() -> Conversation {
        Conversation::new(ConversationId("c-1".to_string()), "u-1")
    }

    fn route_context<'a>(
        principal: &'a Principal,
        conversation: &'a Conversation,
    ) -> RouteContext<'a> {
        RouteContext { principal, conversation, request_id: "r-1" }
    }

    #[tokio::test]
    async fn exact_match_replays_and_records_both_turns() {
        let audit = InMemoryAuditSink::default();
        let router = setup(&audit).await;
        let principal = Principal::new("u-1");
        let mut conversation = conversation();
        let context = route_context(&principal, &conversation);

        let decision = router.route("Top ten customers by revenue", context).await.expect("route");

        assert!(decision.short_circuit);
        let mutation = decision.mutation.expect("mutation");
        let output: Vec<UiComponent> = decision.output.expect("output").collect().await;
        assert!(matches!(
            &output[0],
            UiComponent::ToolResult { tool_name, success: true, summary }
                if tool_name == "list_customers" && summary.contains("\"limit\":10")
        ));
        mutation(&mut conversation);
        let roles: Vec<Role> = conversation.messages.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(audit.events_of_type("invocation").len(), 1);
    }

    #[tokio::test]
    async fn weak_matches_pass_through() {
        let audit = InMemoryAuditSink::default();
        let router = setup(&audit).await;
        let principal = Principal::new("u-1");
        let conversation = conversation();
        let context = route_context(&principal, &conversation);

        let decision = router.route("which region grew fastest", context).await.expect("route");

        assert!(!decision.short_circuit);
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn denied_replay_falls_back_to_pass_through() {
        let audit = InMemoryAuditSink::default();
        let router = setup(&audit).await;
        let principal = Principal::new("u-1").with_groups(["sales"]);
        let conversation = conversation();
        let context = route_context(&principal, &conversation);

        let decision = router.route("export every table", context).await.expect("route");

        assert!(!decision.short_circuit);
        assert_eq!(audit.events_of_type("access_check").len(), 1);
    }

    #[tokio::test]
    async fn failed_usages_are_never_replayed() {
        let audit = InMemoryAuditSink::default();
        let router = setup(&audit).await;
        let principal = Principal::new("u-1");
        let conversation = conversation();
        let context = route_context(&principal, &conversation);

        let decision = router.route("churned accounts this quarter", context).await.expect("route");

        assert!(!decision.short_circuit);
        assert!(audit.events().is_empty());
    }

    #[tokio::test]
    async fn configured_threshold_controls_near_matches() {
        let audit = InMemoryAuditSink::default();
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryMemoryStore::default());
        memory
            .write_usage(NewUsage::new(
                "top ten customers by revenue",
                "list_customers",
                json!({"limit": 10}),
            ))
            .await
            .expect("write");
        let mut registry = ToolRegistry::new(Arc::new(audit.clone()));
        registry.register(EchoTool("list_customers"), Vec::<String>::new()).expect("register");
        let registry = Arc::new(registry);
        let principal = Principal::new("u-1");
        let conversation = conversation();
        let question = "top ten customers by revenue this year";

        let strict = ReplayRouter::from_config(
            &MemoryConfig { replay_threshold: 1.0, ..AppConfig::default().memory },
            Arc::clone(&registry),
            Arc::clone(&memory),
        );
        let decision =
            strict.route(question, route_context(&principal, &conversation)).await.expect("route");
        assert!(!decision.short_circuit);

        let loose = ReplayRouter::from_config(
            &MemoryConfig { replay_threshold: 0.1, ..AppConfig::default().memory },
            registry,
            memory,
        );
        let decision =
            loose.route(question, route_context(&principal, &conversation)).await.expect("route");
        assert!(decision.short_circuit);
    }
}
