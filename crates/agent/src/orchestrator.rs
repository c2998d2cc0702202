//! Per-request sequencing: resolve the caller, load the conversation, run
//! the router chain, then either stream the router's answer or hand the
//! turn to the reasoning engine.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tollgate_core::audit::{record_soft, AuditContext, AuditEvent, AuditEventKind, AuditSink};
use tollgate_core::domain::conversation::{Conversation, ConversationId, Message};
use tollgate_core::domain::principal::Principal;
use tollgate_core::errors::{ApplicationError, DomainError};
use tollgate_core::store::{ConversationStore, StoreError};

use crate::components::{component_stream, ComponentStream, StatusLevel, UiComponent};
use crate::enhancer::MemoryContextEnhancer;
use crate::identity::{PrincipalResolver, RequestContext};
use crate::prompt::SystemPromptBuilder;
use crate::router::{RouteContext, RoutingDecision, WorkflowRouter};
use crate::tools::{ToolDescriptor, ToolRegistry};

const DEFAULT_CHANNEL_CAPACITY: usize = 32;
const ENGINE_FAILURE_MESSAGE: &str =
    "The assistant could not complete this request. Please try again.";

#[derive(Clone, Debug, Default)]
pub struct InboundRequest {
    pub conversation_id: Option<ConversationId>,
    pub message: String,
    pub starter: bool,
    pub request_id: Option<String>,
    pub context: RequestContext,
}

impl InboundRequest {
    pub fn message(text: impl Into<String>) -> Self {
        Self { message: text.into(), ..Self::default() }
    }

    pub fn starter() -> Self {
        Self { starter: true, ..Self::default() }
    }

    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Everything the reasoning engine gets for one turn. `conversation`
/// already ends with `message`.
#[derive(Clone, Debug)]
pub struct ReasoningTurn {
    pub principal: Principal,
    pub conversation: Conversation,
    pub message: Message,
    pub tools: Vec<ToolDescriptor>,
    pub system_prompt: String,
    pub request_id: String,
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn respond(&self, turn: ReasoningTurn) -> anyhow::Result<ComponentStream>;
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("principal resolution failed: {0:#}")]
    Identity(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conversation `{conversation_id}` does not belong to `{principal_id}`")]
    ConversationOwnership { conversation_id: String, principal_id: String },
}

impl From<OrchestratorError> for ApplicationError {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::Identity(error) => {
                Self::Domain(DomainError::InvariantViolation(format!("{error:#}")))
            }
            OrchestratorError::Store(error) => Self::Persistence(error.to_string()),
            OrchestratorError::ConversationOwnership { conversation_id, principal_id } => {
                Self::Domain(DomainError::PermissionDenied {
                    principal_id,
                    resource: conversation_id,
                })
            }
        }
    }
}

/// Output of one request. Dropping it stops delivery; the producer sees a
/// closed channel and abandons the rest of the sequence.
#[derive(Debug)]
pub struct ResponseStream {
    conversation_id: ConversationId,
    request_id: String,
    short_circuit: bool,
    receiver: mpsc::Receiver<UiComponent>,
}

impl ResponseStream {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn short_circuited(&self) -> bool {
        self.short_circuit
    }

    pub async fn collect_all(self) -> Vec<UiComponent> {
        self.collect().await
    }
}

impl Stream for ResponseStream {
    type Item = UiComponent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Default)]
struct ConversationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    fn for_conversation(&self, id: &ConversationId) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(id.0.clone()).or_default())
    }
}

enum TurnKind {
    Starter,
    ShortCircuit,
    Reasoning,
}

struct Delivery {
    kind: TurnKind,
    conversation: Conversation,
    audit_context: AuditContext,
    started: Instant,
    error: Option<String>,
}

pub struct Orchestrator {
    resolver: Arc<dyn PrincipalResolver>,
    conversations: Arc<dyn ConversationStore>,
    registry: Arc<ToolRegistry>,
    engine: Arc<dyn ReasoningEngine>,
    audit: Arc<dyn AuditSink>,
    routers: Vec<Arc<dyn WorkflowRouter>>,
    prompt: SystemPromptBuilder,
    enhancer: Option<MemoryContextEnhancer>,
    channel_capacity: usize,
    locks: ConversationLocks,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<dyn PrincipalResolver>,
        conversations: Arc<dyn ConversationStore>,
        registry: Arc<ToolRegistry>,
        engine: Arc<dyn ReasoningEngine>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            resolver,
            conversations,
            registry,
            engine,
            audit,
            routers: Vec::new(),
            prompt: SystemPromptBuilder::default(),
            enhancer: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            locks: ConversationLocks::default(),
        }
    }

    /// Routers run in the order they are added.
    pub fn with_router(mut self, router: Arc<dyn WorkflowRouter>) -> Self {
        self.routers.push(router);
        self
    }

    pub fn with_prompt_builder(mut self, prompt: SystemPromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_enhancer(mut self, enhancer: MemoryContextEnhancer) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub async fn handle(
        &self,
        request: InboundRequest,
    ) -> Result<ResponseStream, OrchestratorError> {
        let started = Instant::now();
        let request_id = request.request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let principal =
            self.resolver.resolve(&request.context).await.map_err(OrchestratorError::Identity)?;
        let conversation_id = request.conversation_id.unwrap_or_else(ConversationId::generate);

        let guard = self.locks.for_conversation(&conversation_id).lock_owned().await;

        let mut conversation = match self.conversations.load(&conversation_id).await? {
            Some(existing) if existing.owner_id != principal.id => {
                warn!(
                    event_name = "orchestrator.ownership_mismatch",
                    conversation_id = %conversation_id,
                    principal_id = %principal.id,
                    request_id = %request_id,
                    "conversation belongs to another principal"
                );
                return Err(OrchestratorError::ConversationOwnership {
                    conversation_id: conversation_id.to_string(),
                    principal_id: principal.id,
                });
            }
            Some(existing) => existing,
            None => Conversation::new(conversation_id.clone(), principal.id.clone()),
        };
        let audit_context =
            AuditContext::for_principal(&principal, conversation_id.to_string(), &request_id);
        let delivery =
            |kind: TurnKind, conversation: Conversation, error: Option<String>| Delivery {
                kind,
                conversation,
                audit_context: audit_context.clone(),
                started,
                error,
            };

        if request.starter || request.message.trim().is_empty() {
            let output = self.run_starters(&principal, &conversation, &request_id).await;
            return Ok(self.deliver(output, guard, delivery(TurnKind::Starter, conversation, None)));
        }

        let message = request.message;
        let decision = self.run_routers(&message, &principal, &conversation, &request_id).await;
        if let Some(decision) = decision {
            if let Some(mutation) = decision.mutation {
                mutation(&mut conversation);
            }
            self.conversations.save(&conversation).await?;
            let output = decision.output.unwrap_or_else(|| component_stream(Vec::new()));
            let delivery = delivery(TurnKind::ShortCircuit, conversation, None);
            return Ok(self.deliver(output, guard, delivery));
        }

        let user_message = Message::user(message);
        conversation.append(user_message.clone());
        self.conversations.save(&conversation).await?;

        let tools = self.registry.schemas_for(&principal);
        let mut system_prompt = self.prompt.build(&tools, Utc::now().date_naive());
        if let Some(enhancer) = &self.enhancer {
            system_prompt = enhancer.enhance(&system_prompt, &conversation).await;
        }
        let turn = ReasoningTurn {
            principal,
            conversation: conversation.clone(),
            message: user_message,
            tools,
            system_prompt,
            request_id: request_id.clone(),
        };

        let (output, error) = match self.engine.respond(turn).await {
            Ok(output) => (output, None),
            Err(error) => {
                warn!(
                    event_name = "orchestrator.reasoning_failed",
                    conversation_id = %conversation_id,
                    request_id = %request_id,
                    error = %format!("{error:#}"),
                    "reasoning engine failed"
                );
                let notice = vec![UiComponent::status(StatusLevel::Error, ENGINE_FAILURE_MESSAGE)];
                (component_stream(notice), Some(format!("{error:#}")))
            }
        };
        Ok(self.deliver(output, guard, delivery(TurnKind::Reasoning, conversation, error)))
    }

    async fn run_starters(
        &self,
        principal: &Principal,
        conversation: &Conversation,
        request_id: &str,
    ) -> ComponentStream {
        for router in &self.routers {
            let context = RouteContext { principal, conversation, request_id };
            match AssertUnwindSafe(router.starter(context)).catch_unwind().await {
                Ok(Ok(Some(output))) => return output,
                Ok(Ok(None)) => {}
                Ok(Err(error)) => log_router_failure(router.name(), request_id, &error.to_string()),
                Err(_) => log_router_failure(router.name(), request_id, "router panicked"),
            }
        }
        component_stream(Vec::new())
    }

    /// First short-circuit wins. Failures degrade to pass-through.
    async fn run_routers(
        &self,
        message: &str,
        principal: &Principal,
        conversation: &Conversation,
        request_id: &str,
    ) -> Option<RoutingDecision> {
        for router in &self.routers {
            let context = RouteContext { principal, conversation, request_id };
            match AssertUnwindSafe(router.route(message, context)).catch_unwind().await {
                Ok(Ok(decision)) if decision.short_circuit => {
                    debug!(
                        event_name = "orchestrator.short_circuit",
                        router = router.name(),
                        request_id,
                        "router answered the message"
                    );
                    return Some(decision);
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => log_router_failure(router.name(), request_id, &error.to_string()),
                Err(_) => log_router_failure(router.name(), request_id, "router panicked"),
            }
        }
        None
    }

    /// Forwards `output` to the caller on a task that keeps the
    /// conversation lock until delivery, reply persistence and the summary
    /// event are done.
    fn deliver(
        &self,
        output: ComponentStream,
        guard: OwnedMutexGuard<()>,
        delivery: Delivery,
    ) -> ResponseStream {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let stream = ResponseStream {
            conversation_id: delivery.conversation.id.clone(),
            request_id: delivery.audit_context.request_id.clone(),
            short_circuit: matches!(delivery.kind, TurnKind::ShortCircuit),
            receiver,
        };
        let audit = Arc::clone(&self.audit);
        let conversations = Arc::clone(&self.conversations);

        tokio::spawn(async move {
            let Delivery { kind, mut conversation, audit_context, started, error } = delivery;
            let mut output = output;
            let mut component_count = 0usize;
            let mut reply = Vec::new();
            let mut cancelled = false;

            while let Some(component) = output.next().await {
                if let UiComponent::Text { text } = &component {
                    reply.push(text.clone());
                }
                if sender.send(component).await.is_err() {
                    cancelled = true;
                    break;
                }
                component_count += 1;
            }
            drop(output);

            if cancelled {
                debug!(
                    event_name = "orchestrator.stream_cancelled",
                    request_id = %audit_context.request_id,
                    delivered = component_count,
                    "consumer stopped reading"
                );
            } else if matches!(kind, TurnKind::Reasoning) && error.is_none() && !reply.is_empty() {
                conversation.append(Message::assistant(reply.join("\n")));
                if let Err(save_error) = conversations.save(&conversation).await {
                    warn!(
                        event_name = "orchestrator.reply_not_persisted",
                        request_id = %audit_context.request_id,
                        error = %save_error,
                        "assistant reply could not be saved"
                    );
                }
            }

            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let short_circuit = matches!(kind, TurnKind::ShortCircuit);
            let summary = AuditEventKind::ResponseSummary {
                short_circuit,
                component_count,
                duration_ms,
                error,
            };
            record_soft(audit.as_ref(), AuditEvent::new(&audit_context, summary)).await;
            info!(
                event_name = "orchestrator.turn.completed",
                conversation_id = %audit_context.conversation_id,
                principal_id = %audit_context.principal_id,
                request_id = %audit_context.request_id,
                short_circuit,
                component_count,
                duration_ms,
                cancelled,
                "turn completed"
            );

            drop(guard);
            drop(sender);
        });

        stream
    }
}

fn log_router_failure(router: &str, request_id: &str, error: &str) {
    warn!(
        event_name = "router.failure",
        router,
        request_id,
        error,
        "router failed, treating as pass-through"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use futures::stream::{self, StreamExt};

    use tollgate_core::audit::{AuditEventKind, InMemoryAuditSink};
    use tollgate_core::domain::conversation::{ConversationId, Message, Role};
    use tollgate_core::store::{ConversationStore, InMemoryConversationStore};

    use super::{InboundRequest, Orchestrator, OrchestratorError, ReasoningEngine, ReasoningTurn};
    use crate::components::{component_stream, ComponentStream, StatusLevel, UiComponent};
    use crate::identity::{EmailGroupResolver, RequestContext};
    use crate::router::{
        CommandRouter, QuotaRouter, RouteContext, RouterError, RoutingDecision, WorkflowRouter,
    };
    use crate::tools::test_tools::EchoTool;
    use crate::tools::ToolRegistry;

    #[derive(Default)]
    struct ScriptedEngine {
        turns: Mutex<Vec<ReasoningTurn>>,
        fail: bool,
    }

    impl ScriptedEngine {
        fn turns(&self) -> Vec<ReasoningTurn> {
            self.turns.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ReasoningEngine for ScriptedEngine {
        async fn respond(&self, turn: ReasoningTurn) -> Result<ComponentStream> {
            self.turns.lock().expect("lock").push(turn);
            if self.fail {
                bail!("model provider returned 503");
            }
            Ok(component_stream(vec![UiComponent::text("There are 42 customers.")]))
        }
    }

    struct BrokenRouter;

    #[async_trait]
    impl WorkflowRouter for BrokenRouter {
        fn name(&self) -> &str {
            "broken"
        }

        async fn route(
            &self,
            _message: &str,
            _context: RouteContext<'_>,
        ) -> Result<RoutingDecision, RouterError> {
            Err(RouterError::Failed {
                router: "broken".to_string(),
                reason: "lookup table missing".to_string(),
            })
        }
    }

    struct PanickingRouter;

    #[async_trait]
    impl WorkflowRouter for PanickingRouter {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn route(
            &self,
            _message: &str,
            _context: RouteContext<'_>,
        ) -> Result<RoutingDecision, RouterError> {
            panic!("router bug")
        }
    }

    /// Answers everything with a long stream and records the question.
    struct ChattyRouter;

    #[async_trait]
    impl WorkflowRouter for ChattyRouter {
        fn name(&self) -> &str {
            "chatty"
        }

        async fn route(
            &self,
            message: &str,
            _context: RouteContext<'_>,
        ) -> Result<RoutingDecision, RouterError> {
            let question = message.to_string();
            let lines = (0..100).map(|index| UiComponent::text(format!("line {index}")));
            let output = stream::iter(lines).boxed();
            Ok(RoutingDecision::respond_with(output).with_mutation(move |conversation| {
                conversation.append(Message::user(question));
                conversation.append(Message::assistant("long answer"));
            }))
        }
    }

    struct Harness {
        audit: InMemoryAuditSink,
        store: Arc<InMemoryConversationStore>,
        engine: Arc<ScriptedEngine>,
        registry: Arc<ToolRegistry>,
    }

    impl Harness {
        fn new(engine: ScriptedEngine) -> Self {
            let audit = InMemoryAuditSink::default();
            let mut registry = ToolRegistry::new(Arc::new(audit.clone()));
            registry.register(EchoTool("list_customers"), Vec::<String>::new()).expect("register");
            registry.register(EchoTool("export_all_data"), ["admin"]).expect("register");
            Self {
                audit,
                store: Arc::new(InMemoryConversationStore::default()),
                engine: Arc::new(engine),
                registry: Arc::new(registry),
            }
        }

        fn orchestrator(&self, routers: Vec<Arc<dyn WorkflowRouter>>) -> Orchestrator {
            let resolver =
                EmailGroupResolver::new("guest@example.com", "sales", ["boss@example.com"]);
            let mut orchestrator = Orchestrator::new(
                Arc::new(resolver),
                self.store.clone(),
                Arc::clone(&self.registry),
                self.engine.clone(),
                Arc::new(self.audit.clone()),
            );
            for router in routers {
                orchestrator = orchestrator.with_router(router);
            }
            orchestrator
        }

        fn command_router(&self) -> Arc<dyn WorkflowRouter> {
            Arc::new(CommandRouter::new(Arc::clone(&self.registry), Arc::new(self.audit.clone())))
        }

        fn default_routers(&self) -> Vec<Arc<dyn WorkflowRouter>> {
            vec![Arc::new(QuotaRouter::new(50, 3600)), self.command_router()]
        }
    }

    fn conversation_id() -> ConversationId {
        ConversationId("conv-1".to_string())
    }

    #[tokio::test]
    async fn help_is_answered_by_the_second_router_without_reasoning() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = harness.orchestrator(harness.default_routers());

        let response = orchestrator
            .handle(InboundRequest::message("/help").in_conversation(conversation_id()))
            .await
            .expect("handled");
        assert!(response.short_circuited());
        let output = response.collect_all().await;

        assert!(matches!(&output[..], [UiComponent::Card { title, .. }] if title == "Commands"));
        assert!(harness.engine.turns().is_empty());
        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        assert!(stored.messages.is_empty(), "the command itself is not recorded");
        let summaries = harness.audit.events_of_type("response_summary");
        assert!(matches!(
            summaries[0].kind,
            AuditEventKind::ResponseSummary {
                short_circuit: true,
                component_count: 1,
                error: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn plain_questions_reach_the_engine_with_filtered_tools() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = harness.orchestrator(harness.default_routers());

        let request = InboundRequest::message("how many customers do we have?")
            .in_conversation(conversation_id());
        let response = orchestrator.handle(request).await.expect("handled");
        assert!(!response.short_circuited());
        let output = response.collect_all().await;

        assert_eq!(output, vec![UiComponent::text("There are 42 customers.")]);
        let turns = harness.engine.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].message.content, "how many customers do we have?");
        assert_eq!(turns[0].conversation.messages.last(), Some(&turns[0].message));
        let tool_names: Vec<&str> = turns[0].tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(tool_names, vec!["list_customers"]);
        assert!(turns[0].system_prompt.contains("list_customers"));

        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        let roles: Vec<Role> = stored.messages.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn failing_routers_degrade_to_pass_through() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator =
            harness.orchestrator(vec![Arc::new(BrokenRouter), Arc::new(PanickingRouter)]);

        let output = orchestrator
            .handle(InboundRequest::message("top accounts"))
            .await
            .expect("handled")
            .collect_all()
            .await;

        assert_eq!(output, vec![UiComponent::text("There are 42 customers.")]);
        assert_eq!(harness.engine.turns().len(), 1);
    }

    #[tokio::test]
    async fn starter_requests_render_the_menu_and_store_nothing() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = harness.orchestrator(harness.default_routers());

        let output = orchestrator
            .handle(InboundRequest::starter().in_conversation(conversation_id()))
            .await
            .expect("handled")
            .collect_all()
            .await;

        assert!(matches!(&output[0], UiComponent::Card { title, .. } if title.contains("guest")));
        assert!(matches!(&output[1], UiComponent::Menu { .. }));
        assert!(harness.store.load(&conversation_id()).await.expect("load").is_none());
        assert!(harness.engine.turns().is_empty());
    }

    #[tokio::test]
    async fn short_circuit_never_stores_the_message_unless_mutation_does() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = harness.orchestrator(vec![Arc::new(ChattyRouter)]);

        orchestrator
            .handle(InboundRequest::message("summarize Q3").in_conversation(conversation_id()))
            .await
            .expect("handled")
            .collect_all()
            .await;

        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        let user_messages: Vec<&str> = stored
            .messages
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(user_messages, vec!["summarize Q3"]);
    }

    #[tokio::test]
    async fn cancelled_stream_leaves_mutation_applied_exactly_once() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator =
            harness.orchestrator(vec![Arc::new(ChattyRouter)]).with_channel_capacity(1);

        let mut response = orchestrator
            .handle(InboundRequest::message("first").in_conversation(conversation_id()))
            .await
            .expect("handled");
        assert_eq!(response.next().await, Some(UiComponent::text("line 0")));
        drop(response);

        // Waits on the conversation lock until the first turn has finished.
        orchestrator
            .handle(InboundRequest::message("second").in_conversation(conversation_id()))
            .await
            .expect("handled")
            .collect_all()
            .await;

        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        assert_eq!(stored.messages.len(), 4);
        let summaries = harness.audit.events_of_type("response_summary");
        assert_eq!(summaries.len(), 2);
        assert!(matches!(
            summaries[0].kind,
            AuditEventKind::ResponseSummary { component_count, .. } if component_count < 100
        ));
    }

    #[tokio::test]
    async fn engine_failure_is_reported_as_a_status() {
        let harness = Harness::new(ScriptedEngine { fail: true, ..ScriptedEngine::default() });
        let orchestrator = harness.orchestrator(Vec::new());

        let request =
            InboundRequest::message("forecast next quarter").in_conversation(conversation_id());
        let output = orchestrator
            .handle(request)
            .await
            .expect("handled")
            .collect_all()
            .await;

        assert!(matches!(&output[..], [UiComponent::Status { level: StatusLevel::Error, .. }]));
        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        assert_eq!(stored.messages.len(), 1, "only the user message is kept");
        let summaries = harness.audit.events_of_type("response_summary");
        assert!(matches!(
            &summaries[0].kind,
            AuditEventKind::ResponseSummary { error: Some(error), .. } if error.contains("503")
        ));
    }

    #[tokio::test]
    async fn conversations_cannot_be_borrowed_by_someone_else() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = harness.orchestrator(Vec::new());
        orchestrator
            .handle(InboundRequest::message("hello").in_conversation(conversation_id()))
            .await
            .expect("handled")
            .collect_all()
            .await;

        let intruder = RequestContext::new().with_cookie("tollgate_email", "eve@example.com");
        let request = InboundRequest::message("show me")
            .in_conversation(conversation_id())
            .with_context(intruder);
        let error = orchestrator
            .handle(request)
            .await
            .expect_err("rejected");

        assert!(matches!(error, OrchestratorError::ConversationOwnership { .. }));
    }

    #[tokio::test]
    async fn quota_router_blocks_before_commands_once_exhausted() {
        let harness = Harness::new(ScriptedEngine::default());
        let routers: Vec<Arc<dyn WorkflowRouter>> =
            vec![Arc::new(QuotaRouter::new(1, 3600)), harness.command_router()];
        let orchestrator = harness.orchestrator(routers);

        for _ in 0..2 {
            let request =
                InboundRequest::message("revenue by month").in_conversation(conversation_id());
            orchestrator
                .handle(request)
                .await
                .expect("handled")
                .collect_all()
                .await;
        }
        let output = orchestrator
            .handle(InboundRequest::message("/help").in_conversation(conversation_id()))
            .await
            .expect("handled")
            .collect_all()
            .await;

        assert_eq!(harness.engine.turns().len(), 1);
        assert!(matches!(&output[..], [UiComponent::Status { level: StatusLevel::Warning, .. }]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_turns_on_one_conversation_are_serialized() {
        let harness = Harness::new(ScriptedEngine::default());
        let orchestrator = Arc::new(harness.orchestrator(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..10 {
            let orchestrator = Arc::clone(&orchestrator);
            handles.push(tokio::spawn(async move {
                let request = InboundRequest::message(format!("question {index}"))
                    .in_conversation(conversation_id());
                orchestrator.handle(request).await.expect("handled").collect_all().await
            }));
        }
        for handle in handles {
            let output = handle.await.expect("join");
            assert_eq!(output, vec![UiComponent::text("There are 42 customers.")]);
        }

        let stored = harness.store.load(&conversation_id()).await.expect("load").expect("saved");
        assert_eq!(stored.messages.len(), 20);
        let roles: Vec<Role> = stored.messages.iter().map(|message| message.role).collect();
        for pair in roles.chunks(2) {
            assert_eq!(pair, [Role::User, Role::Assistant], "turns never interleave");
        }
        assert_eq!(harness.engine.turns().len(), 10);
        assert_eq!(harness.audit.events_of_type("response_summary").len(), 10);
    }
}
