use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tollgate_core::access::FeatureGate;
use tollgate_core::audit::{AuditContext, AuditError, AuditQuery, AuditSink};
use tollgate_core::memory::{MemoryError, MemoryStore};

use super::{RouteContext, RouterError, RoutingDecision, WorkflowRouter};
use crate::components::{component_stream, ComponentStream, MenuOption, StatusLevel, UiComponent};
use crate::tools::ToolRegistry;

pub const ADMIN_MENU_FEATURE: &str = "admin_menu";

const RECENT_LIMIT: usize = 5;
const AUDIT_LIMIT: usize = 10;

/// Slash commands answered without the reasoning engine.
pub struct CommandRouter {
    registry: Arc<ToolRegistry>,
    audit: Arc<dyn AuditSink>,
    memory: Option<Arc<dyn MemoryStore>>,
    features: FeatureGate,
}

impl CommandRouter {
    /// `admin_menu` defaults to the `admin` group.
    pub fn new(registry: Arc<ToolRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry,
            audit,
            memory: None,
            features: FeatureGate::new().with_feature(ADMIN_MENU_FEATURE, ["admin"]),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_features(mut self, features: FeatureGate) -> Self {
        self.features = features;
        self
    }

    async fn admin_menu_enabled(&self, context: RouteContext<'_>) -> bool {
        let audit_context = AuditContext::for_principal(
            context.principal,
            context.conversation.id.to_string(),
            context.request_id,
        );
        self.features
            .check(ADMIN_MENU_FEATURE, context.principal, self.audit.as_ref(), &audit_context)
            .await
    }

    fn help(&self, admin: bool) -> UiComponent {
        let mut lines = vec![
            "/help - show this message",
            "/tools - list the tools you can use",
            "/recent - show recently saved knowledge",
            "/reset - clear this conversation",
        ];
        if admin {
            lines.push("/audit - show the latest audit events");
        }
        UiComponent::card("Commands", lines.join("\n"))
    }

    fn tools(&self, context: RouteContext<'_>) -> UiComponent {
        let schemas = self.registry.schemas_for(context.principal);
        if schemas.is_empty() {
            return UiComponent::card("Available tools", "No tools are available to you.");
        }
        let body = schemas
            .iter()
            .map(|schema| format!("- {}: {}", schema.name, schema.description))
            .collect::<Vec<_>>()
            .join("\n");
        UiComponent::card("Available tools", body)
    }

    async fn recent(&self) -> Result<UiComponent, RouterError> {
        let Some(memory) = &self.memory else {
            return Ok(UiComponent::status(StatusLevel::Warning, "No memory store is configured."));
        };
        match memory.recent_text(RECENT_LIMIT).await {
            Ok(records) if records.is_empty() => {
                Ok(UiComponent::card("Recent memories", "Nothing has been saved yet."))
            }
            Ok(records) => {
                let body = records
                    .iter()
                    .map(|record| {
                        let written = record.timestamp.format("%Y-%m-%d %H:%M");
                        format!("- ({written}) {}", record.content)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(UiComponent::card("Recent memories", body))
            }
            Err(MemoryError::Unsupported(operation)) => {
                debug!(
                    event_name = "router.command.recent_unsupported",
                    operation,
                    "memory backend cannot list recent records"
                );
                Ok(UiComponent::status(
                    StatusLevel::Warning,
                    "Recent memories are not available with the configured memory backend.",
                ))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn audit_tail(&self) -> Result<UiComponent, RouterError> {
        let query = AuditQuery { limit: AUDIT_LIMIT, ..AuditQuery::default() };
        match self.audit.query(&query).await {
            Ok(events) if events.is_empty() => {
                Ok(UiComponent::card("Audit events", "No events recorded."))
            }
            Ok(events) => {
                let body = events
                    .iter()
                    .map(|event| {
                        let subject = event.kind.tool_name().unwrap_or("-");
                        format!(
                            "- {} {} {} {}",
                            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            event.event_type(),
                            event.principal_id,
                            subject
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(UiComponent::card("Audit events", body))
            }
            Err(AuditError::Unsupported(_)) => Ok(UiComponent::status(
                StatusLevel::Warning,
                "The configured audit sink cannot be queried.",
            )),
            Err(error) => Err(RouterError::Failed {
                router: self.name().to_string(),
                reason: error.to_string(),
            }),
        }
    }
}

#[async_trait]
impl WorkflowRouter for CommandRouter {
    fn name(&self) -> &str {
        "command"
    }

    async fn starter(
        &self,
        context: RouteContext<'_>,
    ) -> Result<Option<ComponentStream>, RouterError> {
        let who = context
            .principal
            .username
            .as_deref()
            .or(context.principal.email.as_deref())
            .unwrap_or(&context.principal.id);
        let mut options = vec![
            MenuOption::new("What can I ask?", "/help"),
            MenuOption::new("Show my tools", "/tools"),
            MenuOption::new("Recent knowledge", "/recent"),
        ];
        if self.admin_menu_enabled(context).await {
            options.push(MenuOption::new("Audit trail", "/audit"));
        }

        Ok(Some(component_stream(vec![
            UiComponent::card(
                format!("Welcome, {who}"),
                "Ask a question about your data, or pick a shortcut below.",
            ),
            UiComponent::Menu { title: "Shortcuts".to_string(), options },
        ])))
    }

    async fn route(
        &self,
        message: &str,
        context: RouteContext<'_>,
    ) -> Result<RoutingDecision, RouterError> {
        let trimmed = message.trim();
        if !trimmed.starts_with('/') {
            return Ok(RoutingDecision::pass_through());
        }
        let command = trimmed.split_whitespace().next().unwrap_or_default().to_ascii_lowercase();

        let component = match command.as_str() {
            "/help" => {
                let admin = self.features.is_enabled(ADMIN_MENU_FEATURE, context.principal);
                self.help(admin)
            }
            "/tools" => self.tools(context),
            "/recent" => self.recent().await?,
            "/reset" => {
                return Ok(RoutingDecision::respond(vec![UiComponent::status(
                    StatusLevel::Success,
                    "Conversation history cleared.",
                )])
                .with_mutation(|conversation| conversation.reset()));
            }
            "/audit" => {
                if self.admin_menu_enabled(context).await {
                    self.audit_tail().await?
                } else {
                    UiComponent::status(StatusLevel::Error, "You do not have access to /audit.")
                }
            }
            other => UiComponent::status(
                StatusLevel::Warning,
                format!("Unknown command `{other}`. Type /help to see what is available."),
            ),
        };

        Ok(RoutingDecision::respond(vec![component]))
    }
}
