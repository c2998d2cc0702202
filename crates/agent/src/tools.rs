use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::access::grant;
use tollgate_core::audit::{record_soft, AuditContext, AuditEvent, AuditEventKind, AuditSink};
use tollgate_core::domain::principal::Principal;
use tollgate_core::errors::{ApplicationError, DomainError};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameter_schema(&self) -> Value;
    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<Value>;
}

/// What a reasoning step may see of a tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
    pub required_groups: BTreeSet<String>,
}

/// Caller identity and correlation for one tool call.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub principal: Principal,
    pub conversation_id: String,
    pub request_id: String,
    pub question: Option<String>,
}

impl ToolContext {
    pub fn new(
        principal: Principal,
        conversation_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            principal,
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
            question: None,
        }
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn audit_context(&self) -> AuditContext {
        AuditContext::for_principal(&self.principal, &self.conversation_id, &self.request_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub invocation_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub result_size: usize,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("tool `{0}` is not registered")]
    NotFound(String),
    #[error("principal `{principal_id}` is not permitted to call `{tool_name}`")]
    PermissionDenied { tool_name: String, principal_id: String },
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
}

impl From<ToolError> for ApplicationError {
    fn from(value: ToolError) -> Self {
        match value {
            ToolError::NotFound(name) => Self::Domain(DomainError::ToolNotFound(name)),
            ToolError::PermissionDenied { tool_name, principal_id } => {
                Self::Domain(DomainError::PermissionDenied { principal_id, resource: tool_name })
            }
            ToolError::DuplicateTool(name) => Self::Domain(DomainError::InvariantViolation(
                format!("tool `{name}` registered twice"),
            )),
        }
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

/// Tools in registration order, each behind its required groups.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    audit: Arc<dyn AuditSink>,
}

impl ToolRegistry {
    pub fn new(audit: Arc<dyn AuditSink>) -> Self {
        Self { tools: Vec::new(), audit }
    }

    pub fn register<T, I, S>(&mut self, tool: T, required_groups: I) -> Result<(), ToolError>
    where
        T: Tool + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_shared(Arc::new(tool), required_groups)
    }

    pub fn register_shared<I, S>(
        &mut self,
        tool: Arc<dyn Tool>,
        required_groups: I,
    ) -> Result<(), ToolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = tool.name().to_string();
        if self.tools.iter().any(|entry| entry.descriptor.name == name) {
            return Err(ToolError::DuplicateTool(name));
        }
        let descriptor = ToolDescriptor {
            name,
            description: tool.description().to_string(),
            parameter_schema: tool.parameter_schema(),
            required_groups: required_groups.into_iter().map(Into::into).collect(),
        };
        self.tools.push(RegisteredTool { descriptor, tool });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.find(name).map(|entry| &entry.descriptor)
    }

    /// Descriptors the principal may call, in registration order.
    pub fn schemas_for(&self, principal: &Principal) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|entry| grant(&principal.groups, &entry.descriptor.required_groups))
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Runs one gated call: lookup, access check, invocation audit, body,
    /// outcome audit. A failing or panicking body is reported in the
    /// returned outcome; only lookup and permission failures are errors.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
        context: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let Some(entry) = self.find(tool_name) else {
            warn!(
                event_name = "tool.execute.not_found",
                tool_name,
                request_id = %context.request_id,
                "tool lookup failed"
            );
            return Err(ToolError::NotFound(tool_name.to_string()));
        };

        let audit_context = context.audit_context();
        let required = &entry.descriptor.required_groups;
        let granted = grant(&context.principal.groups, required);
        record_soft(
            self.audit.as_ref(),
            AuditEvent::access_check(&audit_context, tool_name, required, granted),
        )
        .await;

        if !granted {
            warn!(
                event_name = "tool.execute.denied",
                tool_name,
                principal_id = %context.principal.id,
                request_id = %context.request_id,
                "tool access denied"
            );
            return Err(ToolError::PermissionDenied {
                tool_name: tool_name.to_string(),
                principal_id: context.principal.id.clone(),
            });
        }

        let invocation_id = Uuid::new_v4().to_string();
        record_soft(
            self.audit.as_ref(),
            AuditEvent::invocation(
                &audit_context,
                &invocation_id,
                tool_name,
                &arguments,
                context.question.clone(),
            ),
        )
        .await;

        let started = Instant::now();
        let result = AssertUnwindSafe(entry.tool.execute(arguments, context)).catch_unwind().await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (result, error) = match result {
            Ok(Ok(value)) => (Some(value), None),
            Ok(Err(error)) => (None, Some(format!("{error:#}"))),
            Err(panic) => (None, Some(format!("tool panicked: {}", panic_message(panic.as_ref())))),
        };
        let success = error.is_none();
        let result_size = result
            .as_ref()
            .and_then(|value| serde_json::to_string(value).ok())
            .map_or(0, |encoded| encoded.len());

        record_soft(
            self.audit.as_ref(),
            AuditEvent::new(
                &audit_context,
                AuditEventKind::Outcome {
                    invocation_id: invocation_id.clone(),
                    tool_name: tool_name.to_string(),
                    success,
                    error: error.clone(),
                    duration_ms,
                    result_size,
                },
            ),
        )
        .await;

        if success {
            info!(
                event_name = "tool.execute.completed",
                tool_name,
                invocation_id = %invocation_id,
                duration_ms,
                result_size,
                "tool call completed"
            );
        } else {
            warn!(
                event_name = "tool.execute.failed",
                tool_name,
                invocation_id = %invocation_id,
                duration_ms,
                error = error.as_deref().unwrap_or_default(),
                "tool call failed"
            );
        }

        Ok(ToolOutcome {
            invocation_id,
            tool_name: tool_name.to_string(),
            success,
            result,
            error,
            duration_ms,
            result_size,
        })
    }

    fn find(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|entry| entry.descriptor.name == name)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_tools {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{Tool, ToolContext};

    pub struct EchoTool(pub &'static str);

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echoes its arguments"
        }

        fn parameter_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, arguments: Value, _context: &ToolContext) -> Result<Value> {
            Ok(json!({"echo": arguments}))
        }
    }

    pub struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky_report"
        }

        fn description(&self) -> &str {
            "Always fails"
        }

        fn parameter_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: Value, _context: &ToolContext) -> Result<Value> {
            bail!("upstream warehouse timed out")
        }
    }

    pub struct PanickingTool;

    #[async_trait]
    impl Tool for PanickingTool {
        fn name(&self) -> &str {
            "broken_tool"
        }

        fn description(&self) -> &str {
            "Panics"
        }

        fn parameter_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: Value, _context: &ToolContext) -> Result<Value> {
            panic!("index out of range")
        }
    }
}
