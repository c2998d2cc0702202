//! Deterministic routing ahead of the reasoning engine.
//!
//! Routers are tried in order by the orchestrator. The first one that
//! short-circuits answers the message; if none does, the message is
//! committed to history and handed to the reasoning engine.

mod command;
mod quota;
mod replay;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use tollgate_core::domain::conversation::Conversation;
use tollgate_core::domain::principal::Principal;
use tollgate_core::memory::MemoryError;

use crate::components::{component_stream, ComponentStream, UiComponent};
use crate::tools::ToolError;

pub use command::CommandRouter;
pub use quota::QuotaRouter;
pub use replay::ReplayRouter;

pub type ConversationMutation = Box<dyn FnOnce(&mut Conversation) + Send>;

pub struct RoutingDecision {
    pub short_circuit: bool,
    pub output: Option<ComponentStream>,
    pub mutation: Option<ConversationMutation>,
}

impl RoutingDecision {
    pub fn pass_through() -> Self {
        Self { short_circuit: false, output: None, mutation: None }
    }

    pub fn respond(components: Vec<UiComponent>) -> Self {
        Self::respond_with(component_stream(components))
    }

    pub fn respond_with(output: ComponentStream) -> Self {
        Self { short_circuit: true, output: Some(output), mutation: None }
    }

    pub fn with_mutation<F>(mut self, mutation: F) -> Self
    where
        F: FnOnce(&mut Conversation) + Send + 'static,
    {
        self.mutation = Some(Box::new(mutation));
        self
    }
}

impl fmt::Debug for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDecision")
            .field("short_circuit", &self.short_circuit)
            .field("has_output", &self.output.is_some())
            .field("has_mutation", &self.mutation.is_some())
            .finish()
    }
}

/// What a router gets to look at. The triggering message is not yet part
/// of `conversation`.
#[derive(Clone, Copy, Debug)]
pub struct RouteContext<'a> {
    pub principal: &'a Principal,
    pub conversation: &'a Conversation,
    pub request_id: &'a str,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router `{router}` failed: {reason}")]
    Failed { router: String, reason: String },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

#[async_trait]
pub trait WorkflowRouter: Send + Sync {
    fn name(&self) -> &str;

    /// Bootstrap output for an empty or starter request. History is never
    /// touched on this path.
    async fn starter(
        &self,
        _context: RouteContext<'_>,
    ) -> Result<Option<ComponentStream>, RouterError> {
        Ok(None)
    }

    async fn route(
        &self,
        message: &str,
        context: RouteContext<'_>,
    ) -> Result<RoutingDecision, RouterError>;
}
