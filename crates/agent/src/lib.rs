//! Request mediation for the tollgate assistant.
//!
//! Every inbound message goes through the [`orchestrator::Orchestrator`]:
//! 1. **Identity** (`identity`) - resolve the caller into a `Principal`
//! 2. **Routing** (`router`) - deterministic answers that skip reasoning
//! 3. **Context** (`prompt`, `enhancer`) - system prompt plus relevant memory
//! 4. **Reasoning handoff** - an external `ReasoningEngine` that may call back
//!    into the gated `ToolRegistry`
//!
//! # Safety Principle
//!
//! Tools are only reachable through `ToolRegistry::execute`, which checks
//! group access and audits every call. Warehouse SQL additionally passes the
//! read-only guard in `guardrails`.

pub mod components;
pub mod enhancer;
pub mod guardrails;
pub mod identity;
pub mod memory_tools;
pub mod orchestrator;
pub mod prompt;
pub mod router;
pub mod tools;

pub use components::{ComponentStream, MenuOption, StatusLevel, UiComponent};
pub use enhancer::{AdaptiveSearch, MemoryContextEnhancer};
pub use guardrails::{ReadOnlySqlGuard, ReadOnlyViolation, RunSqlTool, SqlRunner};
pub use identity::{EmailGroupResolver, PrincipalResolver, RequestContext};
pub use memory_tools::register_memory_tools;
pub use orchestrator::{
    InboundRequest, Orchestrator, OrchestratorError, ReasoningEngine, ReasoningTurn, ResponseStream,
};
pub use prompt::{DomainKnowledge, SystemPromptBuilder};
pub use router::{
    CommandRouter, QuotaRouter, ReplayRouter, RouterError, RoutingDecision, WorkflowRouter,
};
pub use tools::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutcome, ToolRegistry};
