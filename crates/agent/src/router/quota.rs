use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::info;

use tollgate_core::config::RoutingConfig;

use super::{RouteContext, RouterError, RoutingDecision, WorkflowRouter};
use crate::components::{StatusLevel, UiComponent};

const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Rolling-window cap on user messages per conversation.
#[derive(Clone, Debug)]
pub struct QuotaRouter {
    max_messages: usize,
    window: Duration,
}

impl QuotaRouter {
    pub fn new(max_messages: usize, window_secs: u64) -> Self {
        let window_secs =
            i64::try_from(window_secs.min(MAX_WINDOW_SECS)).unwrap_or(i64::MAX / 1000);
        Self { max_messages, window: Duration::seconds(window_secs) }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.quota_messages as usize, config.quota_window_secs)
    }
}

#[async_trait]
impl WorkflowRouter for QuotaRouter {
    fn name(&self) -> &str {
        "quota"
    }

    async fn route(
        &self,
        _message: &str,
        context: RouteContext<'_>,
    ) -> Result<RoutingDecision, RouterError> {
        let used = context.conversation.user_messages_since(Utc::now() - self.window);
        if used < self.max_messages {
            return Ok(RoutingDecision::pass_through());
        }

        info!(
            event_name = "router.quota.exceeded",
            principal_id = %context.principal.id,
            conversation_id = %context.conversation.id,
            request_id = context.request_id,
            used,
            limit = self.max_messages,
            "message quota reached"
        );
        let minutes = (self.window.num_seconds() + 59) / 60;
        Ok(RoutingDecision::respond(vec![UiComponent::status(
            StatusLevel::Warning,
            format!(
                "You have reached the limit of {} messages per {minutes} minutes. \
                 Please try again later.",
                self.max_messages
            ),
        )]))
    }
}
