//! Append-only audit trail for privileged operations.
//!
//! Every gated operation emits [`AuditEvent`]s through an [`AuditSink`]. Sinks
//! fail soft: callers go through [`record_soft`], which logs a failed write and
//! lets the audited operation continue.

pub mod chain;
pub mod jsonl;
pub mod report;
pub mod sanitize;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::domain::principal::Principal;

pub use chain::{verify_chain, AuditChain, ChainVerification, SealedAuditRecord};
pub use jsonl::JsonlAuditSink;
pub use sanitize::{is_sensitive_key, sanitize_parameters, REDACTION_MARKER, SENSITIVE_KEY_PATTERNS};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink does not support `{0}`")]
    Unsupported(&'static str),
    #[error("audit write failed: {0}")]
    Write(String),
    #[error("audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Identity and correlation fields stamped onto every event of one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub principal_id: String,
    pub principal_username: Option<String>,
    pub principal_email: Option<String>,
    pub principal_groups: Vec<String>,
    pub conversation_id: String,
    pub request_id: String,
}

impl AuditContext {
    pub fn for_principal(
        principal: &Principal,
        conversation_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            principal_id: principal.id.clone(),
            principal_username: principal.username.clone(),
            principal_email: principal.email.clone(),
            principal_groups: principal.groups.iter().cloned().collect(),
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEventKind {
    AccessCheck {
        resource: String,
        required_groups: Vec<String>,
        access_granted: bool,
    },
    Invocation {
        invocation_id: String,
        tool_name: String,
        parameters: Map<String, Value>,
        sanitized: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        question: Option<String>,
    },
    Outcome {
        invocation_id: String,
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
        result_size: usize,
    },
    FeatureCheck {
        feature: String,
        required_groups: Vec<String>,
        access_granted: bool,
    },
    ResponseSummary {
        short_circuit: bool,
        component_count: usize,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AuditEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccessCheck { .. } => "access_check",
            Self::Invocation { .. } => "invocation",
            Self::Outcome { .. } => "outcome",
            Self::FeatureCheck { .. } => "feature_check",
            Self::ResponseSummary { .. } => "response_summary",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::AccessCheck { resource, .. } => Some(resource),
            Self::Invocation { tool_name, .. } | Self::Outcome { tool_name, .. } => Some(tool_name),
            Self::FeatureCheck { .. } | Self::ResponseSummary { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub principal_id: String,
    pub principal_username: Option<String>,
    pub principal_email: Option<String>,
    pub principal_groups: Vec<String>,
    pub conversation_id: String,
    pub request_id: String,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditEvent {
    pub fn new(context: &AuditContext, kind: AuditEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            principal_id: context.principal_id.clone(),
            principal_username: context.principal_username.clone(),
            principal_email: context.principal_email.clone(),
            principal_groups: context.principal_groups.clone(),
            conversation_id: context.conversation_id.clone(),
            request_id: context.request_id.clone(),
            kind,
        }
    }

    pub fn access_check<'a>(
        context: &AuditContext,
        resource: impl Into<String>,
        required_groups: impl IntoIterator<Item = &'a String>,
        access_granted: bool,
    ) -> Self {
        Self::new(
            context,
            AuditEventKind::AccessCheck {
                resource: resource.into(),
                required_groups: required_groups.into_iter().cloned().collect(),
                access_granted,
            },
        )
    }

    /// Builds an invocation event with sensitive parameter values redacted.
    /// Non-object arguments are recorded under a single `value` key.
    pub fn invocation(
        context: &AuditContext,
        invocation_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: &Value,
        question: Option<String>,
    ) -> Self {
        let raw = match arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
        };
        let (parameters, sanitized) = sanitize_parameters(&raw);
        Self::new(
            context,
            AuditEventKind::Invocation {
                invocation_id: invocation_id.into(),
                tool_name: tool_name.into(),
                parameters,
                sanitized,
                question,
            },
        )
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Filter for sinks that can answer queries. `limit == 0` means unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub event_type: Option<String>,
    pub principal_id: Option<String>,
    pub conversation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.as_deref().map_or(true, |kind| kind == event.event_type())
            && self.principal_id.as_deref().map_or(true, |id| id == event.principal_id)
            && self.conversation_id.as_deref().map_or(true, |id| id == event.conversation_id)
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp < until)
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;

    /// Sinks without query support keep this default so callers can tell
    /// "cannot query" apart from "no events".
    async fn query(&self, _query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        Err(AuditError::Unsupported("query"))
    }
}

pub async fn record_soft(sink: &dyn AuditSink, event: AuditEvent) {
    let event_type = event.event_type();
    let request_id = event.request_id.clone();
    if let Err(error) = sink.record(event).await {
        warn!(
            event_name = "audit.write_failed",
            audit_event_type = event_type,
            request_id = %request_id,
            error = %error,
            "audit event could not be recorded"
        );
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|event| event.event_type() == event_type).collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let mut matched: Vec<AuditEvent> =
            self.events().into_iter().filter(|event| query.matches(event)).collect();
        matched.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
        if query.limit > 0 {
            matched.truncate(query.limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::{
        record_soft, AuditContext, AuditError, AuditEvent, AuditEventKind, AuditQuery, AuditSink,
        InMemoryAuditSink, REDACTION_MARKER,
    };
    use crate::domain::principal::Principal;

    fn context() -> AuditContext {
        let principal = Principal::new("u-42")
            .with_username("ana")
            .with_email("ana@example.com")
            .with_groups(["sales"]);
        AuditContext::for_principal(&principal, "conv-1", "req-123")
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Write("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn in_memory_sink_records_events_with_correlation_fields() {
        let sink = InMemoryAuditSink::default();
        let groups = vec!["admin".to_string()];
        sink.record(AuditEvent::access_check(&context(), "export_all_data", &groups, false))
            .await
            .expect("in-memory sink never fails");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, "req-123");
        assert_eq!(events[0].conversation_id, "conv-1");
        assert_eq!(events[0].principal_groups, vec!["sales".to_string()]);
        assert!(matches!(
            events[0].kind,
            AuditEventKind::AccessCheck { access_granted: false, .. }
        ));
    }

    #[test]
    fn invocation_event_redacts_sensitive_parameters() {
        let event = AuditEvent::invocation(
            &context(),
            "inv-1",
            "run_sql",
            &json!({"sql": "SELECT 1", "api_key": "sk-live-xyz"}),
            None,
        );

        let AuditEventKind::Invocation { parameters, sanitized, .. } = event.kind else {
            panic!("expected invocation event");
        };
        assert!(sanitized);
        assert_eq!(parameters.get("sql"), Some(&json!("SELECT 1")));
        assert_eq!(parameters.get("api_key"), Some(&json!(REDACTION_MARKER)));
    }

    #[test]
    fn invocation_event_redacts_nested_connection_password() {
        let event = AuditEvent::invocation(
            &context(),
            "inv-2",
            "run_sql",
            &json!({"sql": "SELECT 1", "connection": {"password": "hunter2"}}),
            None,
        );

        let AuditEventKind::Invocation { parameters, sanitized, .. } = event.kind else {
            panic!("expected invocation event");
        };
        assert!(sanitized);
        assert_eq!(parameters["connection"]["password"], json!(REDACTION_MARKER));
        assert_eq!(parameters.get("sql"), Some(&json!("SELECT 1")));
    }

    #[test]
    fn wire_format_carries_event_type_and_envelope_fields() {
        let event = AuditEvent::new(
            &context(),
            AuditEventKind::ResponseSummary {
                short_circuit: true,
                component_count: 2,
                duration_ms: 5,
                error: None,
            },
        );
        let wire = serde_json::to_value(&event).expect("serialize event");

        assert_eq!(wire["event_type"], "response_summary");
        assert_eq!(wire["principal_id"], "u-42");
        assert_eq!(wire["principal_email"], "ana@example.com");
        assert_eq!(wire["request_id"], "req-123");
        assert!(wire["timestamp"].as_str().is_some_and(|ts| ts.contains('T')));

        let decoded: AuditEvent = serde_json::from_value(wire).expect("deserialize event");
        assert_eq!(decoded, event);
    }

    #[tokio::test]
    async fn query_filters_by_type_and_limit() {
        let sink = InMemoryAuditSink::default();
        let groups: Vec<String> = Vec::new();
        for _ in 0..3 {
            sink.record(AuditEvent::access_check(&context(), "list_customers", &groups, true))
                .await
                .expect("record");
        }
        sink.record(AuditEvent::invocation(&context(), "inv-2", "list_customers", &json!({}), None))
            .await
            .expect("record");

        let checks = sink
            .query(&AuditQuery {
                event_type: Some("access_check".to_string()),
                limit: 2,
                ..AuditQuery::default()
            })
            .await
            .expect("in-memory sink supports query");
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().all(|event| event.event_type() == "access_check"));
    }

    #[tokio::test]
    async fn sinks_without_query_support_signal_unsupported() {
        let result = FailingSink.query(&AuditQuery::default()).await;
        assert!(matches!(result, Err(AuditError::Unsupported("query"))));
    }

    #[tokio::test]
    async fn record_soft_swallows_write_failures() {
        let groups: Vec<String> = Vec::new();
        record_soft(&FailingSink, AuditEvent::access_check(&context(), "t", &groups, true)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_all_kept() {
        let sink = InMemoryAuditSink::default();

        let mut handles = Vec::new();
        for index in 0..50 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move {
                let groups: Vec<String> = Vec::new();
                let resource = format!("tool_{index}");
                let event = AuditEvent::access_check(&context(), resource, &groups, true);
                sink.record(event).await.expect("in-memory sink never fails");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let events = sink.events();
        assert_eq!(events.len(), 50);
        let mut ids: Vec<&str> = events.iter().map(|event| event.event_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
