//! Offline analysis of a persisted audit trail.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{AuditEvent, AuditEventKind};

const TOP_ERRORS: usize = 5;
const SAMPLE_QUESTIONS: usize = 5;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_outcomes: usize,
    pub successful: usize,
    pub failed: usize,
    pub denied_access_checks: usize,
    pub unique_principals: usize,
    pub tool_usage: Vec<(String, usize)>,
    pub top_errors: Vec<(String, usize)>,
    pub sample_questions: Vec<String>,
}

impl AuditSummary {
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_outcomes > 0).then(|| self.successful as f64 / self.total_outcomes as f64)
    }
}

/// A question/arguments pair taken from a successful tool invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SuccessfulUsage {
    pub question: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub principal_id: String,
}

pub fn summarize<'a>(events: impl IntoIterator<Item = &'a AuditEvent>) -> AuditSummary {
    let mut summary = AuditSummary::default();
    let mut principals = BTreeSet::new();
    let mut tools: BTreeMap<String, usize> = BTreeMap::new();
    let mut errors: BTreeMap<String, usize> = BTreeMap::new();

    for event in events {
        principals.insert(event.principal_id.clone());
        match &event.kind {
            AuditEventKind::Outcome { tool_name, success, error, .. } => {
                summary.total_outcomes += 1;
                *tools.entry(tool_name.clone()).or_default() += 1;
                if *success {
                    summary.successful += 1;
                } else {
                    summary.failed += 1;
                    let message = error.clone().unwrap_or_else(|| "unknown error".to_string());
                    *errors.entry(message).or_default() += 1;
                }
            }
            AuditEventKind::AccessCheck { access_granted: false, .. } => {
                summary.denied_access_checks += 1;
            }
            AuditEventKind::Invocation { question: Some(question), .. } => {
                if summary.sample_questions.len() < SAMPLE_QUESTIONS {
                    summary.sample_questions.push(question.clone());
                }
            }
            _ => {}
        }
    }

    summary.unique_principals = principals.len();
    summary.tool_usage = sorted_by_count(tools);
    summary.top_errors = sorted_by_count(errors).into_iter().take(TOP_ERRORS).collect();
    summary
}

/// Joins invocations to their outcomes and keeps the successful ones for
/// `tool_name` that recorded a question and were not redacted.
pub fn export_successful_usages<'a>(
    events: impl IntoIterator<Item = &'a AuditEvent>,
    tool_name: &str,
) -> Vec<SuccessfulUsage> {
    let mut pending: HashMap<&str, &AuditEvent> = HashMap::new();
    let mut exported = Vec::new();

    for event in events {
        match &event.kind {
            AuditEventKind::Invocation { invocation_id, tool_name: name, .. }
                if name == tool_name =>
            {
                pending.insert(invocation_id.as_str(), event);
            }
            AuditEventKind::Outcome { invocation_id, success: true, .. } => {
                let Some(invocation) = pending.remove(invocation_id.as_str()) else {
                    continue;
                };
                if let AuditEventKind::Invocation {
                    parameters,
                    sanitized: false,
                    question: Some(question),
                    ..
                } = &invocation.kind
                {
                    exported.push(SuccessfulUsage {
                        question: question.clone(),
                        tool_name: tool_name.to_string(),
                        arguments: parameters.clone(),
                        timestamp: invocation.timestamp,
                        principal_id: invocation.principal_id.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    exported
}

fn sorted_by_count(counts: BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
    entries
}
