//! Injects relevant saved knowledge into the system prompt before the
//! reasoning engine runs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tollgate_core::config::MemoryConfig;
use tollgate_core::domain::conversation::Conversation;
use tollgate_core::memory::{MemoryError, MemoryStore, ScoredRecord, TextRecord, UsageRecord};

use crate::guardrails::RUN_SQL_TOOL;

const RULE: &str = "======================================================================";
const DEFAULT_KNOWLEDGE_EXAMPLES: usize = 3;
/// Upper bound on searches per adaptive lookup, whatever the step size.
const MAX_THRESHOLD_RUNGS: usize = 32;

/// Lowers the similarity threshold step by step until enough examples turn up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveSearch {
    pub min_threshold: f32,
    pub threshold_step: f32,
    pub min_examples: usize,
}

impl Default for AdaptiveSearch {
    fn default() -> Self {
        Self { min_threshold: 0.3, threshold_step: 0.1, min_examples: 1 }
    }
}

pub struct MemoryContextEnhancer {
    memory: Arc<dyn MemoryStore>,
    max_examples: usize,
    similarity_threshold: f32,
    include_metadata: bool,
    tool_name: String,
    adaptive: Option<AdaptiveSearch>,
    knowledge_examples: usize,
}

impl MemoryContextEnhancer {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            memory,
            max_examples: 5,
            similarity_threshold: 0.7,
            include_metadata: false,
            tool_name: RUN_SQL_TOOL.to_string(),
            adaptive: None,
            knowledge_examples: 0,
        }
    }

    pub fn from_config(config: &MemoryConfig, memory: Arc<dyn MemoryStore>) -> Self {
        let enhancer = Self::new(memory)
            .with_max_examples(config.max_examples)
            .with_similarity_threshold(config.similarity_threshold)
            .with_domain_knowledge(DEFAULT_KNOWLEDGE_EXAMPLES);
        if config.adaptive {
            enhancer.with_adaptive(AdaptiveSearch {
                min_threshold: config.min_threshold,
                threshold_step: config.threshold_step,
                min_examples: config.min_examples,
            })
        } else {
            enhancer
        }
    }

    pub fn with_max_examples(mut self, max_examples: usize) -> Self {
        self.max_examples = max_examples;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn for_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = tool_name.into();
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveSearch) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Also append up to `limit` free-text records; zero turns this off.
    pub fn with_domain_knowledge(mut self, limit: usize) -> Self {
        self.knowledge_examples = limit;
        self
    }

    /// Returns `system_prompt` with the examples appended. Memory failures
    /// leave the prompt unchanged.
    pub async fn enhance(&self, system_prompt: &str, conversation: &Conversation) -> String {
        let question = conversation.last_user_message().map(|message| message.content.as_str());
        let Some(question) = question else {
            debug!(
                event_name = "enhancer.skipped",
                reason = "no_user_question",
                "nothing to enhance"
            );
            return system_prompt.to_string();
        };

        let mut prompt = system_prompt.to_string();

        match self.search_usage(question).await {
            Ok(examples) if !examples.is_empty() => {
                info!(
                    event_name = "enhancer.examples_injected",
                    conversation_id = %conversation.id,
                    count = examples.len(),
                    "added past queries to prompt"
                );
                prompt.push_str(&self.past_queries_block(&examples));
            }
            Ok(_) => debug!(
                event_name = "enhancer.no_examples",
                conversation_id = %conversation.id,
                "no similar past queries"
            ),
            Err(error) => log_search_failure("usage", &error),
        }

        if self.knowledge_examples > 0 {
            let knowledge = self
                .memory
                .search_text(question, self.knowledge_examples, self.similarity_threshold)
                .await;
            match knowledge {
                Ok(records) if !records.is_empty() => prompt.push_str(&knowledge_block(&records)),
                Ok(_) => {}
                Err(error) => log_search_failure("text", &error),
            }
        }

        prompt
    }

    async fn search_usage(
        &self,
        question: &str,
    ) -> Result<Vec<ScoredRecord<UsageRecord>>, MemoryError> {
        let Some(adaptive) = self.adaptive else {
            return self.search_at(question, self.similarity_threshold).await;
        };

        let mut best = Vec::new();
        for threshold in threshold_ladder(self.similarity_threshold, adaptive) {
            let results = self.search_at(question, threshold).await?;
            if results.len() >= adaptive.min_examples {
                debug!(
                    event_name = "enhancer.adaptive_threshold",
                    threshold,
                    count = results.len(),
                    "threshold settled"
                );
                return Ok(results);
            }
            if results.len() > best.len() {
                best = results;
            }
        }
        Ok(best)
    }

    async fn search_at(
        &self,
        question: &str,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord<UsageRecord>>, MemoryError> {
        self.memory
            .search_usage(question, self.max_examples, threshold, Some(self.tool_name.as_str()))
            .await
    }

    fn past_queries_block(&self, examples: &[ScoredRecord<UsageRecord>]) -> String {
        let rendered = examples
            .iter()
            .enumerate()
            .map(|(index, example)| self.format_example(index + 1, &example.record))
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "\n\n{RULE}\nRELEVANT PAST QUERIES ({} example(s)):\n\n\
             The following are similar questions and their correct SQL queries from past \
             successful executions. Use these as reference patterns when generating SQL for \
             the current question.\n\n{rendered}\n{RULE}\n",
            examples.len()
        )
    }

    fn format_example(&self, number: usize, record: &UsageRecord) -> String {
        let sql = record.arguments.get("sql").and_then(|value| value.as_str()).unwrap_or_default();
        let mut example = format!(
            "Example {number}:\nQuestion: {}\nSQL:\n```sql\n{}\n```",
            record.question,
            sql.trim()
        );
        if self.include_metadata {
            example.push_str(&format!("\n(Saved: {})", record.timestamp.to_rfc3339()));
            let category = record.metadata.get("category").and_then(|value| value.as_str());
            if let Some(category) = category {
                example.push_str(&format!("\n(Category: {category})"));
            }
        }
        example
    }
}

/// Thresholds from `initial` down to the floor, computed by multiplication
/// so rounding never skips the last rung. Steps too small for
/// `MAX_THRESHOLD_RUNGS` are widened to cover the same span.
fn threshold_ladder(initial: f32, adaptive: AdaptiveSearch) -> Vec<f32> {
    let span = initial - adaptive.min_threshold;
    if adaptive.threshold_step.is_nan() || adaptive.threshold_step <= 0.0 || span <= 0.0 {
        return vec![initial];
    }
    let step = adaptive.threshold_step.max(span / MAX_THRESHOLD_RUNGS as f32);
    let rungs = (((span + 1e-4) / step).floor() as usize).min(MAX_THRESHOLD_RUNGS);
    (0..=rungs).map(|rung| (initial - step * rung as f32).max(0.0)).collect()
}

fn knowledge_block(records: &[ScoredRecord<TextRecord>]) -> String {
    let rendered = records
        .iter()
        .map(|hit| format!("- {}", hit.record.content.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "\n\n{RULE}\nDOMAIN KNOWLEDGE ({} note(s)):\n\n\
         Saved definitions and notes that may apply to the current question.\n\n\
         {rendered}\n{RULE}\n",
        records.len()
    )
}

fn log_search_failure(kind: &'static str, error: &MemoryError) {
    match error {
        MemoryError::Unsupported(operation) => debug!(
            event_name = "enhancer.search_unsupported",
            kind,
            operation,
            "memory backend cannot search"
        ),
        other => warn!(
            event_name = "enhancer.search_failed",
            kind,
            error = %other,
            "memory search failed"
        ),
    }
}
