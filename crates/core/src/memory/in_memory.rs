use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    most_recent, rank_by_similarity, ClearFilter, Embedder, HashingEmbedder, MemoryError,
    MemoryId, MemoryStore, NewUsage, ScoredRecord, TextRecord, UsageRecord,
};

/// Process-local memory backend. Supports every capability, including recency.
pub struct InMemoryMemoryStore {
    embedder: Arc<dyn Embedder>,
    usage: RwLock<Vec<UsageRecord>>,
    text: RwLock<Vec<TextRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder, usage: RwLock::new(Vec::new()), text: RwLock::new(Vec::new()) }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(HashingEmbedder::default()))
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn write_usage(&self, usage: NewUsage) -> Result<UsageRecord, MemoryError> {
        if usage.tool_name.trim().is_empty() {
            return Err(MemoryError::InvalidInput("tool name must not be empty".to_string()));
        }
        let record = UsageRecord {
            id: MemoryId::generate(),
            embedding: self.embedder.embed(&usage.question)?,
            question: usage.question,
            tool_name: usage.tool_name,
            arguments: usage.arguments,
            success: usage.success,
            metadata: usage.metadata,
            timestamp: Utc::now(),
        };
        self.usage.write().await.push(record.clone());
        Ok(record)
    }

    async fn write_text(&self, content: &str) -> Result<TextRecord, MemoryError> {
        let record = TextRecord {
            id: MemoryId::generate(),
            content: content.to_string(),
            timestamp: Utc::now(),
            embedding: self.embedder.embed(content)?,
        };
        self.text.write().await.push(record.clone());
        Ok(record)
    }

    async fn search_usage(
        &self,
        question: &str,
        limit: usize,
        similarity_threshold: f32,
        tool_name: Option<&str>,
    ) -> Result<Vec<ScoredRecord<UsageRecord>>, MemoryError> {
        let query = self.embedder.embed(question)?;
        let usage = self.usage.read().await;
        let candidates = usage
            .iter()
            .filter(|record| tool_name.map_or(true, |name| record.tool_name == name))
            .cloned();
        Ok(rank_by_similarity(&query, candidates, limit, similarity_threshold))
    }

    async fn search_text(
        &self,
        query: &str,
        limit: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredRecord<TextRecord>>, MemoryError> {
        let query = self.embedder.embed(query)?;
        let text = self.text.read().await;
        Ok(rank_by_similarity(&query, text.iter().cloned(), limit, similarity_threshold))
    }

    async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, MemoryError> {
        let usage = self.usage.read().await;
        Ok(most_recent(usage.iter().cloned(), limit))
    }

    async fn recent_text(&self, limit: usize) -> Result<Vec<TextRecord>, MemoryError> {
        let text = self.text.read().await;
        Ok(most_recent(text.iter().cloned(), limit))
    }

    async fn delete_usage(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        let mut usage = self.usage.write().await;
        let before = usage.len();
        usage.retain(|record| &record.id != id);
        Ok(usage.len() != before)
    }

    async fn delete_text(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        let mut text = self.text.write().await;
        let before = text.len();
        text.retain(|record| &record.id != id);
        Ok(text.len() != before)
    }

    async fn clear_usage(&self, filter: &ClearFilter) -> Result<usize, MemoryError> {
        let mut usage = self.usage.write().await;
        let before = usage.len();
        usage.retain(|record| !filter.matches_usage(record));
        Ok(before - usage.len())
    }

    async fn clear_text(&self, before: Option<DateTime<Utc>>) -> Result<usize, MemoryError> {
        let filter = ClearFilter { tool_name: None, before };
        let mut text = self.text.write().await;
        let count = text.len();
        text.retain(|record| !filter.matches_text(record));
        Ok(count - text.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::memory::{
        ClearFilter, Embedder, InMemoryMemoryStore, MemoryError, MemoryId, MemoryStore, NewUsage,
    };

    /// Maps known strings onto fixed vectors so scores are exact.
    struct FixedEmbedder {
        vectors: HashMap<&'static str, Vec<f32>>,
    }

    impl Embedder for FixedEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            Ok(self.vectors.get(text).cloned().unwrap_or_else(|| vec![0.0, 1.0]))
        }
    }

    fn churn_store() -> InMemoryMemoryStore {
        let vectors = HashMap::from([
            ("churn definition", vec![1.0, 0.0]),
            ("Churn is the share of customers lost in a month", vec![0.95, 0.3122]),
            ("Churned accounts exclude paused subscriptions", vec![0.8, 0.6]),
            ("Revenue is recognised on delivery", vec![0.6, 0.8]),
            ("Regions: EMEA, AMER, APAC", vec![0.2, 0.98]),
            ("Fiscal year starts in February", vec![0.0, 1.0]),
        ]);
        InMemoryMemoryStore::new(Arc::new(FixedEmbedder { vectors }))
    }

    #[tokio::test]
    async fn text_search_returns_only_matches_above_threshold_best_first() {
        let store = churn_store();
        for content in [
            "Revenue is recognised on delivery",
            "Churned accounts exclude paused subscriptions",
            "Regions: EMEA, AMER, APAC",
            "Churn is the share of customers lost in a month",
            "Fiscal year starts in February",
        ] {
            store.write_text(content).await.expect("write text");
        }

        let hits = store.search_text("churn definition", 3, 0.7).await.expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.content, "Churn is the share of customers lost in a month");
        assert_eq!(hits[1].record.content, "Churned accounts exclude paused subscriptions");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|hit| hit.score >= 0.7));
    }

    #[tokio::test]
    async fn usage_search_honours_tool_filter() {
        let store = InMemoryMemoryStore::default();
        store
            .write_usage(NewUsage::new(
                "total sales last month",
                "run_sql",
                json!({"sql": "SELECT SUM(amount) FROM sales"}),
            ))
            .await
            .expect("write sql usage");
        store
            .write_usage(NewUsage::new(
                "total sales last month",
                "export_csv",
                json!({"table": "sales"}),
            ))
            .await
            .expect("write export usage");

        let hits = store
            .search_usage("total sales last month", 10, 0.5, Some("run_sql"))
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.tool_name, "run_sql");
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn delete_reports_presence_without_failing_on_missing_ids() {
        let store = InMemoryMemoryStore::default();
        let record = store.write_text("orders ship within two days").await.expect("write");

        assert!(store.delete_text(&record.id).await.expect("delete existing"));
        assert!(!store.delete_text(&record.id).await.expect("delete again"));
        assert!(!store.delete_usage(&MemoryId::generate()).await.expect("delete unknown"));
        assert!(store.recent_text(10).await.expect("recent").is_empty());
    }

    #[tokio::test]
    async fn clear_with_filters_removes_only_matching_usage() {
        let store = InMemoryMemoryStore::default();
        store
            .write_usage(NewUsage::new("q1", "run_sql", json!({"sql": "SELECT 1"})))
            .await
            .expect("write");
        store
            .write_usage(NewUsage::new("q2", "visualize", json!({"chart": "bar"})))
            .await
            .expect("write");

        let future_cutoff = Utc::now() + Duration::minutes(1);
        let removed = store
            .clear_usage(&ClearFilter {
                tool_name: Some("run_sql".to_string()),
                before: Some(future_cutoff),
            })
            .await
            .expect("clear");
        assert_eq!(removed, 1);

        let remaining = store.recent_usage(10).await.expect("recent");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tool_name, "visualize");

        let removed = store.clear_usage(&ClearFilter::default()).await.expect("clear all");
        assert_eq!(removed, 1);
        assert!(store.recent_usage(10).await.expect("recent").is_empty());
    }

    #[tokio::test]
    async fn recent_text_is_reverse_chronological() {
        let store = InMemoryMemoryStore::default();
        store.write_text("first").await.expect("write");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.write_text("second").await.expect("write");

        let recent = store.recent_text(1).await.expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "second");
    }

    #[tokio::test]
    async fn empty_tool_name_is_rejected() {
        let store = InMemoryMemoryStore::default();
        let error = store
            .write_usage(NewUsage::new("q", " ", json!({})))
            .await
            .expect_err("blank tool name");
        assert!(matches!(error, MemoryError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_are_all_kept() {
        let store = Arc::new(InMemoryMemoryStore::default());

        let mut handles = Vec::new();
        for index in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.write_text(&format!("note {index}")).await.expect("write text");
                store
                    .write_usage(NewUsage::new(format!("question {index}"), "run_sql", json!({})))
                    .await
                    .expect("write usage");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let texts = store.recent_text(100).await.expect("recent text");
        assert_eq!(texts.len(), 50);
        let mut ids: Vec<MemoryId> = texts.into_iter().map(|record| record.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);
        assert_eq!(store.recent_usage(100).await.expect("recent usage").len(), 50);
    }
}
