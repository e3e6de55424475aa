//! Episodic Memory: cross-session recall of notable events, deduplicated on
//! `(agent_id, event_type, summary)` (§4.11).
//!
//! A memory is a record an agent chooses to keep, not a transcript; callers
//! decide what is worth remembering and assign its `relevance_score`.

use crate::error::Result;
use crate::gateway::PersistenceGateway;
use serde_json::{Value, json};
use std::sync::Arc;

/// A stored episodic memory, as returned by [`EpisodicMemory::recall`].
#[derive(Debug, Clone)]
pub struct Memory {
    /// Row id.
    pub id: String,
    /// The agent that recorded it.
    pub agent_id: String,
    /// The session it was recorded in, if any.
    pub session_id: Option<String>,
    /// Category of event (`bug_found`, `design_decision`, ...).
    pub event_type: String,
    /// One-line summary, also the dedup key alongside `agent_id`/`event_type`.
    pub summary: String,
    /// Free-form structured detail.
    pub details: Value,
    /// What happened as a result, if known.
    pub outcome: Option<String>,
    /// Lessons drawn from the event.
    pub lessons: Option<String>,
    /// Free-form tags, searchable via `recall`.
    pub tags: Vec<String>,
    /// Caller-assigned importance, used to rank recall results.
    pub relevance_score: f64,
    /// When it was first recorded.
    pub created_at: String,
}

impl Memory {
    fn from_row(row: &Value) -> Self {
        Self {
            id: row["id"].as_str().unwrap_or_default().to_string(),
            agent_id: row["agent_id"].as_str().unwrap_or_default().to_string(),
            session_id: row["session_id"].as_str().map(ToString::to_string),
            event_type: row["event_type"].as_str().unwrap_or_default().to_string(),
            summary: row["summary"].as_str().unwrap_or_default().to_string(),
            details: row.get("details").cloned().unwrap_or(Value::Null),
            outcome: row["outcome"].as_str().map(ToString::to_string),
            lessons: row["lessons"].as_str().map(ToString::to_string),
            tags: row["tags"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
                .unwrap_or_default(),
            relevance_score: row["relevance_score"].as_f64().unwrap_or(0.0),
            created_at: row["created_at"].as_str().unwrap_or_default().to_string(),
        }
    }
}

/// Episodic Memory operations, layered on the Persistence Gateway.
#[derive(Clone)]
pub struct EpisodicMemory {
    gateway: Arc<dyn PersistenceGateway>,
}

impl EpisodicMemory {
    /// Build an episodic memory store over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Record an event. Repeating the same `(agent_id, event_type, summary)`
    /// triple updates the existing row's details/outcome/lessons/tags rather
    /// than creating a duplicate. Returns the memory's id and whether it
    /// deduplicated against an existing entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn remember(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        event_type: &str,
        summary: &str,
        details: Value,
        outcome: Option<&str>,
        lessons: Option<&str>,
        tags: &[String],
        relevance_score: f64,
    ) -> Result<(String, bool)> {
        let result = self
            .gateway
            .rpc(
                "store_episodic_memory",
                json!({
                    "agent_id": agent_id,
                    "session_id": session_id,
                    "event_type": event_type,
                    "summary": summary,
                    "details": details,
                    "outcome": outcome,
                    "lessons": lessons,
                    "tags": tags,
                    "relevance_score": relevance_score,
                }),
            )
            .await?;
        Ok((
            result["id"].as_str().unwrap_or_default().to_string(),
            result["deduplicated"].as_bool().unwrap_or(false),
        ))
    }

    /// Recall memories, most relevant first (relevance score descending,
    /// most recent first among ties), optionally narrowed by agent, event
    /// type, or tags.
    pub async fn recall(
        &self,
        agent_id: Option<&str>,
        event_type: Option<&str>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let result = self
            .gateway
            .rpc(
                "get_relevant_memories",
                json!({
                    "agent_id": agent_id,
                    "event_type": event_type,
                    "tags": tags,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(result
            .as_array()
            .map(|rows| rows.iter().map(Memory::from_row).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn memory() -> EpisodicMemory {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        EpisodicMemory::new(gateway)
    }

    #[tokio::test]
    async fn remember_dedupes_identical_events() {
        let memory = memory().await;
        let (id1, dup1) = memory
            .remember("agent-a", None, "bug_found", "off by one in claim sort", json!({}), None, None, &[], 0.5)
            .await
            .unwrap();
        assert!(!dup1);
        let (id2, dup2) = memory
            .remember(
                "agent-a",
                None,
                "bug_found",
                "off by one in claim sort",
                json!({"fixed": true}),
                Some("fixed"),
                None,
                &[],
                0.9,
            )
            .await
            .unwrap();
        assert!(dup2);
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn recall_orders_by_relevance_then_recency() {
        let memory = memory().await;
        memory
            .remember("agent-a", None, "note", "low relevance", json!({}), None, None, &[], 0.1)
            .await
            .unwrap();
        memory
            .remember("agent-a", None, "note", "high relevance", json!({}), None, None, &[], 0.9)
            .await
            .unwrap();

        let recalled = memory.recall(Some("agent-a"), None, &[], 10).await.unwrap();
        assert_eq!(recalled[0].summary, "high relevance");
    }

    #[tokio::test]
    async fn recall_filters_by_tag() {
        let memory = memory().await;
        memory
            .remember(
                "agent-a",
                None,
                "note",
                "tagged",
                json!({}),
                None,
                None,
                &["rust".to_string()],
                0.5,
            )
            .await
            .unwrap();
        memory
            .remember("agent-a", None, "note", "untagged", json!({}), None, None, &[], 0.5)
            .await
            .unwrap();

        let recalled = memory.recall(None, None, &["rust".to_string()], 10).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].summary, "tagged");
    }
}
