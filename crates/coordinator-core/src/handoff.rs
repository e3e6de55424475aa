//! Handoff Store: append-only session handoff documents (§4.10).
//!
//! Handoffs are never edited or deleted — a new handoff supersedes the
//! previous one for the same session only by being more recent, so
//! `read_latest` is a query, not a pointer update.

use crate::error::Result;
use crate::gateway::{Filter, PersistenceGateway};
use serde_json::{Value, json};
use std::sync::Arc;

/// A single handoff document, as written by an agent ending its session.
#[derive(Debug, Clone)]
pub struct Handoff {
    /// The id assigned at write time.
    pub id: String,
    /// Name of the agent that wrote this handoff.
    pub agent_name: String,
    /// The session it was written for, if scoped to one.
    pub session_id: Option<String>,
    /// One-paragraph summary of the session.
    pub summary: String,
    /// Work items completed this session.
    pub completed_work: Vec<String>,
    /// Work items left in progress.
    pub in_progress: Vec<String>,
    /// Notable decisions made and their rationale.
    pub decisions: Vec<String>,
    /// Suggested next steps for whoever picks this up.
    pub next_steps: Vec<String>,
    /// Files touched or worth reviewing.
    pub relevant_files: Vec<String>,
    /// When it was written.
    pub created_at: String,
}

impl Handoff {
    fn from_row(row: &Value) -> Self {
        Self {
            id: row["id"].as_str().unwrap_or_default().to_string(),
            agent_name: row["agent_name"].as_str().unwrap_or_default().to_string(),
            session_id: row["session_id"].as_str().map(ToString::to_string),
            summary: row["summary"].as_str().unwrap_or_default().to_string(),
            completed_work: string_list(&row["completed_work"]),
            in_progress: string_list(&row["in_progress"]),
            decisions: string_list(&row["decisions"]),
            next_steps: string_list(&row["next_steps"]),
            relevant_files: string_list(&row["relevant_files"]),
            created_at: row["created_at"].as_str().unwrap_or_default().to_string(),
        }
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
        .unwrap_or_default()
}

/// Handoff Store operations, layered on the Persistence Gateway.
#[derive(Clone)]
pub struct HandoffStore {
    gateway: Arc<dyn PersistenceGateway>,
}

impl HandoffStore {
    /// Build a handoff store over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Write a new handoff document. Always inserts; never updates an
    /// existing row.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        agent_name: &str,
        session_id: Option<&str>,
        summary: &str,
        completed_work: &[String],
        in_progress: &[String],
        decisions: &[String],
        next_steps: &[String],
        relevant_files: &[String],
    ) -> Result<String> {
        let result = self
            .gateway
            .rpc(
                "write_handoff",
                json!({
                    "agent_name": agent_name,
                    "session_id": session_id,
                    "summary": summary,
                    "completed_work": completed_work,
                    "in_progress": in_progress,
                    "decisions": decisions,
                    "next_steps": next_steps,
                    "relevant_files": relevant_files,
                }),
            )
            .await?;
        Ok(result["id"].as_str().unwrap_or_default().to_string())
    }

    /// Read the most recent handoff, optionally scoped to one session.
    /// Returns `None` if no handoff exists yet.
    pub async fn read_latest(&self, session_id: Option<&str>) -> Result<Option<Handoff>> {
        let result = self
            .gateway
            .rpc("read_handoff", json!({"session_id": session_id}))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(Handoff::from_row(&result)))
    }

    /// List all handoffs, most recent first, optionally scoped to one
    /// session — a history view beyond the `write`/`read_latest` pair.
    pub async fn list(&self, session_id: Option<&str>, limit: usize) -> Result<Vec<Handoff>> {
        let mut filter = Filter::all().order_desc("created_at").limit(limit.max(1));
        if let Some(session_id) = session_id {
            filter = filter.eq("session_id", session_id);
        }
        let rows = self.gateway.query("handoff_documents", &filter).await?;
        Ok(rows.iter().map(Handoff::from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn store() -> HandoffStore {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        HandoffStore::new(gateway)
    }

    #[tokio::test]
    async fn read_latest_is_none_before_any_write() {
        let store = store().await;
        assert!(store.read_latest(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_write_wins_and_history_is_append_only() {
        let store = store().await;
        store
            .write("agent-a", Some("s1"), "first pass", &["a".into()], &[], &[], &[], &[])
            .await
            .unwrap();
        store
            .write("agent-a", Some("s1"), "second pass", &["a".into(), "b".into()], &[], &[], &[], &[])
            .await
            .unwrap();

        let latest = store.read_latest(Some("s1")).await.unwrap().unwrap();
        assert_eq!(latest.summary, "second pass");

        let history = store.list(Some("s1"), 10).await.unwrap();
        assert_eq!(history.len(), 2);
    }
}
