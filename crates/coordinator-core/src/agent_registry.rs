//! Agent Registry: session registration, discovery, heartbeats, and
//! dead-agent cleanup (§4.8).
//!
//! Sessions are the unit of liveness; an `agent_id` may have several
//! concurrent `session_id`s (one per process). `cleanup_dead_agents` is
//! expected to run on an interval (the CLI exposes it as a one-shot
//! subcommand) rather than on every call, since it scans the full table.

use crate::error::{Error, Result};
use crate::gateway::{Filter, PersistenceGateway};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

/// A registered agent session, as returned by [`AgentRegistry::discover`].
#[derive(Debug, Clone)]
pub struct AgentSession {
    /// Stable identity across the agent's sessions.
    pub agent_id: String,
    /// Kind of agent (`claude_code`, `codex`, ...).
    pub agent_type: String,
    /// This particular process's session id.
    pub session_id: String,
    /// Declared capabilities (free-form tags).
    pub capabilities: Vec<String>,
    /// `active` or `disconnected`.
    pub status: String,
    /// The task this session is currently working on, if any.
    pub current_task: Option<String>,
    /// Most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// When this session first registered.
    pub started_at: DateTime<Utc>,
}

impl AgentSession {
    fn from_row(row: &Value) -> Result<Self> {
        Ok(Self {
            agent_id: row["agent_id"].as_str().unwrap_or_default().to_string(),
            agent_type: row["agent_type"].as_str().unwrap_or_default().to_string(),
            session_id: row["session_id"].as_str().unwrap_or_default().to_string(),
            capabilities: row["capabilities"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
                .unwrap_or_default(),
            status: row["status"].as_str().unwrap_or_default().to_string(),
            current_task: row["current_task"].as_str().map(ToString::to_string),
            last_heartbeat: parse_timestamp(&row["last_heartbeat"])?,
            started_at: parse_timestamp(&row["started_at"])?,
        })
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let raw = value.as_str().ok_or_else(|| Error::ValidationFailed {
        issues: vec!["missing timestamp".into()],
    })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::ValidationFailed { issues: vec![e.to_string()] })
}

/// Outcome of one [`AgentRegistry::cleanup_dead_agents`] sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Sessions marked disconnected.
    pub agents_cleaned: u64,
    /// Locks released because their holding session went stale.
    pub locks_released: u64,
}

/// Agent Registry operations, layered on the Persistence Gateway.
#[derive(Clone)]
pub struct AgentRegistry {
    gateway: Arc<dyn PersistenceGateway>,
}

impl AgentRegistry {
    /// Build a registry over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Register (or re-register) a session for `agent_id`. Re-registering
    /// the same `(agent_id, session_id)` pair refreshes it in place rather
    /// than creating a duplicate row.
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        session_id: Option<&str>,
        capabilities: &[String],
        current_task: Option<&str>,
    ) -> Result<String> {
        let result = self
            .gateway
            .rpc(
                "register_agent_session",
                json!({
                    "agent_id": agent_id,
                    "agent_type": agent_type,
                    "session_id": session_id,
                    "capabilities": capabilities,
                    "current_task": current_task,
                }),
            )
            .await?;
        Ok(result["session_id"].as_str().unwrap_or_default().to_string())
    }

    /// Refresh liveness for `session_id`.
    pub async fn heartbeat(&self, session_id: &str) -> Result<()> {
        self.gateway
            .rpc("agent_heartbeat", json!({"session_id": session_id}))
            .await?;
        Ok(())
    }

    /// List active (or all, if `active_only` is false) sessions, optionally
    /// narrowed to one `agent_type`.
    pub async fn discover(&self, agent_type: Option<&str>, active_only: bool) -> Result<Vec<AgentSession>> {
        let mut filter = Filter::all();
        if let Some(agent_type) = agent_type {
            filter = filter.eq("agent_type", agent_type);
        }
        if active_only {
            filter = filter.eq("status", "active");
        }
        let rows = self.gateway.query("agent_sessions", &filter).await?;
        rows.iter().map(AgentSession::from_row).collect()
    }

    /// Mark sessions stale past `staleness_threshold_secs` as disconnected
    /// and release any locks they held.
    pub async fn cleanup_dead_agents(&self, staleness_threshold_secs: i64) -> Result<CleanupReport> {
        let result = self
            .gateway
            .rpc(
                "cleanup_dead_agents",
                json!({"staleness_threshold_secs": staleness_threshold_secs}),
            )
            .await?;
        Ok(CleanupReport {
            agents_cleaned: result["agents_cleaned"].as_u64().unwrap_or(0),
            locks_released: result["locks_released"].as_u64().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;
    use crate::locks::LockService;
    use crate::config::LockConfig;
    use std::time::Duration;

    async fn registry_with_gateway() -> (AgentRegistry, Arc<dyn PersistenceGateway>) {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        (AgentRegistry::new(gateway.clone()), gateway)
    }

    #[tokio::test]
    async fn register_then_discover_active() {
        let (registry, _gateway) = registry_with_gateway().await;
        registry
            .register("agent-a", "claude_code", None, &["rust".to_string()], None)
            .await
            .unwrap();
        let sessions = registry.discover(Some("claude_code"), true).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].agent_id, "agent-a");
    }

    #[tokio::test]
    async fn reregistering_same_session_does_not_duplicate() {
        let (registry, _gateway) = registry_with_gateway().await;
        let session_id = registry
            .register("agent-a", "claude_code", None, &[], None)
            .await
            .unwrap();
        registry
            .register("agent-a", "claude_code", Some(&session_id), &[], Some("task-1"))
            .await
            .unwrap();
        let sessions = registry.discover(None, false).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].current_task.as_deref(), Some("task-1"));
    }

    #[tokio::test]
    async fn cleanup_releases_locks_of_stale_sessions() {
        let (registry, gateway) = registry_with_gateway().await;
        let session_id = registry
            .register("agent-a", "claude_code", None, &[], None)
            .await
            .unwrap();
        let locks = LockService::new(
            gateway,
            LockConfig { default_ttl: Duration::from_secs(7200), max_ttl: Duration::from_secs(28800) },
        );
        locks
            .acquire("src/a.py", "agent-a", "agent", Some(&session_id), Duration::from_secs(7200), None)
            .await
            .unwrap();

        // staleness_threshold_secs of 0 treats the just-registered session
        // as already stale, since its heartbeat is not in the future.
        let report = registry.cleanup_dead_agents(0).await.unwrap();
        assert_eq!(report.agents_cleaned, 1);
        assert_eq!(report.locks_released, 1);

        let active = locks.check(None, None).await.unwrap();
        assert!(active.is_empty());
    }
}
