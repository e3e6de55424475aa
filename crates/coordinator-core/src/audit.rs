//! Audit Log: a fire-and-forget immutable operation record (§4.9).
//!
//! Never on a critical path: when configured asynchronously (the default),
//! `log_operation` returns immediately and the insert runs in a detached
//! task; a failed insert is silently dropped. Synchronous mode awaits the
//! insert and reports success or failure, for callers (tests, the CLI) that
//! need to know the write landed.

use crate::gateway::{Filter, PersistenceGateway};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

/// A stored audit entry, as returned by [`AuditLog::query`].
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Identity that performed the operation.
    pub agent_id: String,
    /// Kind of agent.
    pub agent_type: String,
    /// Operation name.
    pub operation: String,
    /// Structured parameters.
    pub parameters: Value,
    /// Structured result.
    pub result: Value,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message, if any.
    pub error_message: Option<String>,
    /// When it was recorded.
    pub created_at: String,
}

impl AuditEntry {
    fn from_row(row: &Value) -> Self {
        Self {
            agent_id: row["agent_id"].as_str().unwrap_or_default().to_string(),
            agent_type: row["agent_type"].as_str().unwrap_or_default().to_string(),
            operation: row["operation"].as_str().unwrap_or_default().to_string(),
            parameters: row.get("parameters").cloned().unwrap_or(Value::Null),
            result: row.get("result").cloned().unwrap_or(Value::Null),
            duration_ms: row["duration_ms"].as_u64().unwrap_or(0),
            success: row["success"].as_bool().unwrap_or(false),
            error_message: row["error_message"].as_str().map(ToString::to_string),
            created_at: row["created_at"].as_str().unwrap_or_default().to_string(),
        }
    }
}

/// `log_operation`/`query` from §4.9, plus the `query` read path for
/// inspecting what has already been recorded.
#[derive(Clone)]
pub struct AuditLog {
    gateway: Arc<dyn PersistenceGateway>,
    async_logging: bool,
}

impl AuditLog {
    /// Build an audit log over `gateway`. `async_logging` mirrors
    /// `AuditConfig::async_logging`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, async_logging: bool) -> Self {
        Self { gateway, async_logging }
    }

    /// Record one operation. In async mode (default) this never fails
    /// observably — a failed insert is dropped without retry. In sync mode
    /// the insert is awaited and failures are logged via `tracing::warn!`
    /// but still not propagated, since audit failures must never affect a
    /// caller's decision (§7).
    pub async fn log_operation(
        &self,
        agent_id: &str,
        agent_type: &str,
        operation: &str,
        parameters: Value,
        result: Value,
        duration_ms: u64,
        success: bool,
        error_message: Option<String>,
    ) {
        let row = json!({
            "agent_id": agent_id,
            "agent_type": agent_type,
            "operation": operation,
            "parameters": parameters,
            "result": result,
            "duration_ms": duration_ms,
            "success": success,
            "error_message": error_message,
        });

        if self.async_logging {
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(err) = gateway.insert("audit_log", row).await {
                    tracing::debug!(error = %err, "dropped audit log entry");
                }
            });
        } else if let Err(err) = self.gateway.insert("audit_log", row).await {
            tracing::warn!(error = %err, "failed to persist audit log entry");
        }
    }

    /// Read recent entries, most recent `limit` (default 50) matching the
    /// given optional filters.
    pub async fn query(
        &self,
        agent_id: Option<&str>,
        operation: Option<&str>,
        since: Option<&str>,
        limit: usize,
    ) -> crate::error::Result<Vec<AuditEntry>> {
        let mut filter = Filter::all().order_desc("created_at").limit(limit.max(1));
        if let Some(agent_id) = agent_id {
            filter = filter.eq("agent_id", agent_id);
        }
        if let Some(operation) = operation {
            filter = filter.eq("operation", operation);
        }
        if let Some(since) = since {
            filter = filter.gte("created_at", since);
        }
        let rows = self.gateway.query("audit_log", &filter).await?;
        Ok(rows.iter().map(AuditEntry::from_row).collect())
    }

    /// Start a timed scope for `operation_name`. The returned guard records
    /// duration automatically via `Drop` for the synchronous case; async
    /// callers should call [`AuditTimer::finish`] explicitly since `Drop`
    /// cannot await (§4.9.1).
    #[must_use]
    pub fn timed(&self, operation_name: impl Into<String>) -> AuditTimer<'_> {
        AuditTimer {
            log: self,
            operation: operation_name.into(),
            started: Instant::now(),
            finished: false,
        }
    }
}

/// RAII-style timing guard returned by [`AuditLog::timed`].
pub struct AuditTimer<'a> {
    log: &'a AuditLog,
    operation: String,
    started: Instant,
    finished: bool,
}

impl AuditTimer<'_> {
    /// Explicitly finish the timer, recording `success`/`error` and the
    /// elapsed duration. Required for async call sites; `Drop` cannot
    /// await the insert.
    pub async fn finish(mut self, agent_id: &str, agent_type: &str, success: bool, error: Option<String>) {
        self.finished = true;
        self.log
            .log_operation(
                agent_id,
                agent_type,
                &self.operation,
                Value::Null,
                Value::Null,
                self.started.elapsed().as_millis() as u64,
                success,
                error,
            )
            .await;
    }
}

impl Drop for AuditTimer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::trace!(
                operation = %self.operation,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "audit timer dropped without finish() — synchronous caller only"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    #[tokio::test]
    async fn synchronous_log_is_queryable() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        let audit = AuditLog::new(gateway, false);
        audit
            .log_operation("agent-a", "claude_code", "acquire_lock", json!({}), json!({}), 5, true, None)
            .await;
        let entries = audit.query(Some("agent-a"), None, None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, "acquire_lock");
    }

    #[tokio::test]
    async fn async_log_eventually_lands() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        let audit = AuditLog::new(gateway, true);
        audit
            .log_operation("agent-a", "claude_code", "claim_task", json!({}), json!({}), 5, true, None)
            .await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let entries = audit.query(None, None, None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
