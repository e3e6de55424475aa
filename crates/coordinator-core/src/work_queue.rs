//! Work Queue: a priority+FIFO queue of tasks with inter-task dependencies,
//! atomic single-claim semantics, and lifecycle states (§4.3).

use crate::error::{Error, Result};
use crate::gateway::{Filter, PersistenceGateway};
use crate::guardrails::GuardrailsEngine;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::sync::Arc;

/// Maximum rows `get_pending`/`get_my_tasks` will ever return in one call.
pub const MAX_PAGE_SIZE: usize = 100;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed, not yet started.
    Claimed,
    /// In progress (set by the holder; the gateway schema does not enforce
    /// this transition, it is informational).
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Completed but its result was withheld by a guardrail block.
    Blocked,
}

/// A work queue task.
#[derive(Debug, Clone)]
pub struct Task {
    /// Task identifier.
    pub id: String,
    /// Caller-defined type, used for claim filtering.
    pub task_type: String,
    /// Human-readable description.
    pub description: String,
    /// Caller-supplied input payload.
    pub input_payload: Value,
    /// 1 (highest) .. 10 (lowest).
    pub priority: i64,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Current holder, if claimed.
    pub claimed_by: Option<String>,
    /// When claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Result payload, populated on completion (or retained on block).
    pub result_payload: Value,
    /// Error message, if failed.
    pub error_message: Option<String>,
    /// Ids this task is gated on.
    pub depends_on: Vec<String>,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// When it was submitted.
    pub created_at: DateTime<Utc>,
}

impl Task {
    fn from_row(row: &Value) -> Result<Self> {
        Ok(Self {
            id: field_str(row, "id")?,
            task_type: row["type"].as_str().unwrap_or_default().to_string(),
            description: row["description"].as_str().unwrap_or_default().to_string(),
            input_payload: row.get("input_payload").cloned().unwrap_or(Value::Null),
            priority: row["priority"].as_i64().unwrap_or(5),
            status: row["status"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(TaskStatus::Pending),
            claimed_by: row["claimed_by"].as_str().map(ToString::to_string),
            claimed_at: optional_timestamp(&row["claimed_at"]),
            completed_at: optional_timestamp(&row["completed_at"]),
            result_payload: row.get("result_payload").cloned().unwrap_or(Value::Null),
            error_message: row["error_message"].as_str().map(ToString::to_string),
            depends_on: row["depends_on"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
                .unwrap_or_default(),
            deadline: optional_timestamp(&row["deadline"]),
            created_at: optional_timestamp(&row["created_at"]).unwrap_or_else(Utc::now),
        })
    }
}

fn field_str(row: &Value, field: &str) -> Result<String> {
    row[field]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| Error::ValidationFailed {
            issues: vec![format!("task row missing {field}")],
        })
}

fn optional_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Outcome of a [`WorkQueue::claim`] call.
#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// A task was claimed.
    Claimed(Task),
    /// Nothing matched the filter and dependency gate.
    Unavailable,
    /// The only eligible task's content was blocked by a guardrail; it was
    /// returned to `pending` and the caller should retry or inspect it.
    Blocked {
        /// Which pattern(s) blocked it.
        patterns: String,
    },
}

/// `submit`/`claim`/`complete`/pagination operations from §4.3.
#[derive(Clone)]
pub struct WorkQueue {
    gateway: Arc<dyn PersistenceGateway>,
    guardrails: GuardrailsEngine,
}

impl WorkQueue {
    /// Build a work queue over `gateway`, with guardrail checks wired in at
    /// submit, claim, and complete.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, guardrails: GuardrailsEngine) -> Self {
        Self { gateway, guardrails }
    }

    /// Submit a task. Rejects with `Error::DestructiveOperationBlocked` if
    /// the description or serialized input matches a block pattern at
    /// `trust_level`.
    pub async fn submit(
        &self,
        task_type: &str,
        description: &str,
        input: Value,
        priority: i64,
        depends_on: Vec<String>,
        deadline: Option<DateTime<Utc>>,
        trust_level: u8,
    ) -> Result<String> {
        let check = self
            .guardrails
            .check_operation(
                &format!("{description} {input}"),
                &[],
                trust_level,
                None,
                "submit_task",
            )
            .await;
        if !check.safe {
            return Err(Error::DestructiveOperationBlocked {
                patterns: check.blocked_pattern_names(),
            });
        }

        let result = self
            .gateway
            .rpc(
                "submit_task",
                json!({
                    "type": task_type,
                    "description": description,
                    "input": input,
                    "priority": priority.clamp(1, 10),
                    "depends_on": depends_on,
                    "deadline": deadline.map(|d| d.to_rfc3339()),
                }),
            )
            .await?;
        field_str(&result, "id")
    }

    /// Atomically claim the highest-priority, earliest-created eligible
    /// pending task, re-scanning its content against the claiming agent's
    /// trust level.
    pub async fn claim(&self, agent: &str, types: Option<&[String]>, trust_level: u8) -> Result<ClaimResult> {
        let result = self
            .gateway
            .rpc("claim_task", json!({"agent": agent, "types": types}))
            .await?;
        if result["status"] != "claimed" {
            return Ok(ClaimResult::Unavailable);
        }
        let task = Task::from_row(&result["task"])?;

        let check = self
            .guardrails
            .check_operation(
                &format!("{} {}", task.description, task.input_payload),
                &[],
                trust_level,
                Some(agent),
                "claim_task",
            )
            .await;
        if !check.safe {
            // Return the task to pending rather than leaving it claimed by
            // an agent that never gets to act on it (§4.3).
            self.gateway
                .update(
                    "work_queue",
                    &Filter::all().eq("id", task.id.clone()),
                    json!({"status": "pending", "claimed_by": Value::Null, "claimed_at": Value::Null}),
                )
                .await?;
            return Ok(ClaimResult::Blocked {
                patterns: check.blocked_pattern_names(),
            });
        }

        Ok(ClaimResult::Claimed(task))
    }

    /// Complete a task the caller holds. On success, scans the serialized
    /// result against `trust_level`; a block marks the task `blocked`
    /// (preserving the result payload) rather than `completed`.
    pub async fn complete(
        &self,
        task_id: &str,
        agent: &str,
        success: bool,
        result: Value,
        error: Option<&str>,
        trust_level: u8,
    ) -> Result<TaskStatus> {
        let blocked = if success {
            let check = self
                .guardrails
                .check_operation(&result.to_string(), &[], trust_level, Some(agent), "complete_task")
                .await;
            !check.safe
        } else {
            false
        };

        let response = self
            .gateway
            .rpc(
                "complete_task",
                json!({
                    "task_id": task_id,
                    "agent": agent,
                    "success": success,
                    "result": result,
                    "error_message": error,
                    "blocked": blocked,
                }),
            )
            .await?;

        response["status"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::ValidationFailed {
                issues: vec!["complete_task returned no status".into()],
            })
    }

    /// Pending tasks, optionally filtered by type, capped at
    /// [`MAX_PAGE_SIZE`].
    pub async fn get_pending(&self, types: Option<&[String]>, limit: usize) -> Result<Vec<Task>> {
        let mut filter = Filter::all().eq("status", "pending").order_asc("priority").order_asc("created_at");
        filter = filter.limit(limit.min(MAX_PAGE_SIZE));
        let rows = self.gateway.query("work_queue", &filter).await?;
        let rows = match types {
            Some(types) => rows
                .into_iter()
                .filter(|r| r["type"].as_str().is_some_and(|t| types.iter().any(|x| x == t)))
                .collect(),
            None => rows,
        };
        rows.iter().map(Task::from_row).collect()
    }

    /// Tasks claimed by `agent`, optionally including terminal ones.
    pub async fn get_my_tasks(&self, agent: &str, include_completed: bool) -> Result<Vec<Task>> {
        let filter = Filter::all().eq("claimed_by", agent).limit(MAX_PAGE_SIZE);
        let rows = self.gateway.query("work_queue", &filter).await?;
        rows.iter()
            .filter(|r| {
                include_completed
                    || !matches!(
                        r["status"].as_str(),
                        Some("completed") | Some("failed") | Some("blocked")
                    )
            })
            .map(Task::from_row)
            .collect()
    }

    /// Fetch a single task by id.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let rows = self.gateway.query("work_queue", &Filter::all().eq("id", id)).await?;
        let row = rows.first().ok_or_else(|| Error::not_found("task", id))?;
        Task::from_row(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn queue() -> WorkQueue {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        WorkQueue::new(gateway.clone(), GuardrailsEngine::new(gateway))
    }

    #[tokio::test]
    async fn scenario_a_priority_fifo_and_dependency_gate() {
        let q = queue().await;
        let t1 = q
            .submit("build", "t1", json!({}), 3, vec![], None, 2)
            .await
            .unwrap();
        let t2 = q
            .submit("build", "t2", json!({}), 1, vec![], None, 2)
            .await
            .unwrap();
        let t3 = q
            .submit("build", "t3", json!({}), 1, vec![t2.clone()], None, 2)
            .await
            .unwrap();

        let first = q.claim("agent-a", None, 2).await.unwrap();
        let ClaimResult::Claimed(task) = first else { panic!("expected claim") };
        assert_eq!(task.id, t2);

        let second = q.claim("agent-a", None, 2).await.unwrap();
        let ClaimResult::Claimed(task) = second else { panic!("expected claim") };
        assert_eq!(task.id, t1);

        // t3 still gated on t2.
        let third = q.claim("agent-a", None, 2).await.unwrap();
        assert!(matches!(third, ClaimResult::Unavailable));

        q.complete(&t2, "agent-a", true, json!({"ok": true}), None, 2)
            .await
            .unwrap();

        let fourth = q.claim("agent-a", None, 2).await.unwrap();
        let ClaimResult::Claimed(task) = fourth else { panic!("expected claim") };
        assert_eq!(task.id, t3);
    }

    #[tokio::test]
    async fn submit_blocks_destructive_content() {
        let q = queue().await;
        let result = q
            .submit("shell", "run rm -rf /tmp", json!({}), 5, vec![], None, 0)
            .await;
        assert!(matches!(result, Err(Error::DestructiveOperationBlocked { .. })));
    }

    #[tokio::test]
    async fn only_holder_may_complete() {
        let q = queue().await;
        let id = q.submit("build", "t", json!({}), 5, vec![], None, 2).await.unwrap();
        q.claim("agent-a", None, 2).await.unwrap();
        let err = q
            .complete(&id, "agent-b", true, json!({}), None, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationDenied { .. }));
    }
}
