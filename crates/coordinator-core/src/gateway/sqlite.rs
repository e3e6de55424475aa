//! The native persistence backend: an `sqlx::SqlitePool` wrapping
//! hand-written SQL for each table, with the stored-procedure—equivalent
//! logic of §6's atomic procedures expressed as Rust methods rather than
//! literal database procedures (SQLite has no server-side procedure
//! language).
//!
//! Every table is stored as a narrow `(id, data, created_at)` triple, with
//! `data` holding the row's JSON document. This keeps the schema uniform
//! across the ten tables named in §6 while the atomic procedures still get
//! real transactional isolation from SQLite's single-writer model: each
//! procedure reads the rows it needs, computes its decision in Rust, and
//! writes back inside one `sqlx::Transaction`.

use super::{Filter, PersistenceGateway, is_valid_identifier};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

/// Tables the gateway is willing to address. Anything else is a programmer
/// error, not a runtime condition, so callers get a validation failure
/// rather than silently creating a new table.
const KNOWN_TABLES: &[&str] = &[
    "file_locks",
    "work_queue",
    "feature_registry",
    "handoff_documents",
    "episodic_memories",
    "agent_sessions",
    "operation_guardrails",
    "guardrail_violations",
    "audit_log",
    "policies",
];

fn check_table(table: &str) -> Result<()> {
    if !is_valid_identifier(table) || !KNOWN_TABLES.contains(&table) {
        return Err(Error::ValidationFailed {
            issues: vec![format!("unknown table: {table}")],
        });
    }
    Ok(())
}

/// Native SQLite-backed [`PersistenceGateway`].
#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    /// Connect to `dsn` (e.g. `sqlite::memory:` or `sqlite://path/to.db`) and
    /// create the schema if it does not already exist.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = SqlitePool::connect(dsn)
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        let gateway = Self { pool };
        gateway.init_schema().await?;
        Ok(gateway)
    }

    /// Wrap an already-connected pool (used by tests that need a shared
    /// in-memory database across several gateway handles).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let gateway = Self { pool };
        gateway.init_schema().await?;
        Ok(gateway)
    }

    async fn init_schema(&self) -> Result<()> {
        for table in KNOWN_TABLES {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    data TEXT NOT NULL,
                    created_at TEXT NOT NULL
                )"
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::backend_unavailable(e))?;
        }
        Ok(())
    }

    async fn read_all(&self, table: &str) -> Result<Vec<Value>> {
        check_table(table)?;
        let sql = format!("SELECT id, data, created_at FROM {table}");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        Ok(rows.into_iter().map(row_to_value).collect())
    }

    async fn read_all_tx(tx: &mut Transaction<'_, Sqlite>, table: &str) -> Result<Vec<Value>> {
        check_table(table)?;
        let sql = format!("SELECT id, data, created_at FROM {table}");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        Ok(rows.into_iter().map(row_to_value).collect())
    }

    async fn upsert_tx(
        tx: &mut Transaction<'_, Sqlite>,
        table: &str,
        row: &Value,
    ) -> Result<()> {
        check_table(table)?;
        let id = row["id"].as_str().ok_or_else(|| Error::ValidationFailed {
            issues: vec!["row missing id".into()],
        })?;
        let created_at = row["created_at"]
            .as_str()
            .ok_or_else(|| Error::ValidationFailed {
                issues: vec!["row missing created_at".into()],
            })?;
        let sql = format!(
            "INSERT INTO {table} (id, data, created_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(row.to_string())
            .bind(created_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        Ok(())
    }

    async fn delete_tx(tx: &mut Transaction<'_, Sqlite>, table: &str, id: &str) -> Result<()> {
        check_table(table)?;
        let sql = format!("DELETE FROM {table} WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        Ok(())
    }

    /// Expose the underlying pool for the rare case a caller needs raw SQL
    /// (CLI dump commands). Not part of the [`PersistenceGateway`] trait.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_value(row: sqlx::sqlite::SqliteRow) -> Value {
    let id: String = row.get("id");
    let data: String = row.get("data");
    let created_at: String = row.get("created_at");
    let mut value: Value = serde_json::from_str(&data).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.insert("id".into(), json!(id));
        map.insert("created_at".into(), json!(created_at));
    }
    value
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn merge_patch(mut row: Value, patch: &Value) -> Value {
    if let (Value::Object(dst), Value::Object(src)) = (&mut row, patch) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    row
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        let result = dispatch_rpc(&mut tx, function, params).await;
        match result {
            Ok(value) => {
                tx.commit().await.map_err(|e| Error::backend_unavailable(e))?;
                Ok(value)
            }
            Err(e) => {
                // Errors that represent a *decision* (held_by_other,
                // dependency_unsatisfied, not_found, ...) still need their
                // side effects (if any were made before the error) rolled
                // back; rollback is always safe to attempt even if nothing
                // was written.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn query(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        filter.validate_identifiers()?;
        let rows = self.read_all(table).await?;
        Ok(filter.apply(rows))
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        check_table(table)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        let mut row = row;
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(new_id);
        let created_at = row
            .get("created_at")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(now_rfc3339);
        if let Value::Object(ref mut map) = row {
            map.insert("id".into(), json!(id));
            map.insert("created_at".into(), json!(created_at));
        }
        Self::upsert_tx(&mut tx, table, &row).await?;
        tx.commit().await.map_err(|e| Error::backend_unavailable(e))?;
        Ok(row)
    }

    async fn update(&self, table: &str, match_filter: &Filter, patch: Value) -> Result<Vec<Value>> {
        match_filter.validate_identifiers()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        let all = Self::read_all_tx(&mut tx, table).await?;
        let matching = match_filter.apply(all);
        let mut updated = Vec::with_capacity(matching.len());
        for row in matching {
            let patched = merge_patch(row, &patch);
            Self::upsert_tx(&mut tx, table, &patched).await?;
            updated.push(patched);
        }
        tx.commit().await.map_err(|e| Error::backend_unavailable(e))?;
        Ok(updated)
    }

    async fn delete(&self, table: &str, match_filter: &Filter) -> Result<()> {
        match_filter.validate_identifiers()?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::backend_unavailable(e))?;
        let all = Self::read_all_tx(&mut tx, table).await?;
        let matching = match_filter.apply(all);
        for row in matching {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                Self::delete_tx(&mut tx, table, id).await?;
            }
        }
        tx.commit().await.map_err(|e| Error::backend_unavailable(e))?;
        Ok(())
    }
}

async fn dispatch_rpc(tx: &mut Transaction<'_, Sqlite>, function: &str, params: Value) -> Result<Value> {
    match function {
        "acquire_lock" => rpc::acquire_lock(tx, params).await,
        "release_lock" => rpc::release_lock(tx, params).await,
        "claim_task" => rpc::claim_task(tx, params).await,
        "complete_task" => rpc::complete_task(tx, params).await,
        "submit_task" => rpc::submit_task(tx, params).await,
        "register_agent_session" => rpc::register_agent_session(tx, params).await,
        "agent_heartbeat" => rpc::agent_heartbeat(tx, params).await,
        "cleanup_dead_agents" => rpc::cleanup_dead_agents(tx, params).await,
        "store_episodic_memory" => rpc::store_episodic_memory(tx, params).await,
        "get_relevant_memories" => rpc::get_relevant_memories(tx, params).await,
        "write_handoff" => rpc::write_handoff(tx, params).await,
        "read_handoff" => rpc::read_handoff(tx, params).await,
        "register_feature" => rpc::register_feature(tx, params).await,
        "deregister_feature" => rpc::deregister_feature(tx, params).await,
        "get_agent_profile" => rpc::get_agent_profile(tx, params).await,
        other => Err(Error::ValidationFailed {
            issues: vec![format!("unknown rpc function: {other}")],
        }),
    }
}

/// The atomic procedures themselves, one function per name in §6.
mod rpc {
    use super::{Error, Result, Sqlite, Transaction, Value, json, merge_patch, new_id, now_rfc3339};

    pub(super) async fn acquire_lock(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let key = params["key"].as_str().unwrap_or_default().to_string();
        let holder_id = params["holder_id"].as_str().unwrap_or_default().to_string();
        let holder_type = params["holder_type"].as_str().unwrap_or("agent").to_string();
        let session_id = params["session_id"].as_str().map(ToString::to_string);
        let reason = params["reason"].as_str().map(ToString::to_string);
        let ttl_secs = params["ttl_secs"].as_i64().unwrap_or(7200);

        let now = chrono::Utc::now();
        let rows = super::SqliteGateway::read_all_tx(tx, "file_locks").await?;
        let existing = rows.into_iter().find(|r| r["key"] == json!(key));

        let mut expired = false;
        if let Some(ref row) = existing {
            if let Some(expires_at) = row["expires_at"].as_str() {
                if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(expires_at) {
                    expired = parsed.with_timezone(&chrono::Utc) <= now;
                }
            }
        }

        if let Some(row) = existing {
            if expired {
                if let Some(id) = row["id"].as_str() {
                    super::SqliteGateway::delete_tx(tx, "file_locks", id).await?;
                }
            } else {
                let current_holder = row["holder_id"].as_str().unwrap_or_default();
                if current_holder == holder_id {
                    let expires_at = (now + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
                    let patched = merge_patch(row, &json!({"expires_at": expires_at}));
                    super::SqliteGateway::upsert_tx(tx, "file_locks", &patched).await?;
                    return Ok(json!({
                        "status": "refreshed",
                        "expires_at": expires_at,
                    }));
                }
                return Ok(json!({
                    "status": "denied",
                    "reason": "held_by_other",
                    "holder_id": current_holder,
                    "holder_type": row["holder_type"],
                }));
            }
        }

        let expires_at = (now + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let row = json!({
            "id": new_id(),
            "key": key,
            "holder_id": holder_id,
            "holder_type": holder_type,
            "session_id": session_id,
            "acquired_at": now.to_rfc3339(),
            "expires_at": expires_at,
            "reason": reason,
            "created_at": now_rfc3339(),
        });
        super::SqliteGateway::upsert_tx(tx, "file_locks", &row).await?;
        Ok(json!({"status": "acquired", "expires_at": expires_at}))
    }

    pub(super) async fn release_lock(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let key = params["key"].as_str().unwrap_or_default();
        let holder_id = params["holder_id"].as_str().unwrap_or_default();
        let rows = super::SqliteGateway::read_all_tx(tx, "file_locks").await?;
        let Some(row) = rows.into_iter().find(|r| r["key"] == json!(key)) else {
            return Ok(json!({"status": "not_held"}));
        };
        if row["holder_id"].as_str().unwrap_or_default() != holder_id {
            return Ok(json!({"status": "not_held"}));
        }
        if let Some(id) = row["id"].as_str() {
            super::SqliteGateway::delete_tx(tx, "file_locks", id).await?;
        }
        Ok(json!({"status": "ok"}))
    }

    pub(super) async fn claim_task(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let agent = params["agent"].as_str().unwrap_or_default().to_string();
        let types: Option<Vec<String>> = params["types"].as_array().map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        });

        let rows = super::SqliteGateway::read_all_tx(tx, "work_queue").await?;
        let completed: std::collections::HashSet<String> = rows
            .iter()
            .filter(|r| r["status"] == json!("completed"))
            .filter_map(|r| r["id"].as_str().map(ToString::to_string))
            .collect();

        let mut candidates: Vec<Value> = rows
            .into_iter()
            .filter(|r| r["status"] == json!("pending"))
            .filter(|r| {
                types.as_ref().is_none_or(|ts| {
                    r["type"]
                        .as_str()
                        .is_some_and(|t| ts.iter().any(|x| x == t))
                })
            })
            .filter(|r| {
                r["depends_on"]
                    .as_array()
                    .map(|deps| {
                        deps.iter()
                            .all(|d| d.as_str().is_some_and(|id| completed.contains(id)))
                    })
                    .unwrap_or(true)
            })
            .collect();

        candidates.sort_by(|a, b| {
            let pa = a["priority"].as_i64().unwrap_or(10);
            let pb = b["priority"].as_i64().unwrap_or(10);
            pa.cmp(&pb).then_with(|| {
                let ca = a["created_at"].as_str().unwrap_or_default();
                let cb = b["created_at"].as_str().unwrap_or_default();
                ca.cmp(cb)
            })
        });

        let Some(chosen) = candidates.into_iter().next() else {
            return Ok(json!({"status": "none_available"}));
        };

        let now = now_rfc3339();
        let patched = merge_patch(
            chosen,
            &json!({"status": "claimed", "claimed_by": agent, "claimed_at": now}),
        );
        super::SqliteGateway::upsert_tx(tx, "work_queue", &patched).await?;
        Ok(json!({"status": "claimed", "task": patched}))
    }

    pub(super) async fn complete_task(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let task_id = params["task_id"].as_str().unwrap_or_default();
        let agent = params["agent"].as_str().unwrap_or_default();
        let success = params["success"].as_bool().unwrap_or(true);
        let result = params.get("result").cloned().unwrap_or(Value::Null);
        let error_message = params.get("error_message").cloned().unwrap_or(Value::Null);
        let blocked = params["blocked"].as_bool().unwrap_or(false);

        let rows = super::SqliteGateway::read_all_tx(tx, "work_queue").await?;
        let Some(row) = rows.into_iter().find(|r| r["id"] == json!(task_id)) else {
            return Err(Error::not_found("task", task_id));
        };
        if row["claimed_by"].as_str() != Some(agent) {
            return Err(Error::AuthorizationDenied {
                reason: format!("task {task_id} is not held by {agent}"),
            });
        }

        let status = if blocked {
            "blocked"
        } else if success {
            "completed"
        } else {
            "failed"
        };
        let now = now_rfc3339();
        let patch = json!({
            "status": status,
            "completed_at": now,
            "result_payload": result,
            "error_message": error_message,
        });
        let patched = merge_patch(row, &patch);
        super::SqliteGateway::upsert_tx(tx, "work_queue", &patched).await?;
        Ok(json!({"status": status, "task": patched}))
    }

    pub(super) async fn submit_task(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let now = now_rfc3339();
        let id = new_id();
        let row = json!({
            "id": id,
            "type": params["type"],
            "description": params["description"],
            "input_payload": params.get("input").cloned().unwrap_or(Value::Null),
            "priority": params["priority"].as_i64().unwrap_or(5),
            "status": "pending",
            "claimed_by": Value::Null,
            "claimed_at": Value::Null,
            "completed_at": Value::Null,
            "result_payload": Value::Null,
            "error_message": Value::Null,
            "depends_on": params.get("depends_on").cloned().unwrap_or_else(|| json!([])),
            "deadline": params.get("deadline").cloned().unwrap_or(Value::Null),
            "created_at": now,
        });
        super::SqliteGateway::upsert_tx(tx, "work_queue", &row).await?;
        Ok(json!({"id": id}))
    }

    pub(super) async fn register_agent_session(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let agent_id = params["agent_id"].as_str().unwrap_or_default().to_string();
        let session_id = params["session_id"]
            .as_str()
            .map(ToString::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let rows = super::SqliteGateway::read_all_tx(tx, "agent_sessions").await?;
        let existing = rows
            .into_iter()
            .find(|r| r["agent_id"] == json!(agent_id) && r["session_id"] == json!(session_id));

        let now = now_rfc3339();
        let row = json!({
            "id": existing.as_ref().and_then(|r| r["id"].as_str()).map(ToString::to_string).unwrap_or_else(new_id),
            "agent_id": agent_id,
            "agent_type": params["agent_type"],
            "session_id": session_id,
            "capabilities": params.get("capabilities").cloned().unwrap_or_else(|| json!([])),
            "status": "active",
            "current_task": params.get("current_task").cloned().unwrap_or(Value::Null),
            "last_heartbeat": now,
            "started_at": existing.as_ref().and_then(|r| r["started_at"].as_str()).map(ToString::to_string).unwrap_or_else(|| now.clone()),
            "created_at": existing.as_ref().and_then(|r| r["created_at"].as_str()).map(ToString::to_string).unwrap_or_else(|| now.clone()),
        });
        super::SqliteGateway::upsert_tx(tx, "agent_sessions", &row).await?;
        Ok(json!({"session_id": session_id}))
    }

    pub(super) async fn agent_heartbeat(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let session_id = params["session_id"].as_str().unwrap_or_default();
        let rows = super::SqliteGateway::read_all_tx(tx, "agent_sessions").await?;
        let Some(row) = rows.into_iter().find(|r| r["session_id"] == json!(session_id)) else {
            return Err(Error::not_found("agent_session", session_id));
        };
        let patched = merge_patch(
            row,
            &json!({"last_heartbeat": now_rfc3339(), "status": "active"}),
        );
        super::SqliteGateway::upsert_tx(tx, "agent_sessions", &patched).await?;
        Ok(json!({"status": "ok"}))
    }

    pub(super) async fn cleanup_dead_agents(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let threshold_secs = params["staleness_threshold_secs"].as_i64().unwrap_or(900);
        let now = chrono::Utc::now();

        let sessions = super::SqliteGateway::read_all_tx(tx, "agent_sessions").await?;
        let mut stale_sessions: Vec<String> = Vec::new();
        let mut agents_cleaned = 0i64;
        for row in sessions {
            let is_stale = row["last_heartbeat"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|hb| now.signed_duration_since(hb.with_timezone(&chrono::Utc)) >= chrono::Duration::seconds(threshold_secs))
                .unwrap_or(true);
            if is_stale && row["status"] != json!("disconnected") {
                if let Some(session_id) = row["session_id"].as_str() {
                    stale_sessions.push(session_id.to_string());
                }
                let patched = merge_patch(row, &json!({"status": "disconnected"}));
                super::SqliteGateway::upsert_tx(tx, "agent_sessions", &patched).await?;
                agents_cleaned += 1;
            }
        }

        let locks = super::SqliteGateway::read_all_tx(tx, "file_locks").await?;
        let mut locks_released = 0i64;
        for row in locks {
            let held_by_dead = row["session_id"]
                .as_str()
                .is_some_and(|sid| stale_sessions.iter().any(|s| s == sid));
            if held_by_dead {
                if let Some(id) = row["id"].as_str() {
                    super::SqliteGateway::delete_tx(tx, "file_locks", id).await?;
                    locks_released += 1;
                }
            }
        }

        Ok(json!({"agents_cleaned": agents_cleaned, "locks_released": locks_released}))
    }

    pub(super) async fn store_episodic_memory(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let agent_id = params["agent_id"].as_str().unwrap_or_default().to_string();
        let event_type = params["event_type"].as_str().unwrap_or_default().to_string();
        let summary = params["summary"].as_str().unwrap_or_default().to_string();
        let relevance_score = params["relevance_score"].as_f64().unwrap_or(0.0);

        let rows = super::SqliteGateway::read_all_tx(tx, "episodic_memories").await?;
        let dup = rows.into_iter().find(|r| {
            r["agent_id"] == json!(agent_id)
                && r["event_type"] == json!(event_type)
                && r["summary"] == json!(summary)
        });

        let now = now_rfc3339();
        let id = dup
            .as_ref()
            .and_then(|r| r["id"].as_str())
            .map(ToString::to_string)
            .unwrap_or_else(new_id);
        let created_at = dup
            .as_ref()
            .and_then(|r| r["created_at"].as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| now.clone());

        let row = json!({
            "id": id,
            "agent_id": agent_id,
            "session_id": params.get("session_id").cloned().unwrap_or(Value::Null),
            "event_type": event_type,
            "summary": summary,
            "details": params.get("details").cloned().unwrap_or(Value::Null),
            "outcome": params.get("outcome").cloned().unwrap_or(Value::Null),
            "lessons": params.get("lessons").cloned().unwrap_or(Value::Null),
            "tags": params.get("tags").cloned().unwrap_or_else(|| json!([])),
            "relevance_score": relevance_score,
            "created_at": created_at,
        });
        super::SqliteGateway::upsert_tx(tx, "episodic_memories", &row).await?;
        Ok(json!({"id": id, "deduplicated": dup.is_some().then_some(true).unwrap_or(false)}))
    }

    pub(super) async fn get_relevant_memories(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let agent_id = params.get("agent_id").and_then(Value::as_str);
        let event_type = params.get("event_type").and_then(Value::as_str);
        let tags: Option<Vec<String>> = params["tags"].as_array().map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect()
        });
        let limit = params["limit"].as_u64().unwrap_or(20) as usize;

        let mut rows = super::SqliteGateway::read_all_tx(tx, "episodic_memories").await?;
        rows.retain(|r| agent_id.is_none_or(|a| r["agent_id"] == json!(a)));
        rows.retain(|r| event_type.is_none_or(|e| r["event_type"] == json!(e)));
        if let Some(ref tags) = tags {
            rows.retain(|r| {
                r["tags"]
                    .as_array()
                    .map(|row_tags| {
                        tags.iter().any(|t| {
                            row_tags
                                .iter()
                                .any(|rt| rt.as_str() == Some(t.as_str()))
                        })
                    })
                    .unwrap_or(false)
            });
        }
        rows.sort_by(|a, b| {
            let sa = a["relevance_score"].as_f64().unwrap_or(0.0);
            let sb = b["relevance_score"].as_f64().unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ca = a["created_at"].as_str().unwrap_or_default();
                    let cb = b["created_at"].as_str().unwrap_or_default();
                    cb.cmp(ca)
                })
        });
        rows.truncate(limit);
        Ok(json!(rows))
    }

    pub(super) async fn write_handoff(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let now = now_rfc3339();
        let id = new_id();
        let row = json!({
            "id": id,
            "agent_name": params["agent_name"],
            "session_id": params.get("session_id").cloned().unwrap_or(Value::Null),
            "summary": params["summary"],
            "completed_work": params.get("completed_work").cloned().unwrap_or_else(|| json!([])),
            "in_progress": params.get("in_progress").cloned().unwrap_or_else(|| json!([])),
            "decisions": params.get("decisions").cloned().unwrap_or_else(|| json!([])),
            "next_steps": params.get("next_steps").cloned().unwrap_or_else(|| json!([])),
            "relevant_files": params.get("relevant_files").cloned().unwrap_or_else(|| json!([])),
            "created_at": now,
        });
        super::SqliteGateway::upsert_tx(tx, "handoff_documents", &row).await?;
        Ok(json!({"id": id}))
    }

    pub(super) async fn read_handoff(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let session_id = params.get("session_id").and_then(Value::as_str);
        let mut rows = super::SqliteGateway::read_all_tx(tx, "handoff_documents").await?;
        if let Some(session_id) = session_id {
            rows.retain(|r| r["session_id"] == json!(session_id));
        }
        rows.sort_by(|a, b| {
            let ca = a["created_at"].as_str().unwrap_or_default();
            let cb = b["created_at"].as_str().unwrap_or_default();
            cb.cmp(ca)
        });
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    pub(super) async fn register_feature(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let feature_id = params["feature_id"].as_str().unwrap_or_default().to_string();
        let rows = super::SqliteGateway::read_all_tx(tx, "feature_registry").await?;
        let existing = rows.into_iter().find(|r| r["feature_id"] == json!(feature_id));

        let now = now_rfc3339();
        let row = json!({
            "id": existing.as_ref().and_then(|r| r["id"].as_str()).map(ToString::to_string).unwrap_or_else(new_id),
            "feature_id": feature_id,
            "title": params["title"],
            "status": "active",
            "registered_by": params.get("registered_by").cloned().unwrap_or(Value::Null),
            "resource_claims": params.get("resource_claims").cloned().unwrap_or_else(|| json!([])),
            "branch_name": params.get("branch_name").cloned().unwrap_or(Value::Null),
            "merge_priority": params["merge_priority"].as_i64().unwrap_or(5),
            "metadata": existing.as_ref().and_then(|r| r.get("metadata")).cloned().unwrap_or_else(|| json!({})),
            "created_at": existing.as_ref().and_then(|r| r["created_at"].as_str()).map(ToString::to_string).unwrap_or_else(|| now.clone()),
        });
        super::SqliteGateway::upsert_tx(tx, "feature_registry", &row).await?;
        Ok(row)
    }

    pub(super) async fn deregister_feature(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let feature_id = params["feature_id"].as_str().unwrap_or_default();
        let status = params["status"].as_str().unwrap_or("completed");
        let rows = super::SqliteGateway::read_all_tx(tx, "feature_registry").await?;
        let Some(row) = rows.into_iter().find(|r| r["feature_id"] == json!(feature_id)) else {
            return Err(Error::not_found("feature", feature_id));
        };
        let patched = merge_patch(row, &json!({"status": status}));
        super::SqliteGateway::upsert_tx(tx, "feature_registry", &patched).await?;
        Ok(patched)
    }

    pub(super) async fn get_agent_profile(
        tx: &mut Transaction<'_, Sqlite>,
        params: Value,
    ) -> Result<Value> {
        let agent_type = params["agent_type"].as_str().unwrap_or_default();
        // Agent profiles are configuration, not runtime state (§3); they are
        // still addressed through the gateway so the policy engine does not
        // need a second persistence path. Stored under the `policies` table
        // with a synthetic id namespaced by agent type.
        let rows = super::SqliteGateway::read_all_tx(tx, "policies").await?;
        let found = rows.into_iter().find(|r| {
            r["kind"] == json!("agent_profile") && r["agent_type"] == json!(agent_type)
        });
        Ok(found.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn gateway() -> SqliteGateway {
        SqliteGateway::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn lock_acquire_then_refresh_then_deny() {
        let gw = gateway().await;
        let acquired = gw
            .rpc(
                "acquire_lock",
                json!({"key": "src/a.py", "holder_id": "alpha", "ttl_secs": 300}),
            )
            .await
            .unwrap();
        assert_eq!(acquired["status"], "acquired");

        let refreshed = gw
            .rpc(
                "acquire_lock",
                json!({"key": "src/a.py", "holder_id": "alpha", "ttl_secs": 300}),
            )
            .await
            .unwrap();
        assert_eq!(refreshed["status"], "refreshed");

        let denied = gw
            .rpc(
                "acquire_lock",
                json!({"key": "src/a.py", "holder_id": "beta", "ttl_secs": 300}),
            )
            .await
            .unwrap();
        assert_eq!(denied["status"], "denied");
        assert_eq!(denied["holder_id"], "alpha");
    }

    #[tokio::test]
    async fn claim_respects_dependency_gate() {
        let gw = gateway().await;
        let t2 = gw
            .rpc(
                "submit_task",
                json!({"type": "build", "description": "t2", "priority": 1}),
            )
            .await
            .unwrap();
        let t2_id = t2["id"].as_str().unwrap().to_string();
        gw.rpc(
            "submit_task",
            json!({"type": "build", "description": "t3", "priority": 1, "depends_on": [t2_id]}),
        )
        .await
        .unwrap();

        let claim1 = gw.rpc("claim_task", json!({"agent": "a"})).await.unwrap();
        assert_eq!(claim1["task"]["description"], "t2");

        // t3 cannot be claimed until t2 completes.
        let claim2 = gw.rpc("claim_task", json!({"agent": "a"})).await.unwrap();
        assert_eq!(claim2["status"], "none_available");
    }
}
