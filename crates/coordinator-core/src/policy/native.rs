//! Native policy backend: trust-level tables plus a per-agent-type profile
//! fallback for operations outside the three predefined categories (§4.6).

use super::{ActionCategory, Decision, PolicyEngine};
use crate::config::ProfilesConfig;
use crate::error::Result;
use crate::gateway::{Filter, PersistenceGateway};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Which trust level each category requires, per the reference
/// implementation's fixed thresholds.
fn required_trust_level(category: ActionCategory) -> u8 {
    match category {
        ActionCategory::Read => 1,
        ActionCategory::Write => 2,
        ActionCategory::Admin => 3,
    }
}

/// Classify a fixed set of well-known operation names into their category.
/// Anything not listed here is "unknown" and falls through to the
/// per-agent-type profile.
fn classify(operation: &str) -> Option<ActionCategory> {
    match operation {
        "check_locks" | "get_pending" | "get_my_tasks" | "get_task" | "discover" | "recall"
        | "read_handoff" | "query_audit" => Some(ActionCategory::Read),
        "acquire_lock" | "release_lock" | "submit_task" | "claim_task" | "complete_task"
        | "write_handoff" | "remember" | "register_feature" => Some(ActionCategory::Write),
        "deregister_feature" | "cleanup_dead_agents" | "mark_merged" | "admin_override" => {
            Some(ActionCategory::Admin)
        }
        _ => None,
    }
}

/// Per-agent-type authorization profile (§3's `Agent profile`).
#[derive(Debug, Clone, Default)]
pub struct AgentProfile {
    /// Operations always allowed for this agent type, regardless of
    /// category.
    pub allowed_operations: Vec<String>,
    /// Operations always denied, even if also listed in
    /// `allowed_operations`.
    pub blocked_operations: Vec<String>,
    /// Maximum files an operation may modify in one session, if enforced.
    pub max_file_modifications: Option<u64>,
}

/// `check_operation` backed by trust-level tables and agent-type profiles
/// (§4.6, first bullet).
pub struct NativePolicyEngine {
    gateway: Arc<dyn PersistenceGateway>,
    profiles_config: ProfilesConfig,
}

impl NativePolicyEngine {
    /// Build a native policy engine over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, profiles_config: ProfilesConfig) -> Self {
        Self { gateway, profiles_config }
    }

    async fn profile_for(&self, agent_type: &str) -> Result<Option<AgentProfile>> {
        let rows = self
            .gateway
            .query(
                "policies",
                &Filter::all().eq("kind", "agent_profile").eq("agent_type", agent_type),
            )
            .await?;
        Ok(rows.first().map(|row| AgentProfile {
            allowed_operations: string_list(&row["allowed_operations"]),
            blocked_operations: string_list(&row["blocked_operations"]),
            max_file_modifications: row["max_file_modifications"].as_u64(),
        }))
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
        .unwrap_or_default()
}

#[async_trait]
impl PolicyEngine for NativePolicyEngine {
    async fn check_operation(
        &self,
        _agent_id: &str,
        agent_type: &str,
        operation: &str,
        _resource: &str,
        context: &Value,
    ) -> Result<Decision> {
        let trust_level = context["trust_level"].as_u64().unwrap_or(u64::from(self.profiles_config.default_trust_level)) as u8;

        if trust_level == 0 {
            return Ok(Decision {
                allowed: false,
                reason: "suspended".into(),
                diagnostics: serde_json::json!({"engine": self.name(), "trust_level": trust_level}),
            });
        }

        if let Some(category) = classify(operation) {
            let required = required_trust_level(category);
            let allowed = trust_level >= required;
            return Ok(Decision {
                allowed,
                reason: if allowed {
                    format!("{category} operation allowed at trust level {trust_level}")
                } else {
                    format!("{category} requires trust level >= {required}, caller has {trust_level}")
                },
                diagnostics: serde_json::json!({"engine": self.name(), "category": category.to_string()}),
            });
        }

        // Unknown operation: consult the agent-type profile.
        let profile = self.profile_for(agent_type).await?;
        let Some(profile) = profile else {
            return Ok(Decision {
                allowed: true,
                reason: "no profile for agent type; defaulting to allow".into(),
                diagnostics: serde_json::json!({"engine": self.name()}),
            });
        };

        if profile.blocked_operations.iter().any(|o| o == operation) {
            return Ok(Decision {
                allowed: false,
                reason: format!("{operation} is blocked for agent type {agent_type}"),
                diagnostics: serde_json::json!({"engine": self.name()}),
            });
        }

        if self.profiles_config.enforce_resource_limits {
            if let Some(limit) = profile.max_file_modifications {
                let files_modified = context["files_modified"].as_u64().unwrap_or(0);
                // Resolved open question (§9): compared before including the
                // current operation — denies once the caller-reported count
                // has already reached the limit.
                if files_modified >= limit {
                    return Ok(Decision {
                        allowed: false,
                        reason: format!("resource limit reached: {files_modified}/{limit} files modified"),
                        diagnostics: serde_json::json!({"engine": self.name()}),
                    });
                }
            }
        }

        if !profile.allowed_operations.is_empty() && !profile.allowed_operations.iter().any(|o| o == operation) {
            return Ok(Decision {
                allowed: false,
                reason: format!("{operation} is not in the allowed-operations list for {agent_type}"),
                diagnostics: serde_json::json!({"engine": self.name()}),
            });
        }

        Ok(Decision {
            allowed: true,
            reason: "profile miss defaults to allow".into(),
            diagnostics: serde_json::json!({"engine": self.name()}),
        })
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

/// The default policy set's (trust_level, `action_category`) -> allow/deny
/// table, used both by [`NativePolicyEngine`] implicitly via
/// [`required_trust_level`] and by [`super::declarative::DeclarativePolicyEngine`]
/// to keep the two backends in lockstep (§8, invariant 9).
#[must_use]
pub fn default_decision_table() -> HashMap<(u8, ActionCategory), bool> {
    let mut table = HashMap::new();
    for trust_level in 0..=4u8 {
        for category in [ActionCategory::Read, ActionCategory::Write, ActionCategory::Admin] {
            let allowed = trust_level != 0 && trust_level >= required_trust_level(category);
            table.insert((trust_level, category), allowed);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn engine() -> NativePolicyEngine {
        let gateway = SqliteGateway::connect("sqlite::memory:").await.unwrap();
        NativePolicyEngine::new(
            Arc::new(gateway),
            ProfilesConfig {
                default_trust_level: 2,
                enforce_resource_limits: true,
            },
        )
    }

    #[tokio::test]
    async fn scenario_d_suspended_denies_reads() {
        let engine = engine().await;
        let denied = engine
            .check_operation("a", "claude_code", "check_locks", "locks", &serde_json::json!({"trust_level": 0}))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reason, "suspended");

        let allowed = engine
            .check_operation("a", "claude_code", "check_locks", "locks", &serde_json::json!({"trust_level": 1}))
            .await
            .unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn write_requires_trust_two() {
        let engine = engine().await;
        let denied = engine
            .check_operation("a", "claude_code", "acquire_lock", "k", &serde_json::json!({"trust_level": 1}))
            .await
            .unwrap();
        assert!(!denied.allowed);

        let allowed = engine
            .check_operation("a", "claude_code", "acquire_lock", "k", &serde_json::json!({"trust_level": 2}))
            .await
            .unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn unknown_operation_defaults_to_allow_without_profile() {
        let engine = engine().await;
        let decision = engine
            .check_operation("a", "claude_code", "custom_op", "r", &serde_json::json!({"trust_level": 2}))
            .await
            .unwrap();
        assert!(decision.allowed);
    }
}
