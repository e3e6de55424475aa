//! Policy Engine: one unified authorization interface, two interchangeable
//! backends (§4.6).
//!
//! [`PolicyEngine::check_operation`] is the sole decision entry point;
//! callers never branch on which backend answered. Every decision is
//! best-effort audited (operation, resource, engine name, reason); audit
//! failures never affect the decision itself.

pub mod declarative;
pub mod native;

use crate::audit::AuditLog;
use crate::config::NetworkDefaultPolicy;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// The three action categories the native backend partitions operations
/// into, and the declarative backend's schema names identically (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ActionCategory {
    /// Always allowed unless the agent is suspended.
    Read,
    /// Allowed at trust level >= 2.
    Write,
    /// Allowed at trust level >= 3.
    Admin,
}

/// A decision from either policy backend.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the operation is authorized.
    pub allowed: bool,
    /// Human-readable reason, surfaced verbatim to the caller (§7).
    pub reason: String,
    /// Free-form diagnostics (engine name, matched rule, ...).
    pub diagnostics: serde_json::Value,
}

/// Allow/deny table the network policy surface consults (§4.6.1); a domain
/// not listed falls through to the configured default.
fn allowed_domains() -> &'static [&'static str] {
    &["github.com", "api.github.com", "raw.githubusercontent.com", "crates.io", "docs.rs"]
}

/// `check_operation`/`check_network_access` — the policy engine's two
/// decision surfaces, backed by either [`native::NativePolicyEngine`] or
/// [`declarative::DeclarativePolicyEngine`].
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Authorize `operation` against `resource` for `agent_id` of
    /// `agent_type`, with ambient `context` (e.g. `trust_level`,
    /// `files_modified`).
    async fn check_operation(
        &self,
        agent_id: &str,
        agent_type: &str,
        operation: &str,
        resource: &str,
        context: &serde_json::Value,
    ) -> Result<Decision>;

    /// This engine's name, for audit diagnostics.
    fn name(&self) -> &'static str;
}

/// Best-effort audit wrapper: runs `engine`'s decision, then logs it via
/// `audit` without letting a logging failure change the decision (§4.6).
pub async fn check_operation_audited(
    engine: &dyn PolicyEngine,
    audit: &AuditLog,
    agent_id: &str,
    agent_type: &str,
    operation: &str,
    resource: &str,
    context: &serde_json::Value,
) -> Result<Decision> {
    let start = std::time::Instant::now();
    let decision = engine
        .check_operation(agent_id, agent_type, operation, resource, context)
        .await?;
    audit
        .log_operation(
            agent_id,
            agent_type,
            operation,
            serde_json::json!({"resource": resource, "engine": engine.name()}),
            serde_json::json!({"allowed": decision.allowed, "reason": decision.reason}),
            start.elapsed().as_millis() as u64,
            decision.allowed,
            (!decision.allowed).then(|| decision.reason.clone()),
        )
        .await;
    Ok(decision)
}

/// `check_network_access(agent_id, domain) -> {allowed, reason}` (§4.6.1): a
/// narrow, separate decision surface that never touches trust levels.
pub struct NetworkPolicy {
    default_policy: NetworkDefaultPolicy,
    audit: Arc<AuditLog>,
}

impl NetworkPolicy {
    /// Build a network policy surface with the configured default.
    #[must_use]
    pub fn new(default_policy: NetworkDefaultPolicy, audit: Arc<AuditLog>) -> Self {
        Self { default_policy, audit }
    }

    /// Decide whether `agent_id` may reach `domain`.
    pub async fn check_network_access(&self, agent_id: &str, domain: &str) -> Decision {
        let allowed = allowed_domains().contains(&domain) || self.default_policy == NetworkDefaultPolicy::Allow;
        let reason = if allowed_domains().contains(&domain) {
            "domain is on the allowlist".to_string()
        } else {
            format!("domain not allowlisted; default policy is {}", self.default_policy)
        };
        let decision = Decision {
            allowed,
            reason,
            diagnostics: serde_json::json!({"domain": domain}),
        };
        self.audit
            .log_operation(
                agent_id,
                "agent",
                "check_network_access",
                serde_json::json!({"domain": domain}),
                serde_json::json!({"allowed": decision.allowed}),
                0,
                decision.allowed,
                None,
            )
            .await;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_domains_contains_github() {
        assert!(allowed_domains().contains(&"github.com"));
    }
}
