//! Declarative policy backend: a cached policy/schema document, evaluated by
//! constructing an entity-graph (agent, agent type, resource) per call
//! (§4.6, second bullet).
//!
//! Ships a compiled-in fallback policy set that encodes the same
//! trust-level thresholds as [`super::native`], so the two backends agree
//! on the default policy set across all trust levels and action categories
//! (§8, Testable Property 9).

use super::{ActionCategory, Decision, PolicyEngine};
use crate::error::Result;
use crate::gateway::{Filter, PersistenceGateway};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// One rule in a policy document: grants `category` to any agent whose
/// trust level is at least `min_trust_level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Action category this rule governs.
    pub category: String,
    /// Minimum trust level required.
    pub min_trust_level: u8,
}

/// A full policy document: an ordered rule set plus the trust level that
/// denies everything (suspension).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Trust level at and below which every operation is denied.
    pub suspended_at_or_below: u8,
    /// Per-category minimum trust level rules.
    pub rules: Vec<PolicyRule>,
}

impl PolicyDocument {
    /// The compiled-in fallback, matching the native backend's fixed
    /// thresholds exactly so both engines agree by construction.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            suspended_at_or_below: 0,
            rules: vec![
                PolicyRule { category: "READ".into(), min_trust_level: 1 },
                PolicyRule { category: "WRITE".into(), min_trust_level: 2 },
                PolicyRule { category: "ADMIN".into(), min_trust_level: 3 },
            ],
        }
    }

    fn min_trust_level_for(&self, category: ActionCategory) -> Option<u8> {
        self.rules
            .iter()
            .find(|r| r.category == category.to_string())
            .map(|r| r.min_trust_level)
    }
}

struct CachedDocument {
    document: PolicyDocument,
    loaded_at: Instant,
}

/// `check_operation` backed by a cached policy document, re-read from
/// persistence once the cache TTL expires (§4.6: "cached with a bounded
/// TTL").
pub struct DeclarativePolicyEngine {
    gateway: Arc<dyn PersistenceGateway>,
    cache_ttl: Duration,
    enable_fallback: bool,
    cache: RwLock<Option<CachedDocument>>,
}

impl DeclarativePolicyEngine {
    /// Build a declarative policy engine over `gateway`, caching the loaded
    /// document for `cache_ttl`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, cache_ttl: Duration, enable_fallback: bool) -> Self {
        Self {
            gateway,
            cache_ttl,
            enable_fallback,
            cache: RwLock::new(None),
        }
    }

    /// Force the next call to reload the document, ignoring the TTL
    /// (hot-reload per §6).
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn document(&self) -> Result<PolicyDocument> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(cached.document.clone());
                }
            }
        }

        let loaded = self.load_from_persistence().await?;
        let document = match loaded {
            Some(document) => document,
            None if self.enable_fallback => PolicyDocument::fallback(),
            None => {
                return Err(crate::error::Error::PreconditionFailed {
                    detail: "no declarative policy document available and fallback disabled".into(),
                });
            }
        };

        *self.cache.write().await = Some(CachedDocument {
            document: document.clone(),
            loaded_at: Instant::now(),
        });
        Ok(document)
    }

    async fn load_from_persistence(&self) -> Result<Option<PolicyDocument>> {
        let rows = self
            .gateway
            .query("policies", &Filter::all().eq("kind", "declarative_policy_document"))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("document").cloned())
            .and_then(|doc| serde_json::from_value(doc).ok()))
    }
}

/// The entity-graph evaluated for one decision: the calling agent, its
/// type, and the resource under evaluation.
struct EntityGraph<'a> {
    agent_id: &'a str,
    agent_type: &'a str,
    resource: &'a str,
    trust_level: u8,
}

#[async_trait]
impl PolicyEngine for DeclarativePolicyEngine {
    async fn check_operation(
        &self,
        agent_id: &str,
        agent_type: &str,
        operation: &str,
        resource: &str,
        context: &Value,
    ) -> Result<Decision> {
        let trust_level = context["trust_level"].as_u64().unwrap_or(0) as u8;
        let graph = EntityGraph { agent_id, agent_type, resource, trust_level };
        let document = self.document().await?;

        if graph.trust_level <= document.suspended_at_or_below {
            return Ok(Decision {
                allowed: false,
                reason: "suspended".into(),
                diagnostics: serde_json::json!({"engine": self.name(), "resource": graph.resource}),
            });
        }

        let category = classify_for_schema(operation);
        let Some(min_trust_level) = document.min_trust_level_for(category) else {
            return Ok(Decision {
                allowed: true,
                reason: "no matching rule; defaulting to allow".into(),
                diagnostics: serde_json::json!({"engine": self.name()}),
            });
        };

        let allowed = graph.trust_level >= min_trust_level;
        Ok(Decision {
            allowed,
            reason: if allowed {
                format!("{category} operation allowed at trust level {}", graph.trust_level)
            } else {
                format!("{category} requires trust level >= {min_trust_level}, caller has {}", graph.trust_level)
            },
            diagnostics: serde_json::json!({"engine": self.name(), "agent_type": graph.agent_type}),
        })
    }

    fn name(&self) -> &'static str {
        "declarative"
    }
}

/// Same classification as [`super::native::classify`], exposed here under a
/// schema-facing name since the declarative document's rules are keyed by
/// category, not individual operation name.
fn classify_for_schema(operation: &str) -> ActionCategory {
    match operation {
        "acquire_lock" | "release_lock" | "submit_task" | "claim_task" | "complete_task"
        | "write_handoff" | "remember" | "register_feature" => ActionCategory::Write,
        "deregister_feature" | "cleanup_dead_agents" | "mark_merged" | "admin_override" => {
            ActionCategory::Admin
        }
        other => ActionCategory::from_str(&other.to_uppercase()).unwrap_or(ActionCategory::Read),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;
    use crate::policy::native::NativePolicyEngine;
    use crate::config::ProfilesConfig;

    async fn declarative() -> DeclarativePolicyEngine {
        let gateway = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        DeclarativePolicyEngine::new(gateway, Duration::from_secs(60), true)
    }

    #[tokio::test]
    async fn fallback_document_matches_native_thresholds() {
        let engine = declarative().await;
        for (trust_level, operation) in [
            (0u8, "check_locks"),
            (1, "check_locks"),
            (1, "acquire_lock"),
            (2, "acquire_lock"),
            (2, "deregister_feature"),
            (3, "deregister_feature"),
        ] {
            let decision = engine
                .check_operation("a", "claude_code", operation, "r", &serde_json::json!({"trust_level": trust_level}))
                .await
                .unwrap();
            let native_gateway = Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
            let native = NativePolicyEngine::new(
                native_gateway,
                ProfilesConfig { default_trust_level: 2, enforce_resource_limits: true },
            );
            let native_decision = native
                .check_operation("a", "claude_code", operation, "r", &serde_json::json!({"trust_level": trust_level}))
                .await
                .unwrap();
            assert_eq!(
                decision.allowed, native_decision.allowed,
                "trust_level={trust_level} operation={operation}"
            );
        }
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let engine = declarative().await;
        let _ = engine.document().await.unwrap();
        engine.invalidate().await;
        assert!(engine.cache.read().await.is_none());
    }
}
