//! Process-wide configuration, loaded from the environment at start.
//!
//! Each sub-config loads independently and the whole tree is assembled
//! once, at process start, then threaded through the
//! [`crate::context::Context`] rather than read through a global
//! singleton.

use std::env;
use std::time::Duration;

/// Which persistence backend to address the Persistence Gateway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PersistenceBackend {
    /// REST-over-HTTP (PostgREST-shaped) adaptor.
    Rest,
    /// Native SQL connection pool (sqlite in this workspace).
    Native,
}

/// Which policy engine backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PolicyEngineKind {
    /// Trust-level table lookups.
    Native,
    /// Declarative policy/schema evaluator.
    Declarative,
}

/// Default-allow or default-deny for domains not on the network allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum NetworkDefaultPolicy {
    /// Allow by default.
    Allow,
    /// Deny by default.
    Deny,
}

/// Persistence connection configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Which backend to address.
    pub backend: PersistenceBackend,
    /// Connection string: a REST base URL, or a sqlite DSN (`sqlite://...`).
    pub connection: String,
    /// REST path prefix (ignored by the native backend).
    pub rest_prefix: String,
}

impl PersistenceConfig {
    fn from_env() -> Self {
        let backend = env::var("COORDINATOR_BACKEND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(PersistenceBackend::Native);
        let connection = env::var("COORDINATOR_DB_URL")
            .unwrap_or_else(|_| "sqlite::memory:".to_string());
        let rest_prefix = env::var("COORDINATOR_REST_PREFIX").unwrap_or_else(|_| "/rest/v1".into());
        Self {
            backend,
            connection,
            rest_prefix,
        }
    }
}

/// Agent identity configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier for this process's calling agent.
    pub agent_id: String,
    /// Type of agent (`claude_code`, `codex`, ...).
    pub agent_type: String,
    /// Optional session identifier.
    pub session_id: Option<String>,
}

impl AgentConfig {
    fn from_env() -> Self {
        let agent_id = env::var("AGENT_ID").unwrap_or_else(|_| {
            format!("agent-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        });
        Self {
            agent_id,
            agent_type: env::var("AGENT_TYPE").unwrap_or_else(|_| "claude_code".into()),
            session_id: env::var("SESSION_ID").ok(),
        }
    }
}

/// Lock behavior configuration.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Default lease duration when a caller does not specify one.
    pub default_ttl: Duration,
    /// Upper bound a requested TTL is clamped to.
    pub max_ttl: Duration,
}

impl LockConfig {
    fn from_env() -> Self {
        let default_minutes: u64 = env::var("LOCK_TTL_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);
        Self {
            default_ttl: Duration::from_secs(default_minutes * 60),
            max_ttl: Duration::from_secs(480 * 60),
        }
    }

    /// Clamp a requested TTL into `[1s, max_ttl]`, per §4.2's envelope rule.
    #[must_use]
    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.clamp(Duration::from_secs(1), self.max_ttl)
    }
}

/// Policy engine configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Which backend to evaluate decisions with.
    pub engine: PolicyEngineKind,
    /// How long a cached declarative policy set remains valid.
    pub cache_ttl: Duration,
    /// Path to the declarative schema file, when configured.
    pub schema_path: Option<String>,
    /// Whether a compiled-in fallback policy set may be used when
    /// persistence and the schema path are both unavailable.
    pub enable_fallback: bool,
}

impl PolicyConfig {
    fn from_env() -> Self {
        let engine = env::var("POLICY_ENGINE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(PolicyEngineKind::Native);
        let cache_secs: u64 = env::var("POLICY_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        Self {
            engine,
            cache_ttl: Duration::from_secs(cache_secs),
            schema_path: env::var("POLICY_SCHEMA_PATH").ok(),
            enable_fallback: env::var("POLICY_ENABLE_FALLBACK")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

/// Audit trail configuration.
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    /// When true (default), `log_operation` fire-and-forgets its insert.
    pub async_logging: bool,
}

impl AuditConfig {
    fn from_env() -> Self {
        Self {
            async_logging: env::var("AUDIT_ASYNC")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

/// Network access policy configuration.
#[derive(Debug, Clone, Copy)]
pub struct NetworkPolicyConfig {
    /// Default decision for domains absent from the allowlist.
    pub default_policy: NetworkDefaultPolicy,
}

impl NetworkPolicyConfig {
    fn from_env() -> Self {
        let default_policy = env::var("NETWORK_DEFAULT_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(NetworkDefaultPolicy::Deny);
        Self { default_policy }
    }
}

/// Agent profile / resource-limit enforcement configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProfilesConfig {
    /// Trust level assumed for an agent with no assigned profile.
    pub default_trust_level: u8,
    /// Whether resource limits (e.g. max files modified) are enforced.
    pub enforce_resource_limits: bool,
}

impl ProfilesConfig {
    fn from_env() -> Self {
        Self {
            default_trust_level: env::var("DEFAULT_TRUST_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            enforce_resource_limits: env::var("ENFORCE_RESOURCE_LIMITS")
                .map(|v| v != "0" && v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

/// Port allocator configuration.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocatorConfig {
    /// Lowest port handed out; blocks are allocated upward from here.
    pub base_port: u16,
    /// Stride between successive session blocks (must be >= 4).
    pub range_per_session: u16,
    /// How long an allocation remains valid without being refreshed.
    pub ttl: Duration,
    /// Maximum number of concurrently active sessions.
    pub max_sessions: usize,
}

impl PortAllocatorConfig {
    fn from_env() -> Self {
        Self {
            base_port: env::var("PORT_ALLOCATOR_BASE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10000),
            range_per_session: env::var("PORT_ALLOCATOR_RANGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            ttl: Duration::from_secs(
                env::var("PORT_ALLOCATOR_TTL_MINUTES")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(120)
                    * 60,
            ),
            max_sessions: env::var("PORT_ALLOCATOR_MAX_SESSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// The complete, process-wide configuration tree.
#[derive(Debug, Clone)]
pub struct Config {
    /// Persistence backend selection and connection parameters.
    pub persistence: PersistenceConfig,
    /// This process's agent identity.
    pub agent: AgentConfig,
    /// Lock TTL envelope.
    pub lock: LockConfig,
    /// Policy engine selection and caching.
    pub policy: PolicyConfig,
    /// Audit logging mode.
    pub audit: AuditConfig,
    /// Network access default.
    pub network: NetworkPolicyConfig,
    /// Agent profile defaults and enforcement switch.
    pub profiles: ProfilesConfig,
    /// Port allocator parameters.
    pub port_allocator: PortAllocatorConfig,
}

impl Config {
    /// Load the complete configuration from environment variables, applying
    /// a sensible default for every field not set explicitly.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            persistence: PersistenceConfig::from_env(),
            agent: AgentConfig::from_env(),
            lock: LockConfig::from_env(),
            policy: PolicyConfig::from_env(),
            audit: AuditConfig::from_env(),
            network: NetworkPolicyConfig::from_env(),
            profiles: ProfilesConfig::from_env(),
            port_allocator: PortAllocatorConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_config_clamps_into_envelope() {
        let cfg = LockConfig {
            default_ttl: Duration::from_secs(120 * 60),
            max_ttl: Duration::from_secs(480 * 60),
        };
        assert_eq!(cfg.clamp(Duration::from_secs(0)), Duration::from_secs(1));
        assert_eq!(
            cfg.clamp(Duration::from_secs(10_000 * 60)),
            cfg.max_ttl
        );
        assert_eq!(cfg.clamp(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
