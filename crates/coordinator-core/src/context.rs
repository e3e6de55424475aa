//! Dependency-injected process context (§9 Design Notes: "instantiate each
//! component once at start, pass an explicit context").
//!
//! No global `_global_service`-style singletons: every component is built
//! once from [`Config`] and handed to callers
//! (the CLI, an MCP/HTTP transport, tests) as one value. No component here
//! holds global mutable state of its own beyond the Persistence Gateway's
//! connection pool and the port allocator's lease table, both of which are
//! explicitly synchronized.

use crate::agent_registry::AgentRegistry;
use crate::audit::AuditLog;
use crate::config::{Config, PersistenceBackend, PolicyEngineKind};
use crate::error::Result;
use crate::feature_registry::FeatureRegistry;
use crate::gateway::rest::RestGateway;
use crate::gateway::sqlite::SqliteGateway;
use crate::gateway::PersistenceGateway;
use crate::guardrails::GuardrailsEngine;
use crate::handoff::HandoffStore;
use crate::locks::LockService;
use crate::memory::EpisodicMemory;
use crate::policy::declarative::DeclarativePolicyEngine;
use crate::policy::native::NativePolicyEngine;
use crate::policy::{NetworkPolicy, PolicyEngine};
use crate::port_allocator::PortAllocator;
use crate::work_queue::WorkQueue;
use std::sync::Arc;

/// Every coordinator component, instantiated once from [`Config`] and
/// threaded through explicitly rather than read from a global singleton.
pub struct Context {
    /// The process-wide configuration this context was built from.
    pub config: Config,
    /// The sole process-wide I/O boundary.
    pub gateway: Arc<dyn PersistenceGateway>,
    /// Exclusive-lease service.
    pub locks: LockService,
    /// Priority+FIFO task queue.
    pub work_queue: WorkQueue,
    /// Content-based operation filter.
    pub guardrails: GuardrailsEngine,
    /// Selected authorization backend (native or declarative, per config).
    pub policy: Arc<dyn PolicyEngine>,
    /// Narrow network-access decision surface.
    pub network_policy: NetworkPolicy,
    /// Cross-feature conflict analysis and merge scheduling.
    pub feature_registry: FeatureRegistry,
    /// Session discovery and liveness tracking.
    pub agent_registry: AgentRegistry,
    /// Append-only session handoff documents.
    pub handoff: HandoffStore,
    /// Tagged, time-decayed event recall.
    pub memory: EpisodicMemory,
    /// Fire-and-forget operation record.
    pub audit: Arc<AuditLog>,
    /// In-memory port range allocator.
    pub port_allocator: Arc<PortAllocator>,
}

impl Context {
    /// Build every component from `config`, connecting the configured
    /// persistence backend.
    pub async fn build(config: Config) -> Result<Self> {
        let gateway: Arc<dyn PersistenceGateway> = match config.persistence.backend {
            PersistenceBackend::Native => Arc::new(SqliteGateway::connect(&config.persistence.connection).await?),
            PersistenceBackend::Rest => Arc::new(RestGateway::new(
                config.persistence.connection.clone(),
                config.persistence.rest_prefix.clone(),
            )),
        };

        let audit = Arc::new(AuditLog::new(gateway.clone(), config.audit.async_logging));
        let guardrails = GuardrailsEngine::new(gateway.clone());
        let locks = LockService::new(gateway.clone(), config.lock);
        let work_queue = WorkQueue::new(gateway.clone(), guardrails.clone());
        let feature_registry = FeatureRegistry::new(gateway.clone());
        let agent_registry = AgentRegistry::new(gateway.clone());
        let handoff = HandoffStore::new(gateway.clone());
        let memory = EpisodicMemory::new(gateway.clone());
        let network_policy = NetworkPolicy::new(config.network.default_policy, audit.clone());
        let port_allocator = Arc::new(PortAllocator::new(config.port_allocator)?);

        let policy: Arc<dyn PolicyEngine> = match config.policy.engine {
            PolicyEngineKind::Native => Arc::new(NativePolicyEngine::new(gateway.clone(), config.profiles)),
            PolicyEngineKind::Declarative => Arc::new(DeclarativePolicyEngine::new(
                gateway.clone(),
                config.policy.cache_ttl,
                config.policy.enable_fallback,
            )),
        };

        Ok(Self {
            config,
            gateway,
            locks,
            work_queue,
            guardrails,
            policy,
            network_policy,
            feature_registry,
            agent_registry,
            handoff,
            memory,
            audit,
            port_allocator,
        })
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("config", &self.config).finish_non_exhaustive()
    }
}
