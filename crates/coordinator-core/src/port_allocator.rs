//! Port Allocator: an in-memory range allocator handing out contiguous
//! four-port blocks to co-launched per-session stacks (§5).
//!
//! Pure in-memory state, unlike every other component in this crate — it
//! has no persistence-backed counterpart, since leases only need to
//! survive for the lifetime of one coordinator process.

use crate::config::PortAllocatorConfig;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed offsets within a session's allocated block.
const SLOTS: [&str; 4] = ["db", "rest", "realtime", "api"];

/// A session's allocated port block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBlock {
    /// Database port.
    pub db: u16,
    /// PostgREST-equivalent port.
    pub rest: u16,
    /// Realtime/subscription port.
    pub realtime: u16,
    /// Generic API port.
    pub api: u16,
}

impl PortBlock {
    fn from_base(base: u16) -> Self {
        Self { db: base, rest: base + 1, realtime: base + 2, api: base + 3 }
    }
}

struct Lease {
    block: PortBlock,
    expires_at: Instant,
}

/// Mutex-protected range allocator (§5). Validates `base_port >= 1024` and
/// `range_per_session >= 4` at construction, rejecting an envelope too
/// small to carve four distinct ports from.
pub struct PortAllocator {
    config: PortAllocatorConfig,
    leases: Mutex<HashMap<String, Lease>>,
}

impl PortAllocator {
    /// Build an allocator from `config`, rejecting an invalid envelope.
    pub fn new(config: PortAllocatorConfig) -> Result<Self> {
        if config.base_port < 1024 {
            return Err(Error::ValidationFailed {
                issues: vec![format!("base_port {} is below 1024", config.base_port)],
            });
        }
        if config.range_per_session < 4 {
            return Err(Error::ValidationFailed {
                issues: vec![format!("range_per_session {} is below 4", config.range_per_session)],
            });
        }
        Ok(Self { config, leases: Mutex::new(HashMap::new()) })
    }

    /// Allocate (or refresh) a port block for `session_id`. Re-allocating an
    /// already-leased session returns the same block and resets its TTL.
    pub fn allocate(&self, session_id: &str) -> Result<PortBlock> {
        let mut leases = self.lock_leases();
        self.evict_expired(&mut leases);

        if let Some(lease) = leases.get_mut(session_id) {
            lease.expires_at = Instant::now() + self.config.ttl;
            return Ok(lease.block);
        }

        if leases.len() >= self.config.max_sessions {
            return Err(Error::PreconditionFailed {
                detail: format!("port allocator at capacity ({} sessions)", self.config.max_sessions),
            });
        }

        let used_indices: std::collections::HashSet<u16> = leases
            .values()
            .map(|lease| (lease.block.db - self.config.base_port) / self.config.range_per_session)
            .collect();
        let index = (0..self.config.max_sessions as u16)
            .find(|i| !used_indices.contains(i))
            .ok_or_else(|| Error::PreconditionFailed {
                detail: "no free port range available".into(),
            })?;
        let base = self.config.base_port + index * self.config.range_per_session;
        let block = PortBlock::from_base(base);
        leases.insert(session_id.to_string(), Lease { block, expires_at: Instant::now() + self.config.ttl });
        Ok(block)
    }

    /// Release `session_id`'s block immediately, if held.
    pub fn release(&self, session_id: &str) {
        self.lock_leases().remove(session_id);
    }

    /// Number of currently active (non-expired) leases.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let mut leases = self.lock_leases();
        self.evict_expired(&mut leases);
        leases.len()
    }

    /// Lock the lease table, recovering rather than panicking if a prior
    /// holder poisoned it by panicking while holding the lock.
    fn lock_leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn evict_expired(&self, leases: &mut HashMap<String, Lease>) {
        let now = Instant::now();
        leases.retain(|_, lease| lease.expires_at > now);
    }
}

/// The fixed slot names a [`PortBlock`] corresponds to, for display and CLI
/// dump purposes.
#[must_use]
pub fn slot_names() -> &'static [&'static str] {
    &SLOTS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PortAllocatorConfig {
        PortAllocatorConfig { base_port: 10000, range_per_session: 100, ttl: Duration::from_secs(7200), max_sessions: 3 }
    }

    #[test]
    fn rejects_invalid_envelope() {
        assert!(PortAllocator::new(PortAllocatorConfig { base_port: 80, ..config() }).is_err());
        assert!(PortAllocator::new(PortAllocatorConfig { range_per_session: 2, ..config() }).is_err());
    }

    #[test]
    fn reallocation_returns_same_block() {
        let allocator = PortAllocator::new(config()).unwrap();
        let first = allocator.allocate("s1").unwrap();
        let second = allocator.allocate("s1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn no_two_sessions_share_a_port() {
        let allocator = PortAllocator::new(config()).unwrap();
        let a = allocator.allocate("s1").unwrap();
        let b = allocator.allocate("s2").unwrap();
        let c = allocator.allocate("s3").unwrap();
        let blocks = [a, b, c];
        for (i, x) in blocks.iter().enumerate() {
            for y in &blocks[i + 1..] {
                assert_ne!(x.db, y.db);
                assert_ne!(x.rest, y.rest);
                assert_ne!(x.realtime, y.realtime);
                assert_ne!(x.api, y.api);
            }
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let allocator = PortAllocator::new(config()).unwrap();
        allocator.allocate("s1").unwrap();
        allocator.allocate("s2").unwrap();
        allocator.allocate("s3").unwrap();
        assert!(allocator.allocate("s4").is_err());
    }

    #[test]
    fn release_frees_the_slot_for_reuse() {
        let allocator = PortAllocator::new(config()).unwrap();
        allocator.allocate("s1").unwrap();
        allocator.release("s1");
        assert_eq!(allocator.active_count(), 0);
        assert!(allocator.allocate("s2").is_ok());
    }
}
