//! Lock Service: exclusive leases on opaque string keys with TTL.
//!
//! Leases, not locks: a crashed agent's claim auto-expires rather than
//! requiring operator intervention. The re-acquire-as-extend pattern gives
//! callers one API for both "take" and "keep" (§4.2).

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::gateway::{Filter, PersistenceGateway};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// An active, non-expired lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveLease {
    /// The locked key.
    pub key: String,
    /// Who holds it.
    pub holder_id: String,
    /// The holder's kind (`agent`, `session`, ...).
    pub holder_type: String,
    /// When it was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When it expires.
    pub expires_at: DateTime<Utc>,
    /// Free-text reason supplied at acquire time.
    pub reason: Option<String>,
}

/// Outcome of an `acquire` call. Callers pattern-match rather than parsing a
/// string field (§9 — tagged result envelopes).
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// A fresh lease was created.
    Acquired {
        /// When the new lease expires.
        expires_at: DateTime<Utc>,
    },
    /// The caller already held this key; its lease was extended.
    Refreshed {
        /// The lease's new expiry.
        expires_at: DateTime<Utc>,
    },
    /// A different holder currently owns this key.
    Denied {
        /// The competing holder's id.
        holder_id: String,
        /// The competing holder's kind.
        holder_type: String,
    },
}

/// Lock Service operations, layered on the Persistence Gateway.
#[derive(Clone)]
pub struct LockService {
    gateway: Arc<dyn PersistenceGateway>,
    config: LockConfig,
}

impl LockService {
    /// Build a lock service over `gateway`, clamping TTLs per `config`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: LockConfig) -> Self {
        Self { gateway, config }
    }

    /// Acquire (or refresh) a lease on `key` for `holder_id`. `ttl` is
    /// clamped into `[1s, max_ttl]` before being sent to the gateway.
    pub async fn acquire(
        &self,
        key: &str,
        holder_id: &str,
        holder_type: &str,
        session_id: Option<&str>,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<AcquireOutcome> {
        let ttl = self.config.clamp(ttl);
        let result = self
            .gateway
            .rpc(
                "acquire_lock",
                json!({
                    "key": key,
                    "holder_id": holder_id,
                    "holder_type": holder_type,
                    "session_id": session_id,
                    "ttl_secs": ttl.as_secs(),
                    "reason": reason,
                }),
            )
            .await?;

        match result["status"].as_str() {
            Some("acquired") => Ok(AcquireOutcome::Acquired {
                expires_at: parse_timestamp(&result["expires_at"])?,
            }),
            Some("refreshed") => Ok(AcquireOutcome::Refreshed {
                expires_at: parse_timestamp(&result["expires_at"])?,
            }),
            Some("denied") => Ok(AcquireOutcome::Denied {
                holder_id: result["holder_id"].as_str().unwrap_or_default().to_string(),
                holder_type: result["holder_type"].as_str().unwrap_or("agent").to_string(),
            }),
            other => Err(Error::ValidationFailed {
                issues: vec![format!("acquire_lock returned unexpected status: {other:?}")],
            }),
        }
    }

    /// Acquire and, on contention, surface [`Error::HeldByOther`] directly
    /// rather than a tagged `Denied` variant — convenient for callers that
    /// want `?`-based propagation instead of a match.
    pub async fn acquire_or_err(
        &self,
        key: &str,
        holder_id: &str,
        holder_type: &str,
        session_id: Option<&str>,
        ttl: Duration,
        reason: Option<&str>,
    ) -> Result<DateTime<Utc>> {
        match self
            .acquire(key, holder_id, holder_type, session_id, ttl, reason)
            .await?
        {
            AcquireOutcome::Acquired { expires_at } | AcquireOutcome::Refreshed { expires_at } => {
                Ok(expires_at)
            }
            AcquireOutcome::Denied { holder_id, .. } => Err(Error::HeldByOther {
                key: key.to_string(),
                holder: holder_id,
            }),
        }
    }

    /// Release `key`, iff `holder_id` currently holds it. Releasing a key
    /// you do not hold (or one already expired) is `Ok(false)`, not an
    /// error — releasing is idempotent.
    pub async fn release(&self, key: &str, holder_id: &str) -> Result<bool> {
        let result = self
            .gateway
            .rpc("release_lock", json!({"key": key, "holder_id": holder_id}))
            .await?;
        Ok(result["status"] == "ok")
    }

    /// Extend an already-held lease, rejecting if the caller does not hold
    /// it. Implemented as acquire with the same semantics — acquire already
    /// refreshes on re-entry (§4.2's "uniform API for take and keep").
    pub async fn extend(
        &self,
        key: &str,
        holder_id: &str,
        holder_type: &str,
        ttl: Duration,
    ) -> Result<DateTime<Utc>> {
        self.acquire_or_err(key, holder_id, holder_type, None, ttl, None)
            .await
    }

    /// List currently active (non-expired) leases, optionally narrowed to a
    /// set of keys and/or a holder.
    pub async fn check(
        &self,
        keys: Option<&[String]>,
        holder_id: Option<&str>,
    ) -> Result<Vec<ActiveLease>> {
        let mut filter = Filter::all();
        if let Some(holder_id) = holder_id {
            filter = filter.eq("holder_id", holder_id);
        }
        let rows = self.gateway.query("file_locks", &filter).await?;
        let now = Utc::now();
        let mut leases = Vec::new();
        for row in rows {
            let key = row["key"].as_str().unwrap_or_default().to_string();
            if let Some(keys) = keys {
                if !keys.iter().any(|k| k == &key) {
                    continue;
                }
            }
            let expires_at = parse_timestamp(&row["expires_at"])?;
            if expires_at <= now {
                continue;
            }
            leases.push(ActiveLease {
                key,
                holder_id: row["holder_id"].as_str().unwrap_or_default().to_string(),
                holder_type: row["holder_type"].as_str().unwrap_or("agent").to_string(),
                acquired_at: parse_timestamp(&row["acquired_at"])?,
                expires_at,
                reason: row["reason"].as_str().map(ToString::to_string),
            });
        }
        Ok(leases)
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    let raw = value.as_str().ok_or_else(|| Error::ValidationFailed {
        issues: vec!["missing timestamp".into()],
    })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::ValidationFailed {
            issues: vec![e.to_string()],
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn service() -> LockService {
        let gateway = SqliteGateway::connect("sqlite::memory:").await.unwrap();
        LockService::new(
            Arc::new(gateway),
            LockConfig {
                default_ttl: Duration::from_secs(120 * 60),
                max_ttl: Duration::from_secs(480 * 60),
            },
        )
    }

    #[tokio::test]
    async fn exclusivity_and_reentry() {
        let svc = service().await;
        let a = svc
            .acquire("src/a.py", "alpha", "agent", None, Duration::from_secs(300), None)
            .await
            .unwrap();
        assert!(matches!(a, AcquireOutcome::Acquired { .. }));

        let refreshed = svc
            .acquire("src/a.py", "alpha", "agent", None, Duration::from_secs(600), None)
            .await
            .unwrap();
        let AcquireOutcome::Refreshed { expires_at } = refreshed else {
            panic!("expected refreshed");
        };

        let denied = svc
            .acquire("src/a.py", "beta", "agent", None, Duration::from_secs(300), None)
            .await
            .unwrap();
        assert_eq!(
            denied,
            AcquireOutcome::Denied {
                holder_id: "alpha".into(),
                holder_type: "agent".into()
            }
        );

        let leases = svc.check(None, None).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].expires_at, expires_at);
    }

    #[tokio::test]
    async fn release_then_reacquire() {
        let svc = service().await;
        svc.acquire("k", "alpha", "agent", None, Duration::from_secs(300), None)
            .await
            .unwrap();
        assert!(svc.release("k", "alpha").await.unwrap());
        assert!(!svc.release("k", "alpha").await.unwrap());

        let acquired = svc
            .acquire("k", "beta", "agent", None, Duration::from_secs(300), None)
            .await
            .unwrap();
        assert!(matches!(acquired, AcquireOutcome::Acquired { .. }));
    }

    #[tokio::test]
    async fn ttl_is_clamped() {
        let svc = service().await;
        let outcome = svc
            .acquire("k", "alpha", "agent", None, Duration::from_secs(0), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AcquireOutcome::Acquired { .. }));
    }
}
