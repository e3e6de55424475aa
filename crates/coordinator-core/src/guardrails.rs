//! Guardrails Engine: a deterministic regex-based content filter with
//! per-pattern trust thresholds and a compiled-in fallback pattern list.
//!
//! Patterns are loaded at call time from persistence; a persistence failure
//! falls back to [`fallback_patterns`] rather than failing the check open or
//! closed in an inconsistent way. A pattern whose regex fails to compile is
//! skipped with a `tracing::warn!`, never aborts the check (§4.7).

use crate::error::Result;
use crate::gateway::{Filter, PersistenceGateway};
use regex::Regex;
use std::sync::Arc;

/// Severity of a guardrail pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    /// Blocks the operation when the requester's trust level is too low.
    Block,
    /// Recorded but never blocks.
    Warn,
}

/// A single guardrail pattern, as loaded from persistence or the fallback.
#[derive(Debug, Clone)]
pub struct GuardrailPattern {
    /// Stable pattern name, used in violation logs and block reasons.
    pub name: String,
    /// Free-text category (`destructive`, `secrets`, ...).
    pub category: String,
    /// The regex source; compiled lazily per-check.
    pub regex: String,
    /// Severity of a match.
    pub severity: Severity,
    /// Minimum trust level required to bypass a block.
    pub min_trust_level: u8,
}

/// A single matched pattern.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Which pattern matched.
    pub pattern_name: String,
    /// Its category.
    pub category: String,
    /// Its severity.
    pub severity: Severity,
    /// Whether this specific match blocks the operation (severity=block and
    /// the requester's trust is below the pattern's threshold).
    pub blocked: bool,
}

/// Outcome of [`GuardrailsEngine::check_operation`].
#[derive(Debug, Clone)]
pub struct GuardrailCheck {
    /// `true` iff no violation in [`violations`](Self::violations) is
    /// blocked.
    pub safe: bool,
    /// Every pattern that matched, blocked or not.
    pub violations: Vec<Violation>,
}

impl GuardrailCheck {
    /// Comma-joined names of the blocking violations, for
    /// `Error::DestructiveOperationBlocked`.
    #[must_use]
    pub fn blocked_pattern_names(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.blocked)
            .map(|v| v.pattern_name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The compiled-in fallback registry used whenever persistence cannot supply
/// patterns, grounded in the original test suite's fixtures (§4.7).
#[must_use]
pub fn fallback_patterns() -> Vec<GuardrailPattern> {
    vec![
        GuardrailPattern {
            name: "git_force_push".into(),
            category: "destructive".into(),
            regex: r"git\s+push\s+.*--force".into(),
            severity: Severity::Block,
            min_trust_level: 3,
        },
        GuardrailPattern {
            name: "rm_rf".into(),
            category: "destructive".into(),
            regex: r"rm\s+-rf\s+".into(),
            severity: Severity::Block,
            min_trust_level: 3,
        },
        GuardrailPattern {
            name: "env_file_modify".into(),
            category: "secrets".into(),
            regex: r"\.(env|env\.local)".into(),
            severity: Severity::Warn,
            min_trust_level: 2,
        },
        GuardrailPattern {
            name: "credentials_file".into(),
            category: "secrets".into(),
            regex: r"(credentials|secrets)\.(json|yaml)".into(),
            severity: Severity::Warn,
            min_trust_level: 2,
        },
    ]
}

/// `check_operation(text, file_paths?, trust_level, agent?) -> {safe,
/// violations}` from §4.7.
#[derive(Clone)]
pub struct GuardrailsEngine {
    gateway: Arc<dyn PersistenceGateway>,
}

impl GuardrailsEngine {
    /// Build a guardrails engine over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    async fn load_patterns(&self) -> Vec<GuardrailPattern> {
        match self
            .gateway
            .query("operation_guardrails", &Filter::all())
            .await
        {
            Ok(rows) if !rows.is_empty() => rows
                .into_iter()
                .filter_map(|row| {
                    Some(GuardrailPattern {
                        name: row["name"].as_str()?.to_string(),
                        category: row["category"].as_str().unwrap_or_default().to_string(),
                        regex: row["regex"].as_str()?.to_string(),
                        severity: row["severity"]
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(Severity::Warn),
                        min_trust_level: row["min_trust_level"].as_u64().unwrap_or(0) as u8,
                    })
                })
                .collect(),
            _ => fallback_patterns(),
        }
    }

    /// Run `text` and each of `file_paths` against every known pattern,
    /// given the requester's `trust_level`. Best-effort logs blocked
    /// violations to the violation log; a logging failure never changes the
    /// already-computed verdict (§9 — fail-closed on safety, not on
    /// bookkeeping).
    pub async fn check_operation(
        &self,
        text: &str,
        file_paths: &[String],
        trust_level: u8,
        agent_id: Option<&str>,
        operation: &str,
    ) -> GuardrailCheck {
        let patterns = self.load_patterns().await;
        let mut violations = Vec::new();

        for pattern in &patterns {
            let re = match Regex::new(&pattern.regex) {
                Ok(re) => re,
                Err(err) => {
                    tracing::warn!(pattern = %pattern.name, error = %err, "skipping unparseable guardrail pattern");
                    continue;
                }
            };
            let matched = re.is_match(text) || file_paths.iter().any(|p| re.is_match(p));
            if !matched {
                continue;
            }
            let blocked = pattern.severity == Severity::Block && trust_level < pattern.min_trust_level;
            violations.push(Violation {
                pattern_name: pattern.name.clone(),
                category: pattern.category.clone(),
                severity: pattern.severity,
                blocked,
            });
        }

        let safe = !violations.iter().any(|v| v.blocked);
        let check = GuardrailCheck { safe, violations };

        for violation in check.violations.iter().filter(|v| v.blocked) {
            let excerpt: String = text.chars().take(200).collect();
            let _ = self
                .gateway
                .insert(
                    "guardrail_violations",
                    serde_json::json!({
                        "agent_id": agent_id,
                        "agent_type": Option::<&str>::None,
                        "pattern_name": violation.pattern_name,
                        "category": violation.category,
                        "severity": violation.severity.to_string(),
                        "operation_excerpt": format!("{operation}: {excerpt}"),
                    }),
                )
                .await;
        }

        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn engine() -> GuardrailsEngine {
        let gateway = SqliteGateway::connect("sqlite::memory:").await.unwrap();
        GuardrailsEngine::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn rm_rf_blocks_below_threshold_only() {
        let engine = engine().await;
        let low = engine
            .check_operation("rm -rf /tmp", &[], 1, Some("agent-a"), "shell")
            .await;
        assert!(!low.safe);
        assert_eq!(low.violations.iter().filter(|v| v.blocked).count(), 1);

        let high = engine
            .check_operation("rm -rf /tmp", &[], 3, Some("agent-a"), "shell")
            .await;
        assert!(high.safe);
    }

    #[tokio::test]
    async fn unmatched_text_is_safe() {
        let engine = engine().await;
        let check = engine
            .check_operation("ls -la", &[], 0, None, "shell")
            .await;
        assert!(check.safe);
        assert!(check.violations.is_empty());
    }

    #[tokio::test]
    async fn warn_severity_never_blocks() {
        let engine = engine().await;
        let check = engine
            .check_operation("edit .env", &[], 0, None, "edit")
            .await;
        assert!(check.safe);
        assert_eq!(check.violations.len(), 1);
        assert!(!check.violations[0].blocked);
    }
}
