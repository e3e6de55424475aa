//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the coordinator returns a [`Result<T>`] carrying
//! one of the structured [`Error`] variants below. No component throws an
//! unchecked exception across a boundary; infrastructure failures (sqlx,
//! reqwest, regex, serde) convert into `Error::BackendUnavailable` or
//! `Error::ValidationFailed` via `#[from]` rather than propagating their own
//! types.

use std::fmt;

/// The result type used throughout the coordinator core.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error kinds, one per failure class a caller needs to branch on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The persistence layer (native or REST) could not be reached, or
    /// returned a transport-level failure. Always recoverable; callers must
    /// not crash the process on this variant.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable {
        /// Human-readable detail, not parsed by callers.
        reason: String,
    },

    /// The requested resource does not exist.
    #[error("not found: {what} {id}")]
    NotFound {
        /// Kind of resource ("lock", "task", "feature", ...).
        what: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A lock key is already held by a different holder.
    #[error("{key} is held by {holder}")]
    HeldByOther {
        /// The contended key.
        key: String,
        /// The current holder's identifier.
        holder: String,
    },

    /// A task claim or package transition is blocked on unfinished
    /// dependencies.
    #[error("dependency unsatisfied: {detail}")]
    DependencyUnsatisfied {
        /// Which dependency, and why.
        detail: String,
    },

    /// A policy engine or agent profile denied the operation.
    #[error("authorization denied: {reason}")]
    AuthorizationDenied {
        /// The engine's human-readable reason.
        reason: String,
    },

    /// A guardrail pattern blocked the operation.
    #[error("destructive operation blocked: {patterns}")]
    DestructiveOperationBlocked {
        /// Comma-joined names of the patterns that blocked the call.
        patterns: String,
    },

    /// Schema, cycle, scope-overlap, or lock-overlap validation failed.
    /// Carries every issue found, not just the first.
    #[error("validation failed: {} issue(s)", issues.len())]
    ValidationFailed {
        /// All collected validation issues.
        issues: Vec<String>,
    },

    /// A pre-merge or pre-condition check failed.
    #[error("precondition failed: {detail}")]
    PreconditionFailed {
        /// What precondition failed.
        detail: String,
    },

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Elapsed time before the timeout fired.
        elapsed_ms: u64,
    },

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// A SCREAMING_SNAKE_CASE machine-readable code, for CLI JSON envelopes
    /// and stable across releases.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::HeldByOther { .. } => "HELD_BY_OTHER",
            Self::DependencyUnsatisfied { .. } => "DEPENDENCY_UNSATISFIED",
            Self::AuthorizationDenied { .. } => "AUTHORIZATION_DENIED",
            Self::DestructiveOperationBlocked { .. } => "DESTRUCTIVE_OPERATION_BLOCKED",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::PreconditionFailed { .. } => "PRECONDITION_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// The process exit code class this error maps to, per the CLI's
    /// exit-code contract: validation failures are non-retryable (10),
    /// backend unavailability is retryable (11), everything else is a
    /// generic failure (1).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ValidationFailed { .. } => 10,
            Self::BackendUnavailable { .. } => 11,
            _ => 1,
        }
    }

    pub(crate) fn backend_unavailable(reason: impl fmt::Display) -> Self {
        Self::BackendUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Construct a [`Error::NotFound`] for the given resource kind and id.
    #[must_use]
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::backend_unavailable(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::backend_unavailable(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ValidationFailed {
            issues: vec![err.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Cancelled.code(), "CANCELLED");
        assert_eq!(
            Error::HeldByOther {
                key: "k".into(),
                holder: "h".into()
            }
            .code(),
            "HELD_BY_OTHER"
        );
    }

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(
            Error::ValidationFailed { issues: vec![] }.exit_code(),
            10
        );
        assert_eq!(
            Error::backend_unavailable("down").exit_code(),
            11
        );
        assert_eq!(Error::Cancelled.exit_code(), 1);
    }
}
