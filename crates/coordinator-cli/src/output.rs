//! The CLI's single output shape: a JSON envelope printed to stdout for every
//! command, and an exit code derived from the outcome (§6/§7).
//!
//! Every subcommand funnels its result through [`emit`] so the exit code the
//! process returns always matches the decision the envelope describes, never
//! the message text.

use coordinator_core::Error;
use serde::Serialize;
use serde_json::Value;

/// `{decision, reason, diagnostics}` — the CLI's one JSON result shape.
#[derive(Debug, Serialize)]
pub struct Envelope {
    /// `ok` or a machine-readable error code (`Error::code()`).
    pub decision: String,
    /// Human-readable summary.
    pub reason: String,
    /// Command-specific payload; `null` when there is nothing beyond the
    /// decision itself.
    pub diagnostics: Value,
}

impl Envelope {
    fn print(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(body) => println!("{body}"),
            Err(err) => println!(r#"{{"decision":"INTERNAL_ERROR","reason":"{err}","diagnostics":null}}"#),
        }
    }
}

/// Print a success envelope and return exit code 0.
pub fn ok(reason: impl Into<String>, diagnostics: Value) -> i32 {
    Envelope { decision: "ok".into(), reason: reason.into(), diagnostics }.print();
    0
}

/// Print an envelope for `err` and return its exit-code class (§7: 10
/// validation, 11 backend unavailable, 1 otherwise).
pub fn from_error(err: &Error) -> i32 {
    Envelope {
        decision: err.code().to_string(),
        reason: err.to_string(),
        diagnostics: Value::Null,
    }
    .print();
    err.exit_code()
}

/// A plain usage error, not backed by a coordinator [`Error`] (bad CLI args,
/// unreadable files). Always exit code 1 per §6.
pub fn usage_error(reason: impl Into<String>) -> i32 {
    Envelope { decision: "USAGE_ERROR".into(), reason: reason.into(), diagnostics: Value::Null }.print();
    1
}
