//! Work-package document types (§6, §4.4): the declarative input the DAG
//! Scheduler's preflight pipeline validates and, on success, executes.

use serde::{Deserialize, Serialize};

/// Top-level work-package document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPackageDocument {
    /// Schema version the document conforms to.
    pub schema_version: String,
    /// Identity of the feature this plan implements.
    pub feature: FeatureRef,
    /// Contract revision and referenced files.
    pub contracts: Contracts,
    /// The packages themselves.
    pub packages: Vec<Package>,
}

/// The feature a work-package plan belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRef {
    /// Stable feature identifier.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Plan revision, bumped on re-submission.
    pub plan_revision: u64,
}

/// Contract metadata attached to a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contracts {
    /// Contract revision identifier.
    pub revision: String,
    /// OpenAPI contract description.
    pub openapi: OpenApiContract,
}

/// The OpenAPI contract files a plan depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiContract {
    /// Path to the primary contract file, relative to the plan's base
    /// directory.
    pub primary: String,
    /// Additional referenced contract files, also relative to the base
    /// directory.
    #[serde(default)]
    pub files: Vec<String>,
}

impl OpenApiContract {
    /// All contract file paths this document references, primary first.
    pub fn all_files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.files.iter().map(String::as_str))
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Unique identifier among the plan's packages.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Free-form package type tag (`implementation`, `test`, `migration`, ...).
    #[serde(rename = "type")]
    pub package_type: String,
    /// What this package does.
    pub description: String,
    /// Queue priority; lower is higher priority (§4.3).
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Sibling package ids this package depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Files and logical keys this package locks while running.
    #[serde(default)]
    pub locks: Locks,
    /// Read/write glob scope this package is confined to.
    #[serde(default)]
    pub scope: Scope,
    /// Isolated worktree name this package runs in.
    pub worktree: String,
    /// Deadline in minutes; defaults to 60 per §5.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    /// How many times this package may be retried on failure.
    #[serde(default)]
    pub retry_budget: u32,
    /// Verification steps run after the package completes.
    #[serde(default)]
    pub verification: Vec<String>,
    /// Keys the package's output must provide.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

fn default_priority() -> i64 {
    5
}

fn default_timeout_minutes() -> u64 {
    60
}

/// Lock keys a package declares (§4.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Locks {
    /// File paths locked for the package's duration.
    #[serde(default)]
    pub files: Vec<String>,
    /// Logical (non-file) lock keys.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Glob-based read/write scope a package is confined to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    /// Globs this package may write to.
    #[serde(default)]
    pub write_allowed: Vec<String>,
    /// Globs this package may read from.
    #[serde(default)]
    pub read_allowed: Vec<String>,
}
