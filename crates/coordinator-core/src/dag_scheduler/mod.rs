//! DAG Scheduler: validates a declarative work-package document, computes a
//! deterministic execution order, and tracks per-package lifecycle with
//! transitive cancellation on failure (§4.4).
//!
//! The scheduler itself does not persist plan state (§2) — a [`Plan`] lives
//! in the orchestrator's memory for the plan's lifetime, submitting each
//! ready package to the [`crate::work_queue::WorkQueue`] as its
//! dependencies clear.

pub mod document;
pub mod plan;
pub mod preflight;

pub use document::{Contracts, FeatureRef, Locks, OpenApiContract, Package, Scope, WorkPackageDocument};
pub use plan::{PackageState, PackageStatus, Plan, StatusSummary, SubmissionOutcome};
pub use preflight::PreflightOutcome;
