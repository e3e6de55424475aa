//! Per-plan, per-package state tracking (§4.4, §4.4.1).
//!
//! A [`Plan`] is the scheduler's in-memory status map for one preflighted
//! work-package document; one plan orchestrator owns one `Plan` instance
//! (§5 — concurrent mutation of a single instance must be serialised by the
//! caller).

use super::document::WorkPackageDocument;
use super::preflight::{self, PreflightOutcome};
use crate::error::{Error, Result};
use crate::work_queue::WorkQueue;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A package's position in its lifecycle (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PackageState {
    /// Waiting on unfinished dependencies.
    Pending,
    /// Every dependency is complete; eligible for submission.
    Ready,
    /// Submitted to the work queue as a task.
    Submitted,
    /// The claiming agent is actively working it.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled because a dependency failed.
    Cancelled,
}

impl PackageState {
    /// Whether this state is terminal (the package will never transition
    /// again).
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One package's runtime status within a [`Plan`].
#[derive(Debug, Clone)]
pub struct PackageStatus {
    /// Current lifecycle state.
    pub state: PackageState,
    /// Number of submission attempts made so far.
    pub attempt_count: u32,
    /// The work-queue task id this package was submitted as, once known.
    pub task_id: Option<String>,
    /// The terminal error, if the package failed.
    pub error: Option<String>,
}

/// Outcome of submitting one ready package via [`Plan::submit_ready`].
#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    /// The package was submitted and advanced to `submitted`.
    Submitted {
        /// Which package.
        package_id: String,
        /// The work-queue task id it was submitted as.
        task_id: String,
    },
    /// Submission failed (e.g. a guardrail block); the package is left
    /// `ready` for a later retry.
    Deferred {
        /// Which package.
        package_id: String,
        /// Why submission did not go through.
        reason: String,
    },
}

/// A snapshot of a plan's overall progress (§4.4.1).
#[derive(Debug, Clone)]
pub struct StatusSummary {
    /// Whether every package has reached a terminal state.
    pub all_done: bool,
    /// Count of packages in each state.
    pub counts_by_state: HashMap<String, usize>,
    /// Each package's current state, by id.
    pub per_package_state: HashMap<String, PackageState>,
}

/// A preflighted plan and its live per-package status (§4.4, §4.4.1).
pub struct Plan {
    document: WorkPackageDocument,
    outcome: PreflightOutcome,
    dependents: HashMap<String, Vec<String>>,
    statuses: HashMap<String, PackageStatus>,
}

impl Plan {
    /// Run preflight against `document` and, on success, build a plan ready
    /// to drive submission.
    pub fn preflight(document: WorkPackageDocument, base_dir: &Path) -> Result<Self> {
        let outcome = preflight::run(&document, base_dir)?;

        let mut dependents: HashMap<String, Vec<String>> =
            document.packages.iter().map(|p| (p.id.clone(), Vec::new())).collect();
        for package in &document.packages {
            for dep in &package.depends_on {
                dependents.entry(dep.clone()).or_default().push(package.id.clone());
            }
        }

        let statuses = document
            .packages
            .iter()
            .map(|package| {
                let state = if package.depends_on.is_empty() { PackageState::Ready } else { PackageState::Pending };
                (
                    package.id.clone(),
                    PackageStatus { state, attempt_count: 0, task_id: None, error: None },
                )
            })
            .collect();

        Ok(Self { document, outcome, dependents, statuses })
    }

    /// The execution order computed during preflight.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.outcome.order
    }

    /// The submission envelope for `package_id`, if it exists.
    #[must_use]
    pub fn envelope(&self, package_id: &str) -> Option<&Value> {
        self.outcome.envelopes.get(package_id)
    }

    /// Current status of `package_id`.
    pub fn status(&self, package_id: &str) -> Result<&PackageStatus> {
        self.statuses.get(package_id).ok_or_else(|| Error::not_found("package", package_id))
    }

    /// All packages currently `ready`, plus `pending` packages whose every
    /// dependency has reached `completed`, sorted for determinism
    /// (§4.4.1).
    #[must_use]
    pub fn get_ready_packages(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .document
            .packages
            .iter()
            .filter(|package| match self.statuses[&package.id].state {
                PackageState::Ready => true,
                PackageState::Pending => package
                    .depends_on
                    .iter()
                    .all(|dep| self.statuses.get(dep).is_some_and(|s| s.state == PackageState::Completed)),
                _ => false,
            })
            .map(|package| package.id.clone())
            .collect();
        ready.sort_unstable();
        ready
    }

    /// Transition `package_id` to `submitted`, recording its work-queue task
    /// id.
    pub fn mark_submitted(&mut self, package_id: &str, task_id: impl Into<String>) -> Result<()> {
        let status = self.statuses.get_mut(package_id).ok_or_else(|| Error::not_found("package", package_id))?;
        status.state = PackageState::Submitted;
        status.task_id = Some(task_id.into());
        status.attempt_count += 1;
        Ok(())
    }

    /// Transition `package_id` to `in_progress`.
    pub fn mark_in_progress(&mut self, package_id: &str) -> Result<()> {
        let status = self.statuses.get_mut(package_id).ok_or_else(|| Error::not_found("package", package_id))?;
        status.state = PackageState::InProgress;
        Ok(())
    }

    /// Transition `package_id` to `completed`.
    pub fn mark_completed(&mut self, package_id: &str) -> Result<()> {
        let status = self.statuses.get_mut(package_id).ok_or_else(|| Error::not_found("package", package_id))?;
        status.state = PackageState::Completed;
        Ok(())
    }

    /// Transition `package_id` to `failed` and cancel every pending/ready
    /// descendant (§4.4.1's `cancel_dependents`, Testable Property 7).
    pub fn mark_failed(&mut self, package_id: &str, error: impl Into<String>) -> Result<()> {
        {
            let status = self.statuses.get_mut(package_id).ok_or_else(|| Error::not_found("package", package_id))?;
            status.state = PackageState::Failed;
            status.error = Some(error.into());
        }
        self.cancel_dependents(package_id);
        Ok(())
    }

    /// Walk the dependents closure of `failed_id` and cancel every
    /// `pending`/`ready` descendant with reason "dependency failed".
    fn cancel_dependents(&mut self, failed_id: &str) {
        let mut stack: Vec<String> = self.dependents.get(failed_id).cloned().unwrap_or_default();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(status) = self.statuses.get_mut(&id) {
                if matches!(status.state, PackageState::Pending | PackageState::Ready) {
                    status.state = PackageState::Cancelled;
                    status.error = Some("dependency failed".to_string());
                }
            }
            if let Some(children) = self.dependents.get(&id) {
                stack.extend(children.iter().cloned());
            }
        }
    }

    /// Submit every currently-ready package to `work_queue` as a task, using
    /// its preflight-computed envelope as `input_payload`, and advance each
    /// one to `submitted` on success. This is the orchestration step §4.4
    /// describes as "submit them as work queue tasks in order" and §2 notes
    /// the scheduler does not itself persist beyond what the work queue
    /// holds — submission here is the only write this method performs; the
    /// queue is the system of record for the resulting task.
    ///
    /// A package whose submission is guardrail-blocked is left `ready` (not
    /// advanced) so a subsequent call can retry it; its error is recorded
    /// on the returned outcome.
    pub async fn submit_ready(
        &mut self,
        work_queue: &WorkQueue,
        trust_level: u8,
    ) -> Result<Vec<SubmissionOutcome>> {
        let mut outcomes = Vec::new();
        for package_id in self.get_ready_packages() {
            let envelope = self
                .envelope(&package_id)
                .cloned()
                .ok_or_else(|| Error::not_found("package envelope", &package_id))?;
            let package = self
                .document
                .packages
                .iter()
                .find(|p| p.id == package_id)
                .ok_or_else(|| Error::not_found("package", &package_id))?;

            let submission = work_queue
                .submit(
                    &package.package_type,
                    &package.description,
                    envelope,
                    package.priority,
                    package.depends_on.clone(),
                    None,
                    trust_level,
                )
                .await;

            match submission {
                Ok(task_id) => {
                    self.mark_submitted(&package_id, task_id.clone())?;
                    outcomes.push(SubmissionOutcome::Submitted { package_id, task_id });
                }
                Err(err) => outcomes.push(SubmissionOutcome::Deferred {
                    package_id,
                    reason: err.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }

    /// A snapshot of the plan's overall progress (§4.4.1).
    #[must_use]
    pub fn status_summary(&self) -> StatusSummary {
        let mut counts_by_state: HashMap<String, usize> = HashMap::new();
        let mut per_package_state = HashMap::new();
        for (id, status) in &self.statuses {
            *counts_by_state.entry(status.state.to_string()).or_insert(0) += 1;
            per_package_state.insert(id.clone(), status.state);
        }
        let all_done = self.statuses.values().all(|s| s.state.is_done());
        StatusSummary { all_done, counts_by_state, per_package_state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_scheduler::document::*;
    use crate::gateway::sqlite::SqliteGateway;
    use crate::gateway::PersistenceGateway;
    use crate::guardrails::GuardrailsEngine;
    use std::sync::Arc;

    fn package(id: &str, depends_on: &[&str]) -> Package {
        Package {
            id: id.to_string(),
            title: format!("title-{id}"),
            package_type: "implementation".into(),
            description: "does things".into(),
            priority: 5,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            locks: Locks::default(),
            scope: Scope::default(),
            worktree: format!("wt-{id}"),
            timeout_minutes: 60,
            retry_budget: 0,
            verification: vec![],
            expected_outputs: vec![],
        }
    }

    fn document(packages: Vec<Package>) -> WorkPackageDocument {
        WorkPackageDocument {
            schema_version: "1".into(),
            feature: FeatureRef { id: "f1".into(), title: "Feature One".into(), plan_revision: 1 },
            contracts: Contracts {
                revision: "r1".into(),
                openapi: OpenApiContract { primary: "contract.yaml".into(), files: vec![] },
            },
            packages,
        }
    }

    fn plan_with(packages: Vec<Package>) -> Plan {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();
        Plan::preflight(document(packages), dir.path()).unwrap()
    }

    #[test]
    fn initial_states_reflect_dependency_presence() {
        let plan = plan_with(vec![package("A", &[]), package("B", &["A"])]);
        assert_eq!(plan.status("A").unwrap().state, PackageState::Ready);
        assert_eq!(plan.status("B").unwrap().state, PackageState::Pending);
        assert_eq!(plan.get_ready_packages(), vec!["A".to_string()]);
    }

    #[test]
    fn completing_a_dependency_unlocks_its_dependent() {
        let mut plan = plan_with(vec![package("A", &[]), package("B", &["A"])]);
        plan.mark_submitted("A", "task-a").unwrap();
        plan.mark_in_progress("A").unwrap();
        plan.mark_completed("A").unwrap();
        assert_eq!(plan.get_ready_packages(), vec!["B".to_string()]);
    }

    #[test]
    fn transitive_cancellation_on_failure() {
        let mut plan = plan_with(vec![
            package("A", &[]),
            package("B", &["A"]),
            package("C", &["B"]),
            package("D", &[]),
        ]);
        plan.mark_failed("A", "boom").unwrap();
        assert_eq!(plan.status("B").unwrap().state, PackageState::Cancelled);
        assert_eq!(plan.status("C").unwrap().state, PackageState::Cancelled);
        assert_eq!(plan.status("D").unwrap().state, PackageState::Ready);

        let summary = plan.status_summary();
        assert!(!summary.all_done);
        assert_eq!(summary.per_package_state["C"], PackageState::Cancelled);
    }

    #[test]
    fn plan_is_done_when_every_package_reaches_a_terminal_state() {
        let mut plan = plan_with(vec![package("A", &[])]);
        assert!(!plan.status_summary().all_done);
        plan.mark_submitted("A", "task-a").unwrap();
        plan.mark_in_progress("A").unwrap();
        plan.mark_completed("A").unwrap();
        assert!(plan.status_summary().all_done);
    }

    #[tokio::test]
    async fn submit_ready_advances_only_the_ready_package_and_submits_it() {
        let mut plan = plan_with(vec![package("A", &[]), package("B", &["A"])]);
        let gateway: Arc<dyn PersistenceGateway> =
            Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap());
        let queue = WorkQueue::new(gateway.clone(), GuardrailsEngine::new(gateway));

        let outcomes = plan.submit_ready(&queue, 2).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let SubmissionOutcome::Submitted { package_id, task_id } = &outcomes[0] else {
            panic!("expected A to submit");
        };
        assert_eq!(package_id, "A");
        assert_eq!(plan.status("A").unwrap().state, PackageState::Submitted);
        assert_eq!(plan.status("A").unwrap().task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(plan.status("B").unwrap().state, PackageState::Pending);

        let task = queue.get_task(task_id).await.unwrap();
        assert_eq!(task.description, "does things");

        // B is still gated on A's completion, so a second call submits nothing.
        let second = plan.submit_ready(&queue, 2).await.unwrap();
        assert!(second.is_empty());
    }
}
