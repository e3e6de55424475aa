//! The DAG Scheduler's eight-step preflight pipeline (§4.4). Each step is a
//! gate: a failing step returns every issue it found without running later
//! steps, per §7's "collect all issues of a given kind".

use super::document::WorkPackageDocument;
use crate::error::{Error, Result};
use globset::{Glob, GlobSetBuilder};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Outcome of a successful preflight run: the deterministic execution order
/// and the per-package submission envelope (the task's `input_payload`).
#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    /// Package ids in execution order (a topological sort, ties broken
    /// alphabetically).
    pub order: Vec<String>,
    /// Per-package submission envelope, keyed by package id.
    pub envelopes: HashMap<String, Value>,
}

fn fail(issues: Vec<String>) -> Error {
    Error::ValidationFailed { issues }
}

/// Run the full eight-step pipeline against `document`, resolving contract
/// file existence relative to `base_dir`.
pub fn run(document: &WorkPackageDocument, base_dir: &Path) -> Result<PreflightOutcome> {
    validate_schema(document)?;
    validate_references(document)?;
    let graph = build_graph(document)?;
    detect_cycles(&graph)?;
    validate_scope_overlap(document, &graph)?;
    validate_lock_overlap(document, &graph)?;
    validate_contracts(document, base_dir)?;
    let order = topological_order(document)?;
    let envelopes = build_envelopes(document);
    Ok(PreflightOutcome { order, envelopes })
}

/// Step 1: structural conformance beyond what serde's `Deserialize` already
/// enforces — required-field presence is handled at parse time, so this
/// checks the remaining domain constraints (non-empty id/title, unique ids).
fn validate_schema(document: &WorkPackageDocument) -> Result<()> {
    let mut issues = Vec::new();
    if document.packages.is_empty() {
        issues.push("document declares no packages".to_string());
    }
    let mut seen = HashSet::new();
    for package in &document.packages {
        if package.id.trim().is_empty() {
            issues.push("package with empty id".to_string());
            continue;
        }
        if !seen.insert(package.id.clone()) {
            issues.push(format!("duplicate package id: {}", package.id));
        }
        if package.title.trim().is_empty() {
            issues.push(format!("package {} has an empty title", package.id));
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(fail(issues)) }
}

/// Step 2: every `depends_on` entry refers to a sibling package.
fn validate_references(document: &WorkPackageDocument) -> Result<()> {
    let ids: HashSet<&str> = document.packages.iter().map(|p| p.id.as_str()).collect();
    let mut issues = Vec::new();
    for package in &document.packages {
        for dep in &package.depends_on {
            if !ids.contains(dep.as_str()) {
                issues.push(format!("package {} depends on unknown package {dep}", package.id));
            }
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(fail(issues)) }
}

fn build_graph(document: &WorkPackageDocument) -> Result<(DiGraph<String, ()>, HashMap<String, NodeIndex>)> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();
    for package in &document.packages {
        let idx = graph.add_node(package.id.clone());
        indices.insert(package.id.clone(), idx);
    }
    for package in &document.packages {
        let to = indices[&package.id];
        for dep in &package.depends_on {
            if let Some(&from) = indices.get(dep) {
                graph.add_edge(from, to, ());
            }
        }
    }
    Ok((graph, indices))
}

/// Step 3: the dependency graph is acyclic.
fn detect_cycles((graph, _): &(DiGraph<String, ()>, HashMap<String, NodeIndex>)) -> Result<()> {
    toposort(graph, None).map(|_| ()).map_err(|cycle| {
        let name = graph.node_weight(cycle.node_id()).cloned().unwrap_or_default();
        fail(vec![format!("dependency cycle detected at package {name}")])
    })
}

fn depends_transitively(
    graph: &DiGraph<String, ()>,
    indices: &HashMap<String, NodeIndex>,
    a: &str,
    b: &str,
) -> bool {
    let Some(&a_idx) = indices.get(a) else { return false };
    let Some(&b_idx) = indices.get(b) else { return false };
    let ancestors_of_a = ancestors(graph, a_idx);
    let ancestors_of_b = ancestors(graph, b_idx);
    ancestors_of_a.contains(&b_idx) || ancestors_of_b.contains(&a_idx)
}

fn ancestors(graph: &DiGraph<String, ()>, start: NodeIndex) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        for pred in graph.neighbors_directed(node, petgraph::Direction::Incoming) {
            if seen.insert(pred) {
                stack.push(pred);
            }
        }
    }
    seen
}

/// Step 4: no two packages without a direct or transitive dependency edge
/// declare overlapping write-allowed globs.
fn validate_scope_overlap(
    document: &WorkPackageDocument,
    (graph, indices): &(DiGraph<String, ()>, HashMap<String, NodeIndex>),
) -> Result<()> {
    let mut issues = Vec::new();
    for (i, a) in document.packages.iter().enumerate() {
        for b in &document.packages[i + 1..] {
            if depends_transitively(graph, indices, &a.id, &b.id) {
                continue;
            }
            if globs_overlap(&a.scope.write_allowed, &b.scope.write_allowed) {
                issues.push(format!(
                    "packages {} and {} declare overlapping write scope with no dependency edge",
                    a.id, b.id
                ));
            }
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(fail(issues)) }
}

fn globs_overlap(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let Ok(set_a) = build_globset(a) else { return false };
    // A literal-path heuristic covers the common case (concrete paths or
    // single-segment globs): a path drawn from one package's declared globs
    // is tested against the other package's set, and vice versa.
    b.iter().any(|candidate| set_a.is_match(candidate)) || {
        let Ok(set_b) = build_globset(b) else { return false };
        a.iter().any(|candidate| set_b.is_match(candidate))
    }
}

fn build_globset(patterns: &[String]) -> std::result::Result<globset::GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Step 5: no two packages without a dependency edge declare the same
/// logical lock key (file or key).
fn validate_lock_overlap(
    document: &WorkPackageDocument,
    (graph, indices): &(DiGraph<String, ()>, HashMap<String, NodeIndex>),
) -> Result<()> {
    let mut issues = Vec::new();
    for (i, a) in document.packages.iter().enumerate() {
        let a_keys: HashSet<&str> = a.locks.files.iter().chain(a.locks.keys.iter()).map(String::as_str).collect();
        for b in &document.packages[i + 1..] {
            if depends_transitively(graph, indices, &a.id, &b.id) {
                continue;
            }
            let b_keys: HashSet<&str> = b.locks.files.iter().chain(b.locks.keys.iter()).map(String::as_str).collect();
            let shared: Vec<&str> = a_keys.intersection(&b_keys).copied().collect();
            if !shared.is_empty() {
                issues.push(format!(
                    "packages {} and {} both declare lock key(s) {} with no dependency edge",
                    a.id,
                    b.id,
                    shared.join(", ")
                ));
            }
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(fail(issues)) }
}

/// Step 6: every contract file the document references exists on disk.
fn validate_contracts(document: &WorkPackageDocument, base_dir: &Path) -> Result<()> {
    let mut issues = Vec::new();
    for file in document.contracts.openapi.all_files() {
        if !base_dir.join(file).exists() {
            issues.push(format!("missing contract: {file}"));
        }
    }
    if issues.is_empty() { Ok(()) } else { Err(fail(issues)) }
}

/// Step 7: breadth-first layer expansion, alphabetical tiebreak within a
/// layer, for a deterministic topological order (§8, Testable Property 6).
fn topological_order(document: &WorkPackageDocument) -> Result<Vec<String>> {
    let mut remaining: HashMap<&str, HashSet<&str>> = document
        .packages
        .iter()
        .map(|p| (p.id.as_str(), p.depends_on.iter().map(String::as_str).collect()))
        .collect();
    let mut order = Vec::with_capacity(document.packages.len());

    while !remaining.is_empty() {
        let mut layer: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if layer.is_empty() {
            // detect_cycles already ran, but guard regardless of call order.
            return Err(fail(vec!["no package with satisfied dependencies remains; cycle?".to_string()]));
        }
        layer.sort_unstable();
        for id in &layer {
            remaining.remove(id);
            order.push((*id).to_string());
        }
        for deps in remaining.values_mut() {
            for id in &layer {
                deps.remove(id);
            }
        }
    }

    Ok(order)
}

/// Step 8: build each package's submission envelope — the context slice
/// carried as the work-queue task's `input_payload`.
fn build_envelopes(document: &WorkPackageDocument) -> HashMap<String, Value> {
    document
        .packages
        .iter()
        .map(|package| {
            let envelope = json!({
                "feature_id": document.feature.id,
                "plan_revision": document.feature.plan_revision,
                "contracts_revision": document.contracts.revision,
                "package": package,
            });
            (package.id.clone(), envelope)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag_scheduler::document::*;
    use proptest::prelude::*;

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

    #[test]
    fn scenario_f_sorts_topologically_and_detects_missing_contract() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "openapi: 3.0.0").unwrap();
        let doc = document(vec![
            package("A", &[]),
            package("B", &["A"]),
            package("C", &["A", "B"]),
        ]);
        let outcome = run(&doc, dir.path()).unwrap();
        assert_eq!(outcome.order, vec!["A", "B", "C"]);
        assert_eq!(outcome.envelopes.len(), 3);

        std::fs::remove_file(dir.path().join("contract.yaml")).unwrap();
        let err = run(&doc, dir.path()).unwrap_err();
        match err {
            Error::ValidationFailed { issues } => {
                assert_eq!(issues, vec!["missing contract: contract.yaml".to_string()]);
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();
        let doc = document(vec![package("A", &["B"]), package("B", &["A"])]);
        assert!(run(&doc, dir.path()).is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();
        let doc = document(vec![package("A", &["ghost"])]);
        assert!(run(&doc, dir.path()).is_err());
    }

    #[test]
    fn equal_depth_packages_tiebreak_alphabetically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();
        let doc = document(vec![package("zeta", &[]), package("alpha", &[]), package("mu", &[])]);
        let outcome = run(&doc, dir.path()).unwrap();
        assert_eq!(outcome.order, vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn overlapping_write_scope_without_dependency_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();
        let mut a = package("A", &[]);
        a.scope.write_allowed = vec!["src/shared.rs".to_string()];
        let mut b = package("B", &[]);
        b.scope.write_allowed = vec!["src/shared.rs".to_string()];
        let doc = document(vec![a, b]);
        assert!(run(&doc, dir.path()).is_err());
    }

    proptest! {
        /// Testable Property 6: for any acyclic-by-construction package set,
        /// the produced order is a valid topological sort and is identical
        /// across repeated runs over the same document.
        #[test]
        fn dag_sort_is_sound_and_deterministic(dep_mask in prop::collection::vec(0u32..256, 2..8)) {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("contract.yaml"), "x").unwrap();

            // Package i may only depend on packages with a lower index, so
            // the generated document is acyclic by construction regardless
            // of which mask bits are set.
            let ids: Vec<String> = (0..dep_mask.len()).map(|i| format!("p{i}")).collect();
            let packages: Vec<Package> = dep_mask
                .iter()
                .enumerate()
                .map(|(i, mask)| {
                    let depends_on: Vec<&str> = (0..i).filter(|j| mask & (1 << j) != 0).map(|j| ids[j].as_str()).collect();
                    package(&ids[i], &depends_on)
                })
                .collect();
            let doc = document(packages);

            let first = run(&doc, dir.path()).unwrap();
            let second = run(&doc, dir.path()).unwrap();
            prop_assert_eq!(&first.order, &second.order);

            let position: HashMap<&str, usize> = first.order.iter().map(String::as_str).zip(0..).collect();
            for package in &doc.packages {
                for dep in &package.depends_on {
                    prop_assert!(position[dep.as_str()] < position[package.id.as_str()]);
                }
            }
        }
    }
}
