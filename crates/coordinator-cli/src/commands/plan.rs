//! `coordinatord plan` — validate a work-package document and print its
//! topological order (§6, Scenario F).

use crate::output;
use coordinator_core::dag_scheduler::{Plan, WorkPackageDocument};
use coordinator_core::Error;
use serde_json::json;
use std::path::Path;

pub fn run(path: &Path) -> i32 {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => return output::usage_error(format!("reading {}: {err}", path.display())),
    };
    let document: WorkPackageDocument = match serde_json::from_str(&raw) {
        Ok(document) => document,
        Err(err) => return output::from_error(&Error::from(err)),
    };

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    match Plan::preflight(document, base_dir) {
        Ok(plan) => output::ok(
            "plan is valid",
            json!({
                "order": plan.order(),
                "package_count": plan.order().len(),
            }),
        ),
        Err(err) => output::from_error(&err),
    }
}
