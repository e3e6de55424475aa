//! Feature Registry & Merge Queue: cross-feature resource-claim overlap
//! analysis and ordered merge scheduling (§4.5).

use crate::error::{Error, Result};
use crate::gateway::{Filter, PersistenceGateway};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Feasibility threshold (§4.5): ratio of overlapping candidate claims to
/// total candidate claims above which scheduling is only `SEQUENTIAL`.
pub const SEQUENTIAL_THRESHOLD: f64 = 0.5;

/// Verdict of running a candidate feature in parallel with currently active
/// features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Feasibility {
    /// No overlapping claims at all.
    Full,
    /// Some overlap, but at or below the sequential threshold.
    Partial,
    /// Overlap ratio exceeds the sequential threshold.
    Sequential,
}

/// Result of [`FeatureRegistry::analyze_conflicts`].
#[derive(Debug, Clone)]
pub struct ConflictAnalysis {
    /// Overall verdict.
    pub feasibility: Feasibility,
    /// Overlapping keys, grouped by the other feature that claims them.
    pub overlaps_by_feature: BTreeMap<String, Vec<String>>,
}

/// A registered feature.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Stable human identifier.
    pub feature_id: String,
    /// Title.
    pub title: String,
    /// Lifecycle status.
    pub status: String,
    /// Resource claims (lock keys) this feature asserts.
    pub resource_claims: Vec<String>,
    /// Merge priority (lower sorts first).
    pub merge_priority: i64,
    /// Open metadata map, including the merge-queue overlay.
    pub metadata: Value,
}

impl Feature {
    fn from_row(row: &Value) -> Self {
        Self {
            feature_id: row["feature_id"].as_str().unwrap_or_default().to_string(),
            title: row["title"].as_str().unwrap_or_default().to_string(),
            status: row["status"].as_str().unwrap_or("active").to_string(),
            resource_claims: row["resource_claims"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect())
                .unwrap_or_default(),
            merge_priority: row["merge_priority"].as_i64().unwrap_or(5),
            metadata: row.get("metadata").cloned().unwrap_or_else(|| json!({})),
        }
    }
}

/// Merge-queue overlay status (§4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MergeQueueStatus {
    /// Enqueued, not yet checked.
    Queued,
    /// A pre-merge check is in flight (reserved for callers that want to
    /// mark this explicitly; `precheck` goes straight to ready/blocked).
    PreMergeCheck,
    /// Pre-merge check passed.
    Ready,
    /// Pre-merge check found a conflict.
    Blocked,
    /// Actively being merged.
    Merging,
    /// Merged and deregistered.
    Merged,
}

/// Register/conflict-analysis/merge-queue operations from §4.5 and §4.5.1.
#[derive(Clone)]
pub struct FeatureRegistry {
    gateway: Arc<dyn PersistenceGateway>,
}

impl FeatureRegistry {
    /// Build a registry over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    /// Register (or idempotently re-register) a feature's resource claims.
    pub async fn register(
        &self,
        feature_id: &str,
        title: &str,
        resource_claims: Vec<String>,
        registered_by: Option<&str>,
        branch_name: Option<&str>,
        merge_priority: i64,
    ) -> Result<Feature> {
        let row = self
            .gateway
            .rpc(
                "register_feature",
                json!({
                    "feature_id": feature_id,
                    "title": title,
                    "resource_claims": resource_claims,
                    "registered_by": registered_by,
                    "branch_name": branch_name,
                    "merge_priority": merge_priority,
                }),
            )
            .await?;
        Ok(Feature::from_row(&row))
    }

    async fn active_features(&self, exclude: Option<&str>) -> Result<Vec<Feature>> {
        let rows = self
            .gateway
            .query("feature_registry", &Filter::all().eq("status", "active"))
            .await?;
        Ok(rows
            .iter()
            .map(Feature::from_row)
            .filter(|f| exclude.is_none_or(|id| f.feature_id != id))
            .collect())
    }

    /// Analyze `candidate_claims` against every other currently-active
    /// feature (`exclude` is the candidate's own feature id, if already
    /// registered, so it does not conflict with itself).
    pub async fn analyze_conflicts(
        &self,
        candidate_claims: &[String],
        exclude: Option<&str>,
    ) -> Result<ConflictAnalysis> {
        let others = self.active_features(exclude).await?;
        let mut overlaps_by_feature = BTreeMap::new();
        let mut overlapping_candidate_keys = std::collections::BTreeSet::new();

        for other in &others {
            let overlap: Vec<String> = candidate_claims
                .iter()
                .filter(|k| other.resource_claims.contains(k))
                .cloned()
                .collect();
            if !overlap.is_empty() {
                overlapping_candidate_keys.extend(overlap.iter().cloned());
                overlaps_by_feature.insert(other.feature_id.clone(), overlap);
            }
        }

        let feasibility = if overlapping_candidate_keys.is_empty() {
            Feasibility::Full
        } else {
            let ratio = overlapping_candidate_keys.len() as f64 / candidate_claims.len().max(1) as f64;
            if ratio > SEQUENTIAL_THRESHOLD {
                Feasibility::Sequential
            } else {
                Feasibility::Partial
            }
        };

        Ok(ConflictAnalysis {
            feasibility,
            overlaps_by_feature,
        })
    }

    /// Deregister a feature, terminal status `completed` unless overridden.
    pub async fn deregister(&self, feature_id: &str, status: &str) -> Result<Feature> {
        let row = self
            .gateway
            .rpc("deregister_feature", json!({"feature_id": feature_id, "status": status}))
            .await?;
        Ok(Feature::from_row(&row))
    }

    async fn get(&self, feature_id: &str) -> Result<Feature> {
        let rows = self
            .gateway
            .query("feature_registry", &Filter::all().eq("feature_id", feature_id))
            .await?;
        rows.first()
            .map(Feature::from_row)
            .ok_or_else(|| Error::not_found("feature", feature_id))
    }

    async fn set_metadata(&self, feature_id: &str, metadata: Value) -> Result<()> {
        self.gateway
            .update(
                "feature_registry",
                &Filter::all().eq("feature_id", feature_id),
                json!({"metadata": metadata}),
            )
            .await?;
        Ok(())
    }

    /// Enter the merge queue: stamp `metadata.merge_queue` with
    /// `{status: queued, pr_reference, queued_at}` (§4.5).
    pub async fn enqueue(&self, feature_id: &str, pr_reference: Option<&str>) -> Result<()> {
        let feature = self.get(feature_id).await?;
        let mut metadata = feature.metadata;
        let entry = json!({
            "status": MergeQueueStatus::Queued.to_string(),
            "pr_reference": pr_reference,
            "queued_at": Utc::now().to_rfc3339(),
        });
        if let Value::Object(ref mut map) = metadata {
            map.insert("merge_queue".into(), entry);
        } else {
            metadata = json!({"merge_queue": entry});
        }
        self.set_metadata(feature_id, metadata).await
    }

    /// Active, queued features in `merge_priority` ascending order, ties
    /// broken by registration order (`created_at`).
    pub async fn list_queue(&self) -> Result<Vec<Feature>> {
        let mut features = self.active_features(None).await?;
        features.retain(|f| f.metadata.get("merge_queue").is_some());
        features.sort_by(|a, b| a.merge_priority.cmp(&b.merge_priority));
        Ok(features)
    }

    /// Re-validate a queued feature's mergeability: still active, conflicts
    /// have not re-introduced `SEQUENTIAL` feasibility, and it still carries
    /// queue metadata. Flips the queue status to `ready`/`blocked` and
    /// records the check time.
    pub async fn precheck(&self, feature_id: &str) -> Result<MergeQueueStatus> {
        let feature = self.get(feature_id).await?;
        if feature.status != "active" {
            return Err(Error::PreconditionFailed {
                detail: format!("feature {feature_id} is not active"),
            });
        }
        let Some(mut queue_entry) = feature.metadata.get("merge_queue").cloned() else {
            return Err(Error::PreconditionFailed {
                detail: format!("feature {feature_id} is not queued"),
            });
        };

        let analysis = self
            .analyze_conflicts(&feature.resource_claims, Some(feature_id))
            .await?;
        let new_status = if analysis.feasibility == Feasibility::Sequential {
            MergeQueueStatus::Blocked
        } else {
            MergeQueueStatus::Ready
        };

        if let Value::Object(ref mut map) = queue_entry {
            map.insert("status".into(), json!(new_status.to_string()));
            map.insert("checked_at".into(), json!(Utc::now().to_rfc3339()));
        }
        let mut metadata = feature.metadata;
        if let Value::Object(ref mut map) = metadata {
            map.insert("merge_queue".into(), queue_entry);
        }
        self.set_metadata(feature_id, metadata).await?;
        Ok(new_status)
    }

    /// Remove a feature from the merge queue without deregistering it — the
    /// feature stays active, just no longer queued (§4.5.1).
    pub async fn remove_from_queue(&self, feature_id: &str) -> Result<()> {
        let feature = self.get(feature_id).await?;
        let mut metadata = feature.metadata;
        if let Value::Object(ref mut map) = metadata {
            map.remove("merge_queue");
        }
        self.set_metadata(feature_id, metadata).await
    }

    /// Mark a feature merged: deregister atomically with status
    /// `completed`.
    pub async fn mark_merged(&self, feature_id: &str) -> Result<Feature> {
        self.deregister(feature_id, "completed").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sqlite::SqliteGateway;

    async fn registry() -> FeatureRegistry {
        FeatureRegistry::new(Arc::new(SqliteGateway::connect("sqlite::memory:").await.unwrap()))
    }

    #[tokio::test]
    async fn scenario_c_feasibility_levels() {
        let reg = registry().await;
        reg.register("F1", "one", vec!["a".into(), "b".into()], None, None, 5)
            .await
            .unwrap();
        reg.register(
            "F2",
            "two",
            vec!["b".into(), "c".into(), "d".into(), "e".into(), "f".into()],
            None,
            None,
            5,
        )
        .await
        .unwrap();

        let f2_analysis = reg
            .analyze_conflicts(&["b".into(), "c".into(), "d".into(), "e".into(), "f".into()], Some("F2"))
            .await
            .unwrap();
        assert_eq!(f2_analysis.feasibility, Feasibility::Partial);

        reg.register("F3", "three", vec!["a".into(), "b".into(), "c".into()], None, None, 5)
            .await
            .unwrap();
        let f3_analysis = reg
            .analyze_conflicts(&["a".into(), "b".into(), "c".into()], Some("F3"))
            .await
            .unwrap();
        assert_eq!(f3_analysis.feasibility, Feasibility::Sequential);
    }

    #[tokio::test]
    async fn monotonicity_more_overlap_never_improves_feasibility() {
        let reg = registry().await;
        reg.register("F1", "one", vec!["a".into()], None, None, 5).await.unwrap();
        let before = reg
            .analyze_conflicts(&["a".into(), "b".into(), "c".into(), "d".into()], None)
            .await
            .unwrap();
        assert_eq!(before.feasibility, Feasibility::Partial);

        reg.register("F2", "two", vec!["b".into(), "c".into()], None, None, 5)
            .await
            .unwrap();
        let after = reg
            .analyze_conflicts(&["a".into(), "b".into(), "c".into(), "d".into()], None)
            .await
            .unwrap();
        assert!(after.feasibility >= before.feasibility);
    }

    #[tokio::test]
    async fn merge_queue_lifecycle() {
        let reg = registry().await;
        reg.register("F1", "one", vec!["a".into()], None, None, 5).await.unwrap();
        reg.enqueue("F1", Some("pr-1")).await.unwrap();
        let queue = reg.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);

        let status = reg.precheck("F1").await.unwrap();
        assert_eq!(status, MergeQueueStatus::Ready);

        reg.mark_merged("F1").await.unwrap();
        let queue_after = reg.list_queue().await.unwrap();
        assert!(queue_after.is_empty());
    }
}
