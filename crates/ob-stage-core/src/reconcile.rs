//! Stage Progress Reconciler
//!
//! Keeps each instance's progress list aligned with a mutable stage template
//! (insert, delete, reorder, merge) without losing completion history.
//!
//! The core algorithm is pure: `reconcile_progress` takes the persisted list
//! and the ordered template and returns the new list. `ProgressReconciler`
//! wraps it with loading, persistence and the topology-edit entry points.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StageError};
use crate::events::{emit_to, EventPayload, ProgressEvent, SharedEmitter};
use crate::store::{persist_progress, InstanceStore, StageTemplates};
use crate::types::{ordered_active, OnboardingInstance, StageDefinition, StageProgress, TenantScope};

// ─── Pure algorithm ───────────────────────────────────────────

/// Drop entries with a non-positive stage id and keep only the first entry
/// seen for each stage id.
pub fn sanitize_progress(progress: Vec<StageProgress>) -> Vec<StageProgress> {
    let mut seen = HashSet::new();
    progress
        .into_iter()
        .filter(|p| p.stage_id > 0 && seen.insert(p.stage_id))
        .collect()
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub progress: Vec<StageProgress>,
    /// Entries created for stages the instance had never seen
    pub created: usize,
    /// Sanitized entries dropped because their stage left the template
    pub removed: usize,
}

/// Recompute a progress list against the ordered, active template.
///
/// Existing entries are kept as-is apart from `stage_order`, which becomes
/// the stage's 1-based template position. Stages without an entry get a
/// fresh Pending one. Idempotent for an unchanged template.
pub fn reconcile_progress(progress: Vec<StageProgress>, stages: &[StageDefinition]) -> Reconciled {
    let mut existing = sanitize_progress(progress);
    let template_ids: HashSet<i64> = stages.iter().map(|s| s.id).collect();
    let removed = existing
        .iter()
        .filter(|p| !template_ids.contains(&p.stage_id))
        .count();

    let mut created = 0;
    let mut out = Vec::with_capacity(stages.len());
    for (index, stage) in stages.iter().enumerate() {
        let position = index as i32 + 1;
        let entry = match existing.iter().position(|p| p.stage_id == stage.id) {
            Some(at) => {
                let mut entry = existing.swap_remove(at);
                entry.stage_order = position;
                entry
            }
            None => {
                created += 1;
                StageProgress::pending(stage, position)
            }
        };
        out.push(entry);
    }

    Reconciled {
        progress: out,
        created,
        removed,
    }
}

// ─── Service ──────────────────────────────────────────────────

/// Outcome of syncing one instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSync {
    pub onboarding_id: i64,
    pub entries: usize,
    pub created: usize,
    pub removed: usize,
    /// `current_stage_order` was rewritten to match the template
    pub current_stage_realigned: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFailure {
    pub onboarding_id: i64,
    pub error: String,
}

/// Outcome of a workflow-wide sync.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub workflow_id: i64,
    pub synced: usize,
    pub failed: usize,
    pub failures: Vec<InstanceFailure>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// `Err(PartialBatch)` when any instance failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(StageError::PartialBatch {
                workflow_id: self.workflow_id,
                synced: self.synced,
                failed: self.failed,
            })
        }
    }
}

pub struct ProgressReconciler {
    templates: Arc<dyn StageTemplates>,
    instances: Arc<dyn InstanceStore>,
    events: Option<SharedEmitter>,
}

impl ProgressReconciler {
    pub fn new(templates: Arc<dyn StageTemplates>, instances: Arc<dyn InstanceStore>) -> Self {
        Self {
            templates,
            instances,
            events: None,
        }
    }

    pub fn with_events(mut self, emitter: SharedEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    /// Reconcile one instance against its workflow's current template.
    ///
    /// A missing instance is an error; everything else about the persisted
    /// progress is tolerated.
    pub async fn sync_instance(&self, onboarding_id: i64) -> Result<InstanceSync> {
        let instance = self
            .instances
            .get(onboarding_id, TenantScope::Bypass)
            .await?
            .ok_or_else(|| StageError::not_found("onboarding", onboarding_id))?;
        let stages = self.load_template(instance.workflow_id).await?;
        self.sync_loaded(instance, &stages, &[]).await
    }

    /// After a stage was created, updated or reordered.
    pub async fn on_stages_changed(&self, workflow_id: i64) -> Result<SyncReport> {
        self.sync_workflow(workflow_id).await
    }

    /// After a stage was deleted. Entries for it are dropped even if the
    /// template provider still reports the stage.
    pub async fn on_stage_deleted(&self, workflow_id: i64, stage_id: i64) -> Result<SyncReport> {
        info!(workflow_id, stage_id, "Reconciling after stage delete");
        self.sync_workflow_excluding(workflow_id, &[stage_id]).await
    }

    /// After merging `source_ids` into `new_stage_id`.
    ///
    /// Source entries are dropped and the merged stage starts Pending; the
    /// sources' completion state is not carried over.
    pub async fn on_stages_merged(
        &self,
        workflow_id: i64,
        source_ids: &[i64],
        new_stage_id: i64,
    ) -> Result<SyncReport> {
        info!(
            workflow_id,
            ?source_ids,
            new_stage_id,
            "Reconciling after stage merge"
        );
        let exclude: Vec<i64> = source_ids
            .iter()
            .copied()
            .filter(|id| *id != new_stage_id)
            .collect();
        self.sync_workflow_excluding(workflow_id, &exclude).await
    }

    /// Reconcile every instance of a workflow, one at a time.
    ///
    /// Failing instances are logged and counted; they never abort the batch.
    /// Only a failure to load the template itself is returned as an error.
    pub async fn sync_workflow(&self, workflow_id: i64) -> Result<SyncReport> {
        self.sync_workflow_excluding(workflow_id, &[]).await
    }

    async fn sync_workflow_excluding(
        &self,
        workflow_id: i64,
        exclude: &[i64],
    ) -> Result<SyncReport> {
        let stages = self.load_template(workflow_id).await?;
        let ids = self.instances.list_ids_by_workflow(workflow_id).await?;

        let mut report = SyncReport {
            workflow_id,
            ..Default::default()
        };

        for onboarding_id in ids {
            match self.sync_one(onboarding_id, &stages, exclude).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    error!(workflow_id, onboarding_id, error = %e, "Instance sync failed");
                    report.failed += 1;
                    report.failures.push(InstanceFailure {
                        onboarding_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            workflow_id,
            synced = report.synced,
            failed = report.failed,
            "Workflow progress sync finished"
        );
        emit_to(
            self.events.as_ref(),
            ProgressEvent::new(EventPayload::WorkflowSynced {
                workflow_id,
                synced: report.synced,
                failed: report.failed,
            }),
        );

        Ok(report)
    }

    async fn sync_one(
        &self,
        onboarding_id: i64,
        stages: &[StageDefinition],
        exclude: &[i64],
    ) -> Result<InstanceSync> {
        let instance = self
            .instances
            .get(onboarding_id, TenantScope::Bypass)
            .await?
            .ok_or_else(|| StageError::not_found("onboarding", onboarding_id))?;
        self.sync_loaded(instance, stages, exclude).await
    }

    async fn sync_loaded(
        &self,
        instance: OnboardingInstance,
        stages: &[StageDefinition],
        exclude: &[i64],
    ) -> Result<InstanceSync> {
        let onboarding_id = instance.id;
        let prior: Vec<StageProgress> = instance
            .progress
            .into_iter()
            .filter(|p| !exclude.contains(&p.stage_id))
            .collect();

        let reconciled = reconcile_progress(prior, stages);
        persist_progress(self.instances.as_ref(), onboarding_id, &reconciled.progress).await?;

        let mut realigned = false;
        if let Some(current_id) = instance.current_stage_id {
            match stages.iter().find(|s| s.id == current_id) {
                Some(current) if instance.current_stage_order != Some(current.order) => {
                    self.instances
                        .set_current_stage(onboarding_id, current.id, current.order)
                        .await?;
                    realigned = true;
                }
                Some(_) => {}
                None => warn!(
                    onboarding_id,
                    current_stage_id = current_id,
                    "Current stage is no longer in the template"
                ),
            }
        }

        debug!(
            onboarding_id,
            entries = reconciled.progress.len(),
            created = reconciled.created,
            removed = reconciled.removed,
            "Progress reconciled"
        );
        emit_to(
            self.events.as_ref(),
            ProgressEvent::new(EventPayload::ProgressReconciled {
                workflow_id: instance.workflow_id,
                entries: reconciled.progress.len(),
                created: reconciled.created,
                removed: reconciled.removed,
            })
            .for_onboarding(onboarding_id)
            .for_tenant(instance.tenant_id.clone()),
        );

        Ok(InstanceSync {
            onboarding_id,
            entries: reconciled.progress.len(),
            created: reconciled.created,
            removed: reconciled.removed,
            current_stage_realigned: realigned,
        })
    }

    async fn load_template(&self, workflow_id: i64) -> Result<Vec<StageDefinition>> {
        Ok(ordered_active(self.templates.active_stages(workflow_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventEmitter;
    use crate::store_memory::MemoryStore;
    use crate::types::StageStatus;

    fn stage(id: i64, order: i32) -> StageDefinition {
        StageDefinition::new(id, 1, format!("Stage {}", id), order)
    }

    fn entry(stage_id: i64, status: StageStatus, completed: bool) -> StageProgress {
        let mut e = StageProgress::pending(&stage(stage_id, 0), 0);
        e.status = status;
        e.is_completed = completed;
        e
    }

    #[test]
    fn test_sanitize_drops_invalid_ids_and_later_duplicates() {
        let progress = vec![
            entry(0, StageStatus::Pending, false),
            entry(5, StageStatus::Completed, true),
            entry(-3, StageStatus::Pending, false),
            entry(5, StageStatus::Pending, false),
            entry(6, StageStatus::InProgress, false),
        ];
        let clean = sanitize_progress(progress);
        assert_eq!(clean.len(), 2);
        assert_eq!(clean[0].stage_id, 5);
        assert_eq!(clean[0].status, StageStatus::Completed);
        assert_eq!(clean[1].stage_id, 6);
    }

    #[test]
    fn test_reconcile_creates_missing_and_renumbers() {
        let stages = vec![stage(10, 5), stage(20, 7), stage(30, 9)];
        let prior = vec![entry(20, StageStatus::Completed, true)];

        let out = reconcile_progress(prior, &stages);
        assert_eq!(out.created, 2);
        assert_eq!(out.removed, 0);

        let ids: Vec<i64> = out.progress.iter().map(|p| p.stage_id).collect();
        let orders: Vec<i32> = out.progress.iter().map(|p| p.stage_order).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(out.progress[1].is_completed);
        assert_eq!(out.progress[0].status, StageStatus::Pending);
        assert!(out.progress[0].start_time.is_none());
    }

    #[test]
    fn test_reconcile_drops_removed_stages() {
        let stages = vec![stage(10, 1), stage(30, 2)];
        let prior = vec![
            entry(10, StageStatus::Completed, true),
            entry(20, StageStatus::Completed, true),
            entry(30, StageStatus::Pending, false),
        ];

        let out = reconcile_progress(prior, &stages);
        assert_eq!(out.removed, 1);
        assert!(out.progress.iter().all(|p| p.stage_id != 20));
    }

    #[test]
    fn test_reconcile_follows_reorder() {
        let original = [stage(1, 1), stage(2, 2), stage(3, 3)];
        let prior = reconcile_progress(Vec::new(), &original).progress;
        let reordered = vec![stage(3, 1), stage(1, 2), stage(2, 3)];

        let out = reconcile_progress(prior, &reordered);
        let pairs: Vec<(i64, i32)> = out
            .progress
            .iter()
            .map(|p| (p.stage_id, p.stage_order))
            .collect();
        assert_eq!(pairs, vec![(3, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let stages = vec![stage(1, 1), stage(2, 2)];
        let once = reconcile_progress(vec![entry(2, StageStatus::InProgress, false)], &stages);
        let twice = reconcile_progress(once.progress.clone(), &stages);
        assert_eq!(once.progress, twice.progress);
        assert_eq!(twice.created, 0);
    }

    fn seeded(store: &MemoryStore) {
        for s in [stage(1, 1), stage(2, 2), stage(3, 3)] {
            store.put_stage(s);
        }
        for id in [100, 101, 102] {
            store.put_instance(OnboardingInstance::new(id, "acme", 1).at_stage(&stage(1, 1)));
        }
    }

    #[tokio::test]
    async fn test_sync_instance_recovers_from_corrupt_progress() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        store.put_raw_progress(100, "{{{ not json");

        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        let outcome = reconciler.sync_instance(100).await.unwrap();
        assert_eq!(outcome.entries, 3);
        assert_eq!(outcome.created, 3);

        let instance = store.get(100, TenantScope::Bypass).await.unwrap().unwrap();
        assert_eq!(instance.progress.len(), 3);
    }

    #[tokio::test]
    async fn test_sync_instance_keeps_ai_summary_fields() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        store.put_raw_progress(
            100,
            r#"[{"stageId": 2, "stageName": "Stage 2", "stageOrder": 7, "status": "Completed",
                 "isCompleted": true, "aiSummary": "Documents verified",
                 "aiSummaryData": {"score": 0.87, "flags": ["address"]}},
                {"stageId": 99, "stageName": "Gone", "stageOrder": 8, "status": "Pending"}]"#,
        );

        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        let outcome = reconciler.sync_instance(100).await.unwrap();
        assert_eq!(outcome.removed, 1);

        let persisted: serde_json::Value =
            serde_json::from_str(&store.raw_progress(100).unwrap()).unwrap();
        let entries = persisted.as_array().unwrap();
        assert_eq!(entries.len(), 3);

        let kept = entries.iter().find(|e| e["stageId"] == 2).unwrap();
        assert_eq!(kept["stageOrder"], 2);
        assert_eq!(kept["isCompleted"], true);
        assert_eq!(kept["aiSummary"], "Documents verified");
        assert_eq!(
            kept["aiSummaryData"],
            serde_json::json!({"score": 0.87, "flags": ["address"]})
        );
    }

    #[tokio::test]
    async fn test_sync_instance_missing_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        let err = reconciler.sync_instance(404).await.unwrap_err();
        assert!(matches!(err, StageError::NotFound { id: 404, .. }));
    }

    #[tokio::test]
    async fn test_sync_workflow_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        store.poison_instance(101);

        let (emitter, receiver) = EventEmitter::new(16);
        let reconciler = ProgressReconciler::new(store.clone(), store.clone())
            .with_events(Arc::new(emitter));
        let report = reconciler.sync_workflow(1).await.unwrap();

        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].onboarding_id, 101);
        assert!(matches!(
            report.clone().into_result(),
            Err(StageError::PartialBatch { failed: 1, .. })
        ));

        let events = receiver.try_recv_batch(16);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last().unwrap().payload,
            EventPayload::WorkflowSynced { synced: 2, failed: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_stage_delete_drops_entry_even_if_still_listed() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        let mut instance = OnboardingInstance::new(100, "acme", 1).at_stage(&stage(3, 3));
        instance.progress = vec![
            entry(1, StageStatus::Completed, true),
            entry(2, StageStatus::Completed, true),
        ];
        store.put_instance(instance);

        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        let report = reconciler.on_stage_deleted(1, 2).await.unwrap();
        assert!(report.is_complete());

        // Provider still lists stage 2, so it comes back as a fresh entry
        let instance = store.get(100, TenantScope::Bypass).await.unwrap().unwrap();
        assert_eq!(instance.progress.len(), 3);
        assert_eq!(instance.progress_for(2).unwrap().status, StageStatus::Pending);
        assert!(!instance.progress_for(2).unwrap().is_completed);
        assert!(instance.progress_for(1).unwrap().is_completed);
    }

    #[tokio::test]
    async fn test_merge_starts_new_stage_pending() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        let mut done = OnboardingInstance::new(100, "acme", 1).at_stage(&stage(3, 3));
        done.progress = vec![
            entry(1, StageStatus::Completed, true),
            entry(2, StageStatus::Completed, true),
            entry(3, StageStatus::InProgress, false),
        ];
        store.put_instance(done);

        // Stages 1 and 2 merge into 9
        store.remove_stage(1);
        store.remove_stage(2);
        store.put_stage(stage(9, 1));

        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        reconciler.on_stages_merged(1, &[1, 2], 9).await.unwrap();

        let instance = store.get(100, TenantScope::Bypass).await.unwrap().unwrap();
        let ids: Vec<i64> = instance.progress.iter().map(|p| p.stage_id).collect();
        assert_eq!(ids, vec![9, 3]);
        assert_eq!(instance.progress[0].status, StageStatus::Pending);
        assert!(!instance.progress[0].is_completed);
    }

    #[tokio::test]
    async fn test_reorder_realigns_current_stage_order() {
        let store = Arc::new(MemoryStore::new());
        seeded(&store);
        store.put_stage(stage(1, 4));

        let reconciler = ProgressReconciler::new(store.clone(), store.clone());
        let outcome = reconciler.sync_instance(100).await.unwrap();
        assert!(outcome.current_stage_realigned);

        let instance = store.get(100, TenantScope::Bypass).await.unwrap().unwrap();
        assert_eq!(instance.current_stage_order, Some(4));
        assert_eq!(instance.progress_for(1).unwrap().stage_order, 3);
    }
}
