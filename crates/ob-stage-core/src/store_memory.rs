//! In-memory implementation of every port.
//!
//! Progress and custom fields are held as raw column text, exactly as a
//! database row would hold them, and decoded through the codec on read. That
//! lets tests seed legacy or corrupt rows.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::codec::{decode_custom_fields, decode_progress, encode_custom_fields, encode_progress};
use crate::store::{
    ActionDefinition, ActionDefinitions, InstanceStore, NotificationSink, StageTemplates,
};
use crate::types::{ordered_active, AssigneeKind, OnboardingInstance, StageDefinition, TenantScope};

/// One notification accepted by the memory sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedNotification {
    pub recipient_type: Option<String>,
    pub recipient_id: Option<String>,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Row {
    instance: OnboardingInstance,
    progress_raw: Option<String>,
    custom_fields_raw: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    stages: RwLock<BTreeMap<i64, StageDefinition>>,
    rows: RwLock<BTreeMap<i64, Row>>,
    action_definitions: RwLock<HashMap<i64, ActionDefinition>>,
    notifications: RwLock<Vec<QueuedNotification>>,

    fail_typed_progress: AtomicBool,
    fail_raw_progress: AtomicBool,
    poisoned: RwLock<HashSet<i64>>,
    typed_progress_writes: AtomicU64,
    raw_progress_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ──

    pub fn put_stage(&self, stage: StageDefinition) {
        write(&self.stages).insert(stage.id, stage);
    }

    pub fn remove_stage(&self, stage_id: i64) {
        write(&self.stages).remove(&stage_id);
    }

    /// Store an instance; its progress and custom fields are encoded as a
    /// database would hold them.
    pub fn put_instance(&self, instance: OnboardingInstance) {
        let progress_raw = Some(encode_progress(&instance.progress).to_string());
        let custom_fields_raw = Some(encode_custom_fields(&instance.custom_fields));
        write(&self.rows).insert(
            instance.id,
            Row {
                instance,
                progress_raw,
                custom_fields_raw,
            },
        );
    }

    /// Overwrite the raw progress column text of an existing instance.
    pub fn put_raw_progress(&self, id: i64, raw: impl Into<String>) {
        if let Some(row) = write(&self.rows).get_mut(&id) {
            row.progress_raw = Some(raw.into());
        }
    }

    pub fn raw_progress(&self, id: i64) -> Option<String> {
        read(&self.rows).get(&id).and_then(|r| r.progress_raw.clone())
    }

    pub fn put_action_definition(&self, definition: ActionDefinition) {
        write(&self.action_definitions).insert(definition.id, definition);
    }

    pub fn notifications(&self) -> Vec<QueuedNotification> {
        read(&self.notifications).clone()
    }

    // ── Fault injection ──

    pub fn fail_typed_progress_writes(&self, fail: bool) {
        self.fail_typed_progress.store(fail, Ordering::SeqCst);
    }

    pub fn fail_raw_progress_writes(&self, fail: bool) {
        self.fail_raw_progress.store(fail, Ordering::SeqCst);
    }

    /// Make every read of this instance fail.
    pub fn poison_instance(&self, id: i64) {
        write(&self.poisoned).insert(id);
    }

    pub fn typed_progress_writes(&self) -> u64 {
        self.typed_progress_writes.load(Ordering::SeqCst)
    }

    pub fn raw_progress_writes(&self) -> u64 {
        self.raw_progress_writes.load(Ordering::SeqCst)
    }

    fn update_row(&self, id: i64, f: impl FnOnce(&mut Row)) -> Result<()> {
        let mut rows = write(&self.rows);
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("onboarding {} does not exist", id))?;
        f(row);
        Ok(())
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StageTemplates for MemoryStore {
    async fn active_stages(&self, workflow_id: i64) -> Result<Vec<StageDefinition>> {
        let stages = read(&self.stages);
        Ok(ordered_active(
            stages
                .values()
                .filter(|s| s.workflow_id == workflow_id)
                .cloned(),
        ))
    }

    async fn stage(&self, stage_id: i64) -> Result<Option<StageDefinition>> {
        Ok(read(&self.stages).get(&stage_id).cloned())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, id: i64, scope: TenantScope) -> Result<Option<OnboardingInstance>> {
        if read(&self.poisoned).contains(&id) {
            bail!("onboarding {} row could not be read", id);
        }

        let rows = read(&self.rows);
        let Some(row) = rows.get(&id) else {
            return Ok(None);
        };
        if !scope.admits(&row.instance.tenant_id) {
            return Ok(None);
        }

        let mut instance = row.instance.clone();
        instance.progress = decode_progress(row.progress_raw.as_deref());
        instance.custom_fields = decode_custom_fields(row.custom_fields_raw.as_deref());
        Ok(Some(instance))
    }

    async fn list_ids_by_workflow(&self, workflow_id: i64) -> Result<Vec<i64>> {
        Ok(read(&self.rows)
            .values()
            .filter(|r| r.instance.workflow_id == workflow_id)
            .map(|r| r.instance.id)
            .collect())
    }

    async fn set_current_stage(&self, id: i64, stage_id: i64, order: i32) -> Result<()> {
        self.update_row(id, |row| {
            row.instance.current_stage_id = Some(stage_id);
            row.instance.current_stage_order = Some(order);
        })
    }

    async fn set_status(&self, id: i64, status: &str) -> Result<()> {
        self.update_row(id, |row| row.instance.status = status.to_string())
    }

    async fn set_custom_fields(&self, id: i64, json: &str) -> Result<()> {
        self.update_row(id, |row| row.custom_fields_raw = Some(json.to_string()))
    }

    async fn set_progress_json(&self, id: i64, progress: &Value) -> Result<()> {
        if self.fail_typed_progress.load(Ordering::SeqCst) {
            bail!("typed JSON write rejected");
        }
        self.update_row(id, |row| row.progress_raw = Some(progress.to_string()))?;
        self.typed_progress_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_progress_raw(&self, id: i64, raw: &str) -> Result<()> {
        if self.fail_raw_progress.load(Ordering::SeqCst) {
            bail!("raw write rejected");
        }
        self.update_row(id, |row| row.progress_raw = Some(raw.to_string()))?;
        self.raw_progress_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_assignees(
        &self,
        id: i64,
        kind: AssigneeKind,
        view: &[String],
        operate: &[String],
    ) -> Result<()> {
        self.update_row(id, |row| match kind {
            AssigneeKind::User => {
                row.instance.view_users = view.to_vec();
                row.instance.operate_users = operate.to_vec();
            }
            AssigneeKind::Team => {
                row.instance.view_teams = view.to_vec();
                row.instance.operate_teams = operate.to_vec();
            }
        })
    }
}

#[async_trait]
impl ActionDefinitions for MemoryStore {
    async fn definition(&self, id: i64) -> Result<Option<ActionDefinition>> {
        Ok(read(&self.action_definitions).get(&id).cloned())
    }
}

#[async_trait]
impl NotificationSink for MemoryStore {
    async fn enqueue(
        &self,
        recipient_type: Option<&str>,
        recipient_id: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<()> {
        write(&self.notifications).push(QueuedNotification {
            recipient_type: recipient_type.map(str::to_string),
            recipient_id: recipient_id.map(str::to_string),
            template_id: template_id.map(str::to_string),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::store::persist_progress;
    use crate::types::{StageProgress, StageStatus};

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let stage = StageDefinition::new(10, 1, "Intake", 1);
        store.put_stage(stage.clone());
        store.put_instance(OnboardingInstance::new(100, "acme", 1).at_stage(&stage));
        store
    }

    #[tokio::test]
    async fn test_tenant_filter() {
        let store = seeded();
        assert!(store
            .get(100, TenantScope::Tenant("acme".into()))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get(100, TenantScope::Tenant("globex".into()))
            .await
            .unwrap()
            .is_none());
        assert!(store.get(100, TenantScope::Bypass).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persist_progress_uses_typed_write() {
        let store = seeded();
        let stage = StageDefinition::new(10, 1, "Intake", 1);

        persist_progress(&store, 100, &[StageProgress::pending(&stage, 1)])
            .await
            .unwrap();

        assert_eq!(store.typed_progress_writes(), 1);
        assert_eq!(store.raw_progress_writes(), 0);
    }

    #[tokio::test]
    async fn test_persist_progress_falls_back_to_raw_write() {
        let store = seeded();
        store.fail_typed_progress_writes(true);
        let stage = StageDefinition::new(10, 1, "Intake", 1);

        persist_progress(&store, 100, &[StageProgress::skipped(&stage, 1)])
            .await
            .unwrap();

        assert_eq!(store.typed_progress_writes(), 0);
        assert_eq!(store.raw_progress_writes(), 1);

        let instance = store.get(100, TenantScope::Bypass).await.unwrap().unwrap();
        assert_eq!(instance.progress[0].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_persist_progress_surfaces_error_after_fallback() {
        let store = seeded();
        store.fail_typed_progress_writes(true);
        store.fail_raw_progress_writes(true);

        let err = persist_progress(&store, 100, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            StageError::Persistence {
                onboarding_id: 100,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_poisoned_instance_read_fails() {
        let store = seeded();
        store.poison_instance(100);
        assert!(store.get(100, TenantScope::Bypass).await.is_err());
    }
}
