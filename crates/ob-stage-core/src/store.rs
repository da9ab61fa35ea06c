//! Storage and collaborator ports.
//!
//! Reconciliation and action execution operate exclusively through these
//! traits, enabling pluggable backends (`MemoryStore` for tests and dry runs,
//! `PgStageStore` for production).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::codec::encode_progress;
use crate::error::StageError;
use crate::types::{AssigneeKind, OnboardingInstance, StageDefinition, StageProgress, TenantScope};

/// Supplies workflow template stages.
#[async_trait]
pub trait StageTemplates: Send + Sync {
    /// Active, valid stages of a workflow, ascending by order.
    async fn active_stages(&self, workflow_id: i64) -> Result<Vec<StageDefinition>>;

    /// Any stage by id, active or not.
    async fn stage(&self, stage_id: i64) -> Result<Option<StageDefinition>>;
}

/// Persists onboarding instances.
///
/// Every setter is a plain row update with no version check; concurrent
/// writers to the same instance are last-write-wins.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: i64, scope: TenantScope) -> Result<Option<OnboardingInstance>>;

    /// Ids of every instance running the workflow, ascending.
    async fn list_ids_by_workflow(&self, workflow_id: i64) -> Result<Vec<i64>>;

    async fn set_current_stage(&self, id: i64, stage_id: i64, order: i32) -> Result<()>;

    async fn set_status(&self, id: i64, status: &str) -> Result<()>;

    async fn set_custom_fields(&self, id: i64, json: &str) -> Result<()>;

    /// Native structured JSON write of the progress column.
    async fn set_progress_json(&self, id: i64, progress: &Value) -> Result<()>;

    /// Raw-text write of the progress column; fallback when the typed write fails.
    async fn set_progress_raw(&self, id: i64, raw: &str) -> Result<()>;

    async fn set_assignees(
        &self,
        id: i64,
        kind: AssigneeKind,
        view: &[String],
        operate: &[String],
    ) -> Result<()>;
}

/// A configured action that TriggerAction may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub id: i64,
    pub name: String,
    pub is_enabled: bool,
}

#[async_trait]
pub trait ActionDefinitions: Send + Sync {
    async fn definition(&self, id: i64) -> Result<Option<ActionDefinition>>;
}

/// Outbound notification delivery. Only intent is recorded here.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue(
        &self,
        recipient_type: Option<&str>,
        recipient_id: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<()>;
}

/// Sink that accepts and discards every notification.
pub struct NoopNotifications;

#[async_trait]
impl NotificationSink for NoopNotifications {
    async fn enqueue(
        &self,
        _recipient_type: Option<&str>,
        _recipient_id: Option<&str>,
        _template_id: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Write a progress list: typed JSON first, then one raw-text retry.
pub async fn persist_progress(
    store: &dyn InstanceStore,
    onboarding_id: i64,
    progress: &[StageProgress],
) -> Result<(), StageError> {
    let value = encode_progress(progress);

    let typed_err = match store.set_progress_json(onboarding_id, &value).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    warn!(
        onboarding_id,
        error = %typed_err,
        "Typed progress write failed, retrying with raw write"
    );

    store
        .set_progress_raw(onboarding_id, &value.to_string())
        .await
        .map_err(|raw_err| StageError::Persistence {
            onboarding_id,
            typed: typed_err.to_string(),
            raw: raw_err.to_string(),
        })
}
