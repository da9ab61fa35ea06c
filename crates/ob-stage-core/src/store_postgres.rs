//! Postgres implementation of the ports.
//!
//! Tables live in the `"onboarding"` schema (see `migrations/`). Progress
//! and custom fields are selected as text and decoded through the codec, so
//! legacy double-encoded rows read the same way they do in memory.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::codec::{decode_custom_fields, decode_progress};
use crate::store::{
    ActionDefinition, ActionDefinitions, InstanceStore, NotificationSink, StageTemplates,
};
use crate::types::{AssigneeKind, OnboardingInstance, StageDefinition, TenantScope};

#[derive(Debug, Clone, FromRow)]
struct StageRow {
    id: i64,
    workflow_id: i64,
    name: String,
    stage_order: i32,
    is_active: bool,
    is_valid: bool,
}

impl From<StageRow> for StageDefinition {
    fn from(row: StageRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            name: row.name,
            order: row.stage_order,
            is_active: row.is_active,
            is_valid: row.is_valid,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct OnboardingRow {
    id: i64,
    tenant_id: String,
    workflow_id: i64,
    current_stage_id: Option<i64>,
    current_stage_order: Option<i32>,
    status: String,
    stages_progress: Option<String>,
    custom_fields: Option<String>,
    view_users: Vec<String>,
    operate_users: Vec<String>,
    view_teams: Vec<String>,
    operate_teams: Vec<String>,
}

impl From<OnboardingRow> for OnboardingInstance {
    fn from(row: OnboardingRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow_id: row.workflow_id,
            current_stage_id: row.current_stage_id,
            current_stage_order: row.current_stage_order,
            status: row.status,
            progress: decode_progress(row.stages_progress.as_deref()),
            custom_fields: decode_custom_fields(row.custom_fields.as_deref()),
            view_users: row.view_users,
            operate_users: row.operate_users,
            view_teams: row.view_teams,
            operate_teams: row.operate_teams,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ActionDefinitionRow {
    id: i64,
    name: String,
    is_enabled: bool,
}

/// Store backed by a Postgres pool.
#[derive(Clone, Debug)]
pub struct PgStageStore {
    pool: PgPool,
}

impl PgStageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Updates are keyed on the onboarding id; zero rows means it is gone.
fn expect_updated(rows_affected: u64, id: i64) -> Result<()> {
    if rows_affected == 0 {
        bail!("onboarding {} does not exist", id);
    }
    Ok(())
}

/// Quote text as a SQL string literal, doubling embedded quotes.
fn sql_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

#[async_trait]
impl StageTemplates for PgStageStore {
    async fn active_stages(&self, workflow_id: i64) -> Result<Vec<StageDefinition>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, workflow_id, name, stage_order, is_active, is_valid
            FROM "onboarding".workflow_stages
            WHERE workflow_id = $1 AND is_active AND is_valid
            ORDER BY stage_order, id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load active workflow stages")?;

        Ok(rows.into_iter().map(StageDefinition::from).collect())
    }

    async fn stage(&self, stage_id: i64) -> Result<Option<StageDefinition>> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, workflow_id, name, stage_order, is_active, is_valid
            FROM "onboarding".workflow_stages
            WHERE id = $1
            "#,
        )
        .bind(stage_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load workflow stage")?;

        Ok(row.map(StageDefinition::from))
    }
}

#[async_trait]
impl InstanceStore for PgStageStore {
    async fn get(&self, id: i64, scope: TenantScope) -> Result<Option<OnboardingInstance>> {
        let tenant = match scope {
            TenantScope::Tenant(t) => Some(t),
            TenantScope::Bypass => None,
        };

        let row = sqlx::query_as::<_, OnboardingRow>(
            r#"
            SELECT id, tenant_id, workflow_id, current_stage_id, current_stage_order, status,
                   stages_progress::text AS stages_progress,
                   custom_fields::text AS custom_fields,
                   COALESCE(view_users, '{}') AS view_users,
                   COALESCE(operate_users, '{}') AS operate_users,
                   COALESCE(view_teams, '{}') AS view_teams,
                   COALESCE(operate_teams, '{}') AS operate_teams
            FROM "onboarding".onboardings
            WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2)
            "#,
        )
        .bind(id)
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load onboarding {}", id))?;

        Ok(row.map(OnboardingInstance::from))
    }

    async fn list_ids_by_workflow(&self, workflow_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM "onboarding".onboardings
            WHERE workflow_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list onboardings for workflow")?;

        Ok(ids)
    }

    async fn set_current_stage(&self, id: i64, stage_id: i64, order: i32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE "onboarding".onboardings
            SET current_stage_id = $2, current_stage_order = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(stage_id)
        .bind(order)
        .execute(&self.pool)
        .await
        .context("Failed to set current stage")?;
        expect_updated(result.rows_affected(), id)
    }

    async fn set_status(&self, id: i64, status: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE "onboarding".onboardings
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("Failed to set onboarding status")?;
        expect_updated(result.rows_affected(), id)
    }

    async fn set_custom_fields(&self, id: i64, json: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE "onboarding".onboardings
            SET custom_fields = $2::jsonb, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(json)
        .execute(&self.pool)
        .await
        .context("Failed to set custom fields")?;
        expect_updated(result.rows_affected(), id)
    }

    async fn set_progress_json(&self, id: i64, progress: &Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE "onboarding".onboardings
            SET stages_progress = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(sqlx::types::Json(progress))
        .execute(&self.pool)
        .await
        .context("Typed progress write failed")?;
        expect_updated(result.rows_affected(), id)
    }

    async fn set_progress_raw(&self, id: i64, raw: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE "onboarding".onboardings
            SET stages_progress = {}::jsonb, updated_at = NOW()
            WHERE id = $1
            "#,
            sql_literal(raw)
        );
        debug!(onboarding_id = id, bytes = raw.len(), "Raw progress write");

        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Raw progress write failed")?;
        expect_updated(result.rows_affected(), id)
    }

    async fn set_assignees(
        &self,
        id: i64,
        kind: AssigneeKind,
        view: &[String],
        operate: &[String],
    ) -> Result<()> {
        let sql = match kind {
            AssigneeKind::User => {
                r#"UPDATE "onboarding".onboardings
                   SET view_users = $2, operate_users = $3, updated_at = NOW()
                   WHERE id = $1"#
            }
            AssigneeKind::Team => {
                r#"UPDATE "onboarding".onboardings
                   SET view_teams = $2, operate_teams = $3, updated_at = NOW()
                   WHERE id = $1"#
            }
        };

        let result = sqlx::query(sql)
            .bind(id)
            .bind(view)
            .bind(operate)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to set {} assignees", kind.as_str()))?;
        expect_updated(result.rows_affected(), id)
    }
}

#[async_trait]
impl ActionDefinitions for PgStageStore {
    async fn definition(&self, id: i64) -> Result<Option<ActionDefinition>> {
        let row = sqlx::query_as::<_, ActionDefinitionRow>(
            r#"
            SELECT id, name, is_enabled
            FROM "onboarding".action_definitions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load action definition")?;

        Ok(row.map(|r| ActionDefinition {
            id: r.id,
            name: r.name,
            is_enabled: r.is_enabled,
        }))
    }
}

#[async_trait]
impl NotificationSink for PgStageStore {
    async fn enqueue(
        &self,
        recipient_type: Option<&str>,
        recipient_id: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO "onboarding".notification_intents
                (recipient_type, recipient_id, template_id, status, created_at)
            VALUES ($1, $2, $3, 'Queued', NOW())
            "#,
        )
        .bind(recipient_type)
        .bind(recipient_id)
        .bind(template_id)
        .execute(&self.pool)
        .await
        .context("Failed to queue notification")?;
        Ok(())
    }
}
