//! Condition Action Executor
//!
//! Runs a condition's action list against one onboarding instance. Actions
//! run in ascending `order`; a failing action is recorded as a failed detail
//! and the sequence carries on.
//!
//! Instance loads bypass the tenant filter: conditions fire from background
//! jobs that have no request context.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::actions::{
    parse_actions, ActionExecutionContext, ActionExecutionDetail, ActionExecutionResult,
    ActionKind, RawAction, DEFAULT_END_STATUS,
};
use crate::codec::encode_custom_fields;
use crate::error::{Result, StageError};
use crate::events::{emit_to, EventPayload, ProgressEvent, SharedEmitter};
use crate::marker::SkippedStageMarker;
use crate::store::{ActionDefinitions, InstanceStore, NotificationSink, StageTemplates};
use crate::types::{
    ordered_active, AssigneeKind, OnboardingInstance, StageDefinition, TenantScope,
};

/// How per-action outcomes combine into the overall result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessPolicy {
    /// Overall success if at least one action succeeded
    #[default]
    #[serde(alias = "any")]
    AnySucceeded,
    /// Overall success only if every action succeeded
    #[serde(alias = "all")]
    AllSucceeded,
}

impl SuccessPolicy {
    pub fn evaluate(&self, details: &[ActionExecutionDetail]) -> bool {
        if details.is_empty() {
            return true;
        }
        match self {
            Self::AnySucceeded => details.iter().any(|d| d.success),
            Self::AllSucceeded => details.iter().all(|d| d.success),
        }
    }
}

impl FromStr for SuccessPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "anysucceeded" | "or" => Ok(Self::AnySucceeded),
            "all" | "allsucceeded" | "and" => Ok(Self::AllSucceeded),
            other => Err(format!("Unknown success policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub success_policy: SuccessPolicy,
}

pub struct ActionExecutor {
    templates: Arc<dyn StageTemplates>,
    instances: Arc<dyn InstanceStore>,
    definitions: Arc<dyn ActionDefinitions>,
    notifications: Arc<dyn NotificationSink>,
    marker: SkippedStageMarker,
    config: ExecutorConfig,
    events: Option<SharedEmitter>,
}

impl ActionExecutor {
    pub fn new(
        templates: Arc<dyn StageTemplates>,
        instances: Arc<dyn InstanceStore>,
        definitions: Arc<dyn ActionDefinitions>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let marker = SkippedStageMarker::new(templates.clone(), instances.clone());
        Self {
            templates,
            instances,
            definitions,
            notifications,
            marker,
            config: ExecutorConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, emitter: SharedEmitter) -> Self {
        self.marker = self.marker.with_events(emitter.clone());
        self.events = Some(emitter);
        self
    }

    /// Execute a condition's action list.
    ///
    /// Absent or empty input is a successful no-op. Malformed input yields a
    /// single `ParseError` detail and touches nothing.
    pub async fn execute(
        &self,
        actions_json: Option<&str>,
        ctx: &ActionExecutionContext,
    ) -> ActionExecutionResult {
        let Some(json) = actions_json.filter(|s| !s.trim().is_empty()) else {
            return ActionExecutionResult {
                success: true,
                details: Vec::new(),
            };
        };

        let mut actions = match parse_actions(json) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(onboarding_id = ctx.onboarding_id, error = %e, "Malformed condition actions");
                return ActionExecutionResult {
                    success: false,
                    details: vec![ActionExecutionDetail::failed("ParseError", 0, e.to_string())],
                };
            }
        };

        // Stable: equal orders keep their list position
        actions.sort_by_key(|a| a.order);

        let mut details = Vec::with_capacity(actions.len());
        for raw in &actions {
            let detail = self.execute_one(raw, ctx).await;
            emit_to(
                self.events.as_ref(),
                self.tag(
                    ProgressEvent::new(EventPayload::ActionExecuted {
                        action_type: detail.action_type.clone(),
                        order: detail.order,
                        success: detail.success,
                        error: detail.error_message.clone(),
                    }),
                    ctx,
                ),
            );
            details.push(detail);
        }

        let success = self.config.success_policy.evaluate(&details);
        info!(
            onboarding_id = ctx.onboarding_id,
            actions = details.len(),
            failed = details.iter().filter(|d| !d.success).count(),
            success,
            "Condition actions executed"
        );

        ActionExecutionResult { success, details }
    }

    async fn execute_one(
        &self,
        raw: &RawAction,
        ctx: &ActionExecutionContext,
    ) -> ActionExecutionDetail {
        let action_type = raw.kind();
        match self.run(raw, ctx).await {
            Ok(data) => {
                debug!(
                    onboarding_id = ctx.onboarding_id,
                    action = action_type.name(),
                    order = raw.order,
                    "Action succeeded"
                );
                ActionExecutionDetail::succeeded(action_type.name(), raw.order, data)
            }
            Err(e) => {
                warn!(
                    onboarding_id = ctx.onboarding_id,
                    action = action_type.name(),
                    order = raw.order,
                    kind = e.kind(),
                    error = %e,
                    "Action failed"
                );
                ActionExecutionDetail::failed(action_type.name(), raw.order, detail_message(&e))
            }
        }
    }

    async fn run(
        &self,
        raw: &RawAction,
        ctx: &ActionExecutionContext,
    ) -> Result<Map<String, Value>> {
        match ActionKind::try_from(raw)? {
            ActionKind::GoToStage { target_stage_id } => {
                self.go_to_stage(ctx, target_stage_id).await
            }
            ActionKind::SkipStage { skip_count } => self.skip_stage(ctx, skip_count).await,
            ActionKind::EndWorkflow { end_status } => self.end_workflow(ctx, &end_status).await,
            ActionKind::SendNotification {
                recipient_type,
                recipient_id,
                template_id,
            } => {
                self.send_notification(ctx, recipient_type, recipient_id, template_id)
                    .await
            }
            ActionKind::UpdateField { field_name, value } => {
                self.update_field(ctx, field_name, value).await
            }
            ActionKind::TriggerAction { action_definition_id } => {
                self.trigger_action(ctx, action_definition_id).await
            }
            ActionKind::AssignUser { kind, ids } => self.assign_user(ctx, kind, &ids).await,
        }
    }

    // ─── Action handlers ──────────────────────────────────────

    async fn go_to_stage(
        &self,
        ctx: &ActionExecutionContext,
        target_stage_id: i64,
    ) -> Result<Map<String, Value>> {
        let target = self
            .templates
            .stage(target_stage_id)
            .await?
            .ok_or_else(|| StageError::not_found("stage", target_stage_id))?;
        if !target.is_usable() {
            return Err(StageError::validation(format!(
                "stage {} is not active",
                target_stage_id
            )));
        }

        let instance = self.load_instance(ctx).await?;
        if target.workflow_id != instance.workflow_id {
            return Err(StageError::validation(format!(
                "stage {} belongs to workflow {}, onboarding {} runs workflow {}",
                target.id, target.workflow_id, instance.id, instance.workflow_id
            )));
        }

        let current_order = self.current_order(&instance).await?;
        let mut skipped = 0;
        if let Some(from) = current_order {
            if target.order > from {
                skipped = self.marker.mark_skipped(&instance, from, target.order).await;
            }
        }

        self.instances
            .set_current_stage(instance.id, target.id, target.order)
            .await?;

        Ok(data(json!({
            "targetStageId": target.id,
            "targetStageOrder": target.order,
            "previousStageOrder": current_order,
            "skippedStages": skipped,
        })))
    }

    async fn skip_stage(
        &self,
        ctx: &ActionExecutionContext,
        skip_count: usize,
    ) -> Result<Map<String, Value>> {
        let instance = self.load_instance(ctx).await?;
        let current = self.current_stage(&instance).await?;

        let stages = ordered_active(self.templates.active_stages(instance.workflow_id).await?);
        let ahead: Vec<&StageDefinition> = stages
            .iter()
            .filter(|s| s.order > current.order)
            .take(skip_count.saturating_add(1))
            .collect();

        let Some(last) = ahead.last() else {
            debug!(onboarding_id = instance.id, skip_count, "No stages ahead, ending workflow");
            let mut out = self.end_workflow(ctx, DEFAULT_END_STATUS).await?;
            out.insert("delegatedTo".into(), json!("EndWorkflow"));
            return Ok(out);
        };

        // Fewer than requested remain: land on the last one
        let target = ahead.get(skip_count).unwrap_or(last);

        let mut out = self.go_to_stage(ctx, target.id).await?;
        out.insert("skipCount".into(), json!(skip_count));
        out.insert("delegatedTo".into(), json!("GoToStage"));
        Ok(out)
    }

    async fn end_workflow(
        &self,
        ctx: &ActionExecutionContext,
        end_status: &str,
    ) -> Result<Map<String, Value>> {
        let instance = self.load_instance(ctx).await?;
        self.instances.set_status(instance.id, end_status).await?;
        Ok(data(json!({ "status": end_status })))
    }

    async fn send_notification(
        &self,
        ctx: &ActionExecutionContext,
        recipient_type: Option<String>,
        recipient_id: Option<String>,
        template_id: Option<String>,
    ) -> Result<Map<String, Value>> {
        if let Err(e) = self
            .notifications
            .enqueue(
                recipient_type.as_deref(),
                recipient_id.as_deref(),
                template_id.as_deref(),
            )
            .await
        {
            warn!(onboarding_id = ctx.onboarding_id, error = %e, "Notification enqueue failed");
        }

        Ok(data(json!({
            "status": "Queued",
            "recipientType": recipient_type,
            "recipientId": recipient_id,
            "templateId": template_id,
        })))
    }

    async fn update_field(
        &self,
        ctx: &ActionExecutionContext,
        field_name: String,
        value: Value,
    ) -> Result<Map<String, Value>> {
        let instance = self.load_instance(ctx).await?;
        let mut fields = instance.custom_fields;
        let previous = fields.insert(field_name.clone(), value.clone());

        self.instances
            .set_custom_fields(instance.id, &encode_custom_fields(&fields))
            .await?;

        Ok(data(json!({
            "fieldName": field_name,
            "newValue": value,
            "previousValue": previous,
        })))
    }

    async fn trigger_action(
        &self,
        ctx: &ActionExecutionContext,
        action_definition_id: i64,
    ) -> Result<Map<String, Value>> {
        let definition = self
            .definitions
            .definition(action_definition_id)
            .await?
            .ok_or_else(|| StageError::not_found("action definition", action_definition_id))?;
        if !definition.is_enabled {
            return Err(StageError::validation(format!(
                "action definition {} is disabled",
                action_definition_id
            )));
        }

        debug!(
            onboarding_id = ctx.onboarding_id,
            action_definition_id,
            name = %definition.name,
            "Action trigger recorded"
        );
        Ok(data(json!({
            "status": "Triggered",
            "actionDefinitionId": definition.id,
            "actionName": definition.name,
        })))
    }

    async fn assign_user(
        &self,
        ctx: &ActionExecutionContext,
        kind: AssigneeKind,
        ids: &[String],
    ) -> Result<Map<String, Value>> {
        let instance = self.load_instance(ctx).await?;
        let (view, operate) = instance.assignees(kind);
        let mut view = view.to_vec();
        let mut operate = operate.to_vec();

        let mut added = 0;
        for id in ids {
            if !view.contains(id) {
                view.push(id.clone());
                added += 1;
            }
            if !operate.contains(id) {
                operate.push(id.clone());
            }
        }

        self.instances
            .set_assignees(instance.id, kind, &view, &operate)
            .await?;

        Ok(data(json!({
            "assigneeType": kind.as_str(),
            "assigneeIds": ids,
            "added": added,
        })))
    }

    // ─── Helpers ──────────────────────────────────────────────

    async fn load_instance(&self, ctx: &ActionExecutionContext) -> Result<OnboardingInstance> {
        self.instances
            .get(ctx.onboarding_id, TenantScope::Bypass)
            .await?
            .ok_or_else(|| StageError::not_found("onboarding", ctx.onboarding_id))
    }

    async fn current_stage(&self, instance: &OnboardingInstance) -> Result<StageDefinition> {
        let stage_id = instance.current_stage_id.ok_or_else(|| {
            StageError::validation(format!("onboarding {} has no current stage", instance.id))
        })?;
        self.templates
            .stage(stage_id)
            .await?
            .ok_or_else(|| StageError::not_found("stage", stage_id))
    }

    /// Template order of the current stage, falling back to the stored order.
    async fn current_order(&self, instance: &OnboardingInstance) -> Result<Option<i32>> {
        if let Some(stage_id) = instance.current_stage_id {
            if let Some(stage) = self.templates.stage(stage_id).await? {
                return Ok(Some(stage.order));
            }
        }
        Ok(instance.current_stage_order)
    }

    fn tag(&self, event: ProgressEvent, ctx: &ActionExecutionContext) -> ProgressEvent {
        let event = event.for_onboarding(ctx.onboarding_id);
        match &ctx.tenant_id {
            Some(tenant) => event.for_tenant(tenant.clone()),
            None => event,
        }
    }
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn detail_message(e: &StageError) -> String {
    match e {
        StageError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}
