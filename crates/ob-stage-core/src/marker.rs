//! Skipped-Stage Marker
//!
//! Marks the stages an instance jumps over as Skipped. A soft-fail
//! collaborator: a marking failure is logged and never rolls back the jump
//! that triggered it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{emit_to, EventPayload, ProgressEvent, SharedEmitter};
use crate::store::{persist_progress, InstanceStore, StageTemplates};
use crate::types::{ordered_active, OnboardingInstance, StageProgress};

pub struct SkippedStageMarker {
    templates: Arc<dyn StageTemplates>,
    instances: Arc<dyn InstanceStore>,
    events: Option<SharedEmitter>,
}

impl SkippedStageMarker {
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

    /// Mark every template stage with `from_order < order < to_order` as
    /// Skipped and persist. Returns the number of stages marked; 0 on error.
    pub async fn mark_skipped(
        &self,
        instance: &OnboardingInstance,
        from_order: i32,
        to_order: i32,
    ) -> usize {
        match self.try_mark_skipped(instance, from_order, to_order).await {
            Ok(marked) => marked,
            Err(e) => {
                warn!(
                    onboarding_id = instance.id,
                    from_order,
                    to_order,
                    error = %e,
                    "Failed to mark skipped stages"
                );
                0
            }
        }
    }

    pub async fn try_mark_skipped(
        &self,
        instance: &OnboardingInstance,
        from_order: i32,
        to_order: i32,
    ) -> Result<usize> {
        let stages = ordered_active(self.templates.active_stages(instance.workflow_id).await?);

        let mut progress = instance.progress.clone();
        let mut skipped_ids = Vec::new();

        for (index, stage) in stages.iter().enumerate() {
            if stage.order <= from_order || stage.order >= to_order {
                continue;
            }
            match progress.iter_mut().find(|p| p.stage_id == stage.id) {
                Some(entry) => entry.mark_skipped(),
                None => progress.push(StageProgress::skipped(stage, index as i32 + 1)),
            }
            skipped_ids.push(stage.id);
        }

        if skipped_ids.is_empty() {
            return Ok(0);
        }

        persist_progress(self.instances.as_ref(), instance.id, &progress).await?;

        debug!(
            onboarding_id = instance.id,
            from_order,
            to_order,
            marked = skipped_ids.len(),
            "Stages marked skipped"
        );

        let marked = skipped_ids.len();
        emit_to(
            self.events.as_ref(),
            ProgressEvent::new(EventPayload::StagesSkipped {
                from_order,
                to_order,
                stage_ids: skipped_ids,
            })
            .for_onboarding(instance.id)
            .for_tenant(instance.tenant_id.clone()),
        );

        Ok(marked)
    }
}
