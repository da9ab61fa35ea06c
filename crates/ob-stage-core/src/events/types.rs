//! Audit event types.
//!
//! Cheap to build on the mutation path; serialization happens in the drain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub onboarding_id: Option<i64>,
    pub payload: EventPayload,
}

/// Tagged enum for clean JSON serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// One instance's progress list was recomputed and written.
    ProgressReconciled {
        workflow_id: i64,
        entries: usize,
        created: usize,
        removed: usize,
    },

    /// Stages bypassed by a jump were marked Skipped.
    StagesSkipped {
        from_order: i32,
        to_order: i32,
        stage_ids: Vec<i64>,
    },

    /// One condition action ran.
    ActionExecuted {
        action_type: String,
        order: i32,
        success: bool,
        error: Option<String>,
    },

    /// A workflow-wide sync finished.
    WorkflowSynced {
        workflow_id: i64,
        synced: usize,
        failed: usize,
    },
}

impl EventPayload {
    pub fn event_type_str(&self) -> &'static str {
        match self {
            EventPayload::ProgressReconciled { .. } => "progress_reconciled",
            EventPayload::StagesSkipped { .. } => "stages_skipped",
            EventPayload::ActionExecuted { .. } => "action_executed",
            EventPayload::WorkflowSynced { .. } => "workflow_synced",
        }
    }
}

impl ProgressEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            tenant_id: None,
            onboarding_id: None,
            payload,
        }
    }

    pub fn for_onboarding(mut self, onboarding_id: i64) -> Self {
        self.onboarding_id = Some(onboarding_id);
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let event = ProgressEvent::new(EventPayload::WorkflowSynced {
            workflow_id: 3,
            synced: 10,
            failed: 1,
        })
        .for_tenant("acme");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "workflow_synced");
        assert_eq!(json["payload"]["failed"], 1);
        assert_eq!(json["tenant_id"], "acme");
        assert_eq!(event.payload.event_type_str(), "workflow_synced");
    }
}
