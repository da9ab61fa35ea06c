//! Stage Progress Types
//!
//! Template stages, onboarding instances and the per-stage progress records
//! that reconciliation keeps aligned with the template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::lenient;

// ─── Template ─────────────────────────────────────────────────

/// One ordered node of a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    /// Unique within the workflow; not necessarily contiguous.
    pub order: i32,
    pub is_active: bool,
    pub is_valid: bool,
}

impl StageDefinition {
    pub fn new(id: i64, workflow_id: i64, name: impl Into<String>, order: i32) -> Self {
        Self {
            id,
            workflow_id,
            name: name.into(),
            order,
            is_active: true,
            is_valid: true,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.is_active && self.is_valid
    }
}

/// Filter to active, valid stages and sort ascending by template order.
pub fn ordered_active(stages: impl IntoIterator<Item = StageDefinition>) -> Vec<StageDefinition> {
    let mut stages: Vec<_> = stages.into_iter().filter(|s| s.is_usable()).collect();
    stages.sort_by_key(|s| (s.order, s.id));
    stages
}

// ─── Progress ─────────────────────────────────────────────────

/// Status of one stage for one instance.
///
/// Persisted as free text. Unknown values are kept verbatim so a
/// reconciliation pass never rewrites a status it does not understand.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Skipped,
    Completed,
    Other(String),
}

impl StageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::Skipped => "Skipped",
            Self::Completed => "Completed",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for StageStatus {
    fn from(s: String) -> Self {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "pending" => Self::Pending,
            "inprogress" => Self::InProgress,
            "skipped" => Self::Skipped,
            "completed" => Self::Completed,
            _ => Self::Other(s),
        }
    }
}

impl From<StageStatus> for String {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance, per-stage record of completion status and audit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    #[serde(default, deserialize_with = "lenient::i64")]
    pub stage_id: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub stage_name: String,
    /// 1-based position of the stage in the current template ordering.
    #[serde(default, deserialize_with = "lenient::i32")]
    pub stage_order: i32,
    #[serde(default, deserialize_with = "lenient::status")]
    pub status: StageStatus,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_completed: bool,
    #[serde(default, deserialize_with = "lenient::datetime")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::datetime")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub completed_by_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub completed_by: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_current: bool,
    /// Pass-through data (AI summary fields and anything else) that this
    /// crate does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageProgress {
    /// Fresh entry for a stage reconciliation has not seen before.
    pub fn pending(stage: &StageDefinition, position: i32) -> Self {
        Self {
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            stage_order: position,
            status: StageStatus::Pending,
            is_completed: false,
            start_time: None,
            completion_time: None,
            completed_by_id: None,
            completed_by: None,
            notes: None,
            is_current: false,
            extra: Map::new(),
        }
    }

    pub fn skipped(stage: &StageDefinition, position: i32) -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::pending(stage, position)
        }
    }

    /// Overwrite as Skipped. Unconditional: a previously completed entry
    /// loses its completed flag here.
    pub fn mark_skipped(&mut self) {
        self.status = StageStatus::Skipped;
        self.is_completed = false;
    }
}

// ─── Instance ─────────────────────────────────────────────────

/// One customer's traversal of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingInstance {
    pub id: i64,
    pub tenant_id: String,
    pub workflow_id: i64,
    pub current_stage_id: Option<i64>,
    pub current_stage_order: Option<i32>,
    /// Free text ("Started", "InProgress", "Completed", "Force Completed", ...).
    pub status: String,
    #[serde(default)]
    pub progress: Vec<StageProgress>,
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
    #[serde(default)]
    pub view_users: Vec<String>,
    #[serde(default)]
    pub operate_users: Vec<String>,
    #[serde(default)]
    pub view_teams: Vec<String>,
    #[serde(default)]
    pub operate_teams: Vec<String>,
}

impl OnboardingInstance {
    pub fn new(id: i64, tenant_id: impl Into<String>, workflow_id: i64) -> Self {
        Self {
            id,
            tenant_id: tenant_id.into(),
            workflow_id,
            current_stage_id: None,
            current_stage_order: None,
            status: "Started".to_string(),
            progress: Vec::new(),
            custom_fields: Map::new(),
            view_users: Vec::new(),
            operate_users: Vec::new(),
            view_teams: Vec::new(),
            operate_teams: Vec::new(),
        }
    }

    pub fn at_stage(mut self, stage: &StageDefinition) -> Self {
        self.current_stage_id = Some(stage.id);
        self.current_stage_order = Some(stage.order);
        self
    }

    pub fn progress_for(&self, stage_id: i64) -> Option<&StageProgress> {
        self.progress.iter().find(|p| p.stage_id == stage_id)
    }

    /// View and operate lists for one assignee kind.
    pub fn assignees(&self, kind: AssigneeKind) -> (&[String], &[String]) {
        match kind {
            AssigneeKind::User => (&self.view_users, &self.operate_users),
            AssigneeKind::Team => (&self.view_teams, &self.operate_teams),
        }
    }
}

/// How an instance read treats tenant isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    /// Only return the instance if it belongs to this tenant.
    Tenant(String),
    /// Skip the tenant filter (background execution without a request context).
    Bypass,
}

impl TenantScope {
    pub fn admits(&self, tenant_id: &str) -> bool {
        match self {
            Self::Tenant(t) => t == tenant_id,
            Self::Bypass => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssigneeKind {
    User,
    Team,
}

impl AssigneeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Team => "team",
        }
    }
}

impl std::str::FromStr for AssigneeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "users" => Ok(Self::User),
            "team" | "teams" => Ok(Self::Team),
            other => Err(format!("Unknown assignee type: {}", other)),
        }
    }
}
