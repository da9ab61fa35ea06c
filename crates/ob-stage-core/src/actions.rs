//! Condition actions: wire format, typed payloads and execution results.
//!
//! The wire format is a loose JSON array written by the rules editor over
//! several versions. `RawAction` accepts all of it; `ActionKind` is the typed
//! form the executor runs, with legacy fallbacks resolved in one place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::lenient;
use crate::error::{Result, StageError};
use crate::types::AssigneeKind;

pub const DEFAULT_END_STATUS: &str = "Completed";

// ─── Wire format ──────────────────────────────────────────────

/// One action as persisted on a condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAction {
    #[serde(rename = "type", default, deserialize_with = "lenient::string")]
    pub action_type: String,
    #[serde(default, deserialize_with = "lenient::i32")]
    pub order: i32,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_stage_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub skip_count: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub end_status: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipient_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipient_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub template_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value: Option<Value>,
    /// Legacy untyped parameters (fieldPath, newValue, assigneeType, assigneeIds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub action_definition_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub team_id: Option<String>,
}

impl RawAction {
    pub fn kind(&self) -> ActionType {
        ActionType::parse(&self.action_type)
    }

    fn param(&self, key: &str) -> Option<&Value> {
        self.parameters
            .as_ref()
            .and_then(|p| p.get(key))
            .filter(|v| !v.is_null())
    }

    fn param_str(&self, key: &str) -> Option<String> {
        self.param(key).and_then(lenient::value_to_string)
    }
}

/// Parse a condition's action list.
///
/// Blank input and `null` are an empty list; anything else that is not a
/// JSON array of objects is a `Parse` error.
pub fn parse_actions(json: &str) -> Result<Vec<RawAction>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Option<Vec<RawAction>>>(json)
        .map(Option::unwrap_or_default)
        .map_err(|e| StageError::Parse(format!("invalid action list: {}", e)))
}

// ─── Discriminator ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionType {
    GoToStage,
    SkipStage,
    EndWorkflow,
    SendNotification,
    UpdateField,
    TriggerAction,
    AssignUser,
    Unsupported(String),
}

impl ActionType {
    /// Case-insensitive; `_`, `-` and spaces are ignored.
    pub fn parse(s: &str) -> Self {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "gotostage" => Self::GoToStage,
            "skipstage" => Self::SkipStage,
            "endworkflow" => Self::EndWorkflow,
            "sendnotification" => Self::SendNotification,
            "updatefield" => Self::UpdateField,
            "triggeraction" => Self::TriggerAction,
            "assignuser" => Self::AssignUser,
            _ => Self::Unsupported(s.to_string()),
        }
    }

    /// Canonical name, or the original text for unsupported types.
    pub fn name(&self) -> &str {
        match self {
            Self::GoToStage => "GoToStage",
            Self::SkipStage => "SkipStage",
            Self::EndWorkflow => "EndWorkflow",
            Self::SendNotification => "SendNotification",
            Self::UpdateField => "UpdateField",
            Self::TriggerAction => "TriggerAction",
            Self::AssignUser => "AssignUser",
            Self::Unsupported(s) => s,
        }
    }
}

// ─── Typed actions ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    GoToStage {
        target_stage_id: i64,
    },
    SkipStage {
        /// Always at least 1
        skip_count: usize,
    },
    EndWorkflow {
        end_status: String,
    },
    SendNotification {
        recipient_type: Option<String>,
        recipient_id: Option<String>,
        template_id: Option<String>,
    },
    UpdateField {
        field_name: String,
        value: Value,
    },
    TriggerAction {
        action_definition_id: i64,
    },
    AssignUser {
        kind: AssigneeKind,
        ids: Vec<String>,
    },
}

impl TryFrom<&RawAction> for ActionKind {
    type Error = StageError;

    fn try_from(raw: &RawAction) -> Result<Self> {
        match raw.kind() {
            ActionType::GoToStage => {
                let target_stage_id = raw
                    .target_stage_id
                    .ok_or_else(|| StageError::validation("GoToStage requires targetStageId"))?;
                Ok(Self::GoToStage { target_stage_id })
            }
            ActionType::SkipStage => {
                let skip_count =
                    usize::try_from(raw.skip_count.unwrap_or(1).max(1)).unwrap_or(usize::MAX);
                Ok(Self::SkipStage { skip_count })
            }
            ActionType::EndWorkflow => {
                let end_status = raw
                    .end_status
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_END_STATUS)
                    .to_string();
                Ok(Self::EndWorkflow { end_status })
            }
            ActionType::SendNotification => Ok(Self::SendNotification {
                recipient_type: raw.recipient_type.clone(),
                recipient_id: raw.recipient_id.clone(),
                template_id: raw.template_id.clone(),
            }),
            ActionType::UpdateField => {
                let field_name = raw
                    .field_name
                    .clone()
                    .or_else(|| raw.param_str("fieldPath"))
                    .or_else(|| raw.param_str("fieldName"))
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        StageError::validation(
                            "UpdateField requires fieldName or parameters.fieldPath",
                        )
                    })?;
                let value = raw
                    .field_value
                    .clone()
                    .or_else(|| raw.param("newValue").cloned())
                    .or_else(|| raw.param("fieldValue").cloned())
                    .unwrap_or(Value::Null);
                Ok(Self::UpdateField { field_name, value })
            }
            ActionType::TriggerAction => {
                let action_definition_id = raw
                    .action_definition_id
                    .ok_or_else(|| {
                        StageError::validation("TriggerAction requires actionDefinitionId")
                    })?;
                Ok(Self::TriggerAction { action_definition_id })
            }
            ActionType::AssignUser => resolve_assignees(raw),
            ActionType::Unsupported(name) => Err(StageError::validation(format!(
                "Unsupported action type: {}",
                name
            ))),
        }
    }
}

/// `parameters.assigneeType` + `parameters.assigneeIds`, else legacy
/// `userId` / `teamId`. Setting both legacy ids is ambiguous and rejected.
fn resolve_assignees(raw: &RawAction) -> Result<ActionKind> {
    let typed = raw
        .param_str("assigneeType")
        .and_then(|t| t.parse::<AssigneeKind>().ok());

    if let Some(kind) = typed {
        let ids: Vec<String> = match raw.param("assigneeIds") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(lenient::value_to_string)
                .collect(),
            Some(single) => lenient::value_to_string(single).into_iter().collect(),
            None => Vec::new(),
        };
        let ids = clean_ids(ids);
        if !ids.is_empty() {
            return Ok(ActionKind::AssignUser { kind, ids });
        }
    }

    let user_ids = clean_ids(raw.user_id.iter().cloned().collect());
    let team_ids = clean_ids(raw.team_id.iter().cloned().collect());
    match (user_ids.is_empty(), team_ids.is_empty()) {
        (false, false) => Err(StageError::validation(
            "AssignUser takes either userId or teamId, not both",
        )),
        (false, true) => Ok(ActionKind::AssignUser {
            kind: AssigneeKind::User,
            ids: user_ids,
        }),
        (true, false) => Ok(ActionKind::AssignUser {
            kind: AssigneeKind::Team,
            ids: team_ids,
        }),
        (true, true) => Err(StageError::validation(
            "AssignUser requires parameters.assigneeType with assigneeIds, or userId/teamId",
        )),
    }
}

fn clean_ids(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim().to_string();
        if !id.is_empty() && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

// ─── Execution context and results ────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecutionContext {
    pub onboarding_id: i64,
    /// Stage whose condition fired
    pub stage_id: Option<i64>,
    pub tenant_id: Option<String>,
}

impl ActionExecutionContext {
    pub fn new(onboarding_id: i64) -> Self {
        Self {
            onboarding_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecutionResult {
    pub success: bool,
    pub details: Vec<ActionExecutionDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionExecutionDetail {
    pub action_type: String,
    pub order: i32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result_data: Map<String, Value>,
}

impl ActionExecutionDetail {
    pub fn succeeded(
        action_type: impl Into<String>,
        order: i32,
        result_data: Map<String, Value>,
    ) -> Self {
        Self {
            action_type: action_type.into(),
            order,
            success: true,
            error_message: None,
            result_data,
        }
    }

    pub fn failed(action_type: impl Into<String>, order: i32, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            order,
            success: false,
            error_message: Some(error.into()),
            result_data: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawAction {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_action_type_parsing() {
        assert_eq!(ActionType::parse("sendnotification"), ActionType::SendNotification);
        assert_eq!(ActionType::parse("GO_TO_STAGE"), ActionType::GoToStage);
        assert_eq!(ActionType::parse("Skip Stage"), ActionType::SkipStage);
        assert_eq!(ActionType::parse("assign-user"), ActionType::AssignUser);
        assert_eq!(
            ActionType::parse("Teleport"),
            ActionType::Unsupported("Teleport".to_string())
        );
        assert_eq!(ActionType::parse("Teleport").name(), "Teleport");
    }

    #[test]
    fn test_parse_actions_accepts_loose_scalars() {
        let actions = parse_actions(
            r#"[{"type": "GoToStage", "order": "2", "targetStageId": "15"},
                {"type": "EndWorkflow", "order": 1, "extra": true}]"#,
        )
        .unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].order, 2);
        assert_eq!(actions[0].target_stage_id, Some(15));
    }

    #[test]
    fn test_parse_actions_blank_and_null_are_empty() {
        assert!(parse_actions("").unwrap().is_empty());
        assert!(parse_actions("null").unwrap().is_empty());
        assert!(parse_actions("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_actions_rejects_malformed() {
        let err = parse_actions(r#"[{"type": "GoToStage""#).unwrap_err();
        assert_eq!(err.kind(), "ParseError");
        assert!(parse_actions(r#"{"type": "GoToStage"}"#).is_err());
    }

    #[test]
    fn test_skip_count_defaults_and_clamps() {
        let kind = ActionKind::try_from(&raw(json!({"type": "SkipStage"}))).unwrap();
        assert_eq!(kind, ActionKind::SkipStage { skip_count: 1 });

        let kind =
            ActionKind::try_from(&raw(json!({"type": "SkipStage", "skipCount": -4}))).unwrap();
        assert_eq!(kind, ActionKind::SkipStage { skip_count: 1 });

        let kind =
            ActionKind::try_from(&raw(json!({"type": "SkipStage", "skipCount": 3}))).unwrap();
        assert_eq!(kind, ActionKind::SkipStage { skip_count: 3 });
    }

    #[test]
    fn test_end_status_default() {
        let kind =
            ActionKind::try_from(&raw(json!({"type": "EndWorkflow", "endStatus": "  "}))).unwrap();
        assert_eq!(
            kind,
            ActionKind::EndWorkflow {
                end_status: "Completed".into()
            }
        );
    }

    #[test]
    fn test_update_field_legacy_parameters() {
        let kind = ActionKind::try_from(&raw(json!({
            "type": "UpdateField",
            "parameters": {"fieldPath": "riskTier", "newValue": "High"}
        })))
        .unwrap();
        assert_eq!(
            kind,
            ActionKind::UpdateField {
                field_name: "riskTier".into(),
                value: json!("High")
            }
        );

        let missing_name = raw(json!({"type": "UpdateField", "fieldValue": 1}));
        let err = ActionKind::try_from(&missing_name).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn test_assignees_typed_and_legacy() {
        let kind = ActionKind::try_from(&raw(json!({
            "type": "AssignUser",
            "parameters": {"assigneeType": "Team", "assigneeIds": ["t1", 42, "t1", " "]}
        })))
        .unwrap();
        assert_eq!(
            kind,
            ActionKind::AssignUser {
                kind: AssigneeKind::Team,
                ids: vec!["t1".into(), "42".into()]
            }
        );

        let kind = ActionKind::try_from(&raw(json!({"type": "AssignUser", "userId": 7}))).unwrap();
        assert_eq!(
            kind,
            ActionKind::AssignUser {
                kind: AssigneeKind::User,
                ids: vec!["7".into()]
            }
        );

        assert!(ActionKind::try_from(&raw(json!({"type": "AssignUser"}))).is_err());
    }

    #[test]
    fn test_legacy_user_and_team_together_is_rejected() {
        let err = ActionKind::try_from(&raw(json!({
            "type": "AssignUser",
            "userId": "u1",
            "teamId": "t1"
        })))
        .unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        assert!(err.to_string().contains("not both"));

        // A blank legacy id does not count
        let kind = ActionKind::try_from(&raw(json!({
            "type": "AssignUser",
            "userId": " ",
            "teamId": "t1"
        })))
        .unwrap();
        assert_eq!(
            kind,
            ActionKind::AssignUser {
                kind: AssigneeKind::Team,
                ids: vec!["t1".into()]
            }
        );

        // Typed parameters take precedence over legacy ids
        let kind = ActionKind::try_from(&raw(json!({
            "type": "AssignUser",
            "userId": "u1",
            "teamId": "t1",
            "parameters": {"assigneeType": "user", "assigneeIds": ["u9"]}
        })))
        .unwrap();
        assert_eq!(
            kind,
            ActionKind::AssignUser {
                kind: AssigneeKind::User,
                ids: vec!["u9".into()]
            }
        );
    }

    #[test]
    fn test_unsupported_type_is_validation_error() {
        let err = ActionKind::try_from(&raw(json!({"type": "unknown"}))).unwrap_err();
        assert!(err.to_string().contains("Unsupported action type: unknown"));
    }

    #[test]
    fn test_required_ids() {
        assert!(ActionKind::try_from(&raw(json!({"type": "GoToStage"}))).is_err());
        assert!(ActionKind::try_from(&raw(json!({"type": "TriggerAction"}))).is_err());
    }
}
