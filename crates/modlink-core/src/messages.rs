//! Payloads exchanged between the module and the host, one struct per call.
//!
//! Every call is addressed by name (see [`method`]); the payload structs here
//! are what travels inside the envelope once decoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::options::InputField;
use crate::types::{
    ActionInstance, FeedbackInstance, FeedbackValue, InstancePatch, InstanceStatus, LogLevel,
    OptionValues, StyleProps, VariableDefinition, VariableValue,
};

/// Call names, as they appear in the envelope `name` field.
pub mod method {
    // module → host
    pub const REGISTER: &str = "register";
    pub const LOG_MESSAGE: &str = "log-message";
    pub const SET_STATUS: &str = "set-status";
    pub const SET_ACTION_DEFINITIONS: &str = "setActionDefinitions";
    pub const SET_FEEDBACK_DEFINITIONS: &str = "setFeedbackDefinitions";
    pub const SET_VARIABLE_DEFINITIONS: &str = "setVariableDefinitions";
    pub const SET_PRESET_DEFINITIONS: &str = "setPresetDefinitions";
    pub const SET_VARIABLE_VALUES: &str = "setVariableValues";
    pub const UPDATE_FEEDBACK_VALUES: &str = "updateFeedbackValues";
    pub const SAVE_CONFIG: &str = "saveConfig";
    pub const UPGRADED_ITEMS: &str = "upgradedItems";
    pub const RECORD_ACTION: &str = "recordAction";
    pub const SET_CUSTOM_VARIABLE: &str = "setCustomVariable";
    pub const PARSE_VARIABLES_IN_STRING: &str = "parseVariablesInString";

    // host → module
    pub const INIT: &str = "init";
    pub const DESTROY: &str = "destroy";
    pub const UPDATE_CONFIG: &str = "updateConfig";
    pub const UPDATE_ACTIONS: &str = "updateActions";
    pub const UPDATE_FEEDBACKS: &str = "updateFeedbacks";
    pub const EXECUTE_ACTION: &str = "executeAction";
    pub const GET_CONFIG_FIELDS: &str = "getConfigFields";
    pub const LEARN_ACTION: &str = "learnAction";
    pub const LEARN_FEEDBACK: &str = "learnFeedback";
    pub const START_STOP_RECORD_ACTIONS: &str = "startStopRecordActions";
    pub const VARIABLES_CHANGED: &str = "variablesChanged";
    pub const HANDLE_HTTP_REQUEST: &str = "handleHttpRequest";
}

// ---------------------------------------------------------------------------
// Module → host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    pub api_version: String,
    pub connection_id: String,
    pub verification_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStatusMessage {
    pub status: InstanceStatus,
    pub message: Option<String>,
}

/// Host-facing description of an action definition. The callback itself never
/// leaves the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinitionInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub options: Vec<InputField>,
    pub has_learn: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedbackKind {
    #[serde(rename_all = "camelCase")]
    Boolean { default_style: StyleProps },
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackDefinitionInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub options: Vec<InputField>,
    #[serde(flatten)]
    pub kind: FeedbackKind,
    pub has_learn: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetActionDefinitionsMessage {
    pub actions: Vec<ActionDefinitionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetFeedbackDefinitionsMessage {
    pub feedbacks: Vec<FeedbackDefinitionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVariableDefinitionsMessage {
    pub variables: Vec<VariableDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPresetDefinitionsMessage {
    pub presets: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableValuesMessage {
    pub new_values: Vec<VariableValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFeedbackValuesMessage {
    pub values: Vec<FeedbackValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfigMessage {
    pub config: Value,
}

/// A feedback touched by the upgrade pipeline. Scripts may attach a style that
/// the host merges into the control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradedFeedback {
    #[serde(flatten)]
    pub feedback: FeedbackInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleProps>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradedItemsMessage {
    pub updated_actions: BTreeMap<String, ActionInstance>,
    pub updated_feedbacks: BTreeMap<String, UpgradedFeedback>,
}

impl UpgradedItemsMessage {
    pub fn is_empty(&self) -> bool {
        self.updated_actions.is_empty() && self.updated_feedbacks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordActionMessage {
    pub action_id: String,
    pub options: OptionValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqueness_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCustomVariableMessage {
    pub custom_variable_id: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseVariablesInStringMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseVariablesInStringResponse {
    pub text: String,
    /// Every variable id the host resolved while parsing.
    #[serde(default)]
    pub variable_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Host → module
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    pub label: String,
    #[serde(default)]
    pub is_first_init: bool,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub last_upgrade_index: Option<usize>,
    #[serde(default)]
    pub actions: InstancePatch<ActionInstance>,
    #[serde(default)]
    pub feedbacks: InstancePatch<FeedbackInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub has_http_handler: bool,
    pub has_record_actions_handler: bool,
    pub new_upgrade_index: Option<usize>,
    pub updated_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfigMessage {
    pub config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateActionInstancesMessage {
    pub actions: InstancePatch<ActionInstance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateFeedbackInstancesMessage {
    pub feedbacks: InstancePatch<FeedbackInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteActionMessage {
    pub action: ActionInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetConfigFieldsResponse {
    pub fields: Vec<InputField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnActionMessage {
    pub action: ActionInstance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnFeedbackMessage {
    pub feedback: FeedbackInstance,
}

/// `options: None` tells the host learning is not supported for this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnResponse {
    pub options: Option<OptionValues>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartStopRecordActionsMessage {
    pub recording: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesChangedMessage {
    pub variables_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn not_found() -> Self {
        Self {
            status: 404,
            headers: HashMap::new(),
            body: Some("Not found".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleHttpRequestMessage {
    pub request: HttpRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleHttpRequestResponse {
    pub response: HttpResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_message_accepts_null_patch_entries() {
        let json = json!({
            "label": "mixer",
            "isFirstInit": false,
            "config": {"host": "10.0.0.2"},
            "lastUpgradeIndex": 2,
            "actions": {
                "a1": {"id": "a1", "controlId": "c1", "actionId": "mute", "options": {"ch": 1}},
                "a2": null
            },
            "feedbacks": {}
        });
        let msg: InitMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.last_upgrade_index, Some(2));
        assert!(msg.actions["a1"].is_some());
        assert!(msg.actions["a2"].is_none());
    }

    #[test]
    fn feedback_definition_info_flattens_kind() {
        let info = FeedbackDefinitionInfo {
            id: "tally".into(),
            name: "Tally".into(),
            description: None,
            options: vec![],
            kind: FeedbackKind::Boolean {
                default_style: json!({"bgcolor": 16711680}).as_object().cloned().unwrap(),
            },
            has_learn: false,
        };
        let wire = serde_json::to_value(&info).unwrap();
        assert_eq!(wire["type"], "boolean");
        assert_eq!(wire["defaultStyle"]["bgcolor"], 16711680);
        assert_eq!(wire["hasLearn"], false);
    }

    #[test]
    fn upgraded_feedback_carries_optional_style() {
        let upgraded = UpgradedFeedback {
            feedback: FeedbackInstance {
                id: "f1".into(),
                control_id: "c".into(),
                feedback_id: "tally".into(),
                options: OptionValues::new(),
                disabled: false,
                upgrade_index: Some(4),
                image: None,
            },
            style: None,
        };
        let wire = serde_json::to_value(&upgraded).unwrap();
        assert_eq!(wire["feedbackId"], "tally");
        assert_eq!(wire["upgradeIndex"], 4);
        assert!(wire.get("style").is_none());
    }
}
