use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Option values of an action/feedback instance, keyed by input field id.
pub type OptionValues = serde_json::Map<String, Value>;

/// Style properties produced by advanced feedbacks or carried as the default
/// style of boolean feedbacks (`bgcolor`, `color`, `text`, ...).
pub type StyleProps = serde_json::Map<String, Value>;

/// A host-pushed patch: `None` (or a disabled instance) removes the entry.
/// Entries keep the order the host wrote them in.
pub type InstancePatch<T> = IndexMap<String, Option<T>>;

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInstance {
    pub id: String,
    pub control_id: String,
    /// Id of the [`ActionDefinition`](crate::messages::ActionDefinitionInfo) this uses.
    pub action_id: String,
    #[serde(default)]
    pub options: OptionValues,
    #[serde(default)]
    pub disabled: bool,
    /// Index of the last upgrade script applied, `None` meaning the module's
    /// own baseline applies.
    #[serde(default)]
    pub upgrade_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInstance {
    pub id: String,
    pub control_id: String,
    pub feedback_id: String,
    #[serde(default)]
    pub options: OptionValues,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub upgrade_index: Option<usize>,
    /// Size of the control's image, when the host knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSize>,
}

/// Shared accessors so the managers and the upgrade pipeline can treat both
/// instance kinds uniformly.
pub trait Instance: Clone {
    fn id(&self) -> &str;
    fn control_id(&self) -> &str;
    fn definition_id(&self) -> &str;
    fn options(&self) -> &OptionValues;
    fn is_disabled(&self) -> bool;
    fn upgrade_index(&self) -> Option<usize>;
}

impl Instance for ActionInstance {
    fn id(&self) -> &str {
        &self.id
    }
    fn control_id(&self) -> &str {
        &self.control_id
    }
    fn definition_id(&self) -> &str {
        &self.action_id
    }
    fn options(&self) -> &OptionValues {
        &self.options
    }
    fn is_disabled(&self) -> bool {
        self.disabled
    }
    fn upgrade_index(&self) -> Option<usize> {
        self.upgrade_index
    }
}

impl Instance for FeedbackInstance {
    fn id(&self) -> &str {
        &self.id
    }
    fn control_id(&self) -> &str {
        &self.control_id
    }
    fn definition_id(&self) -> &str {
        &self.feedback_id
    }
    fn options(&self) -> &OptionValues {
        &self.options
    }
    fn is_disabled(&self) -> bool {
        self.disabled
    }
    fn upgrade_index(&self) -> Option<usize> {
        self.upgrade_index
    }
}

// ---------------------------------------------------------------------------
// Feedback values
// ---------------------------------------------------------------------------

/// One evaluated feedback result on its way to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValue {
    pub id: String,
    pub control_id: String,
    /// `bool` for boolean feedbacks, a style object for advanced ones.
    pub value: Value,
}

// ---------------------------------------------------------------------------
// Status / log level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Ok,
    Connecting,
    Disconnected,
    ConnectionFailure,
    BadConfig,
    UnknownError,
    UnknownWarning,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Ok => "ok",
            InstanceStatus::Connecting => "connecting",
            InstanceStatus::Disconnected => "disconnected",
            InstanceStatus::ConnectionFailure => "connection_failure",
            InstanceStatus::BadConfig => "bad_config",
            InstanceStatus::UnknownError => "unknown_error",
            InstanceStatus::UnknownWarning => "unknown_warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

/// Variable id meaning "every variable": in a change notification it marks
/// all variables as changed, in a parse response it marks the text as
/// depending on all of them.
pub const ALL_VARIABLES: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub variable_id: String,
    pub name: String,
}

impl VariableDefinition {
    pub fn new(variable_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            variable_id: variable_id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    pub id: String,
    /// `None` clears the variable.
    pub value: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_instance_parses_camel_case_with_defaults() {
        let json = r#"{"id":"a1","controlId":"bank:1","actionId":"power"}"#;
        let action: ActionInstance = serde_json::from_str(json).unwrap();
        assert_eq!(action.control_id, "bank:1");
        assert!(action.options.is_empty());
        assert!(!action.disabled);
        assert_eq!(action.upgrade_index, None);
    }

    #[test]
    fn feedback_instance_exposes_definition_id() {
        let json = r#"{"id":"f1","controlId":"c","feedbackId":"tally","upgradeIndex":3,
            "image":{"width":72,"height":58}}"#;
        let feedback: FeedbackInstance = serde_json::from_str(json).unwrap();
        assert_eq!(feedback.definition_id(), "tally");
        assert_eq!(feedback.upgrade_index(), Some(3));
        assert_eq!(feedback.image.map(|i| i.width), Some(72));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&InstanceStatus::ConnectionFailure).unwrap();
        assert_eq!(json, r#""connection_failure""#);
        assert_eq!(InstanceStatus::BadConfig.as_str(), "bad_config");
    }
}
