//! Option schema for actions, feedbacks and module config.
//!
//! Visibility of a field is described by a [`VisibilityRule`]: plain data that
//! both sides of the process boundary evaluate the same way, instead of a
//! predicate function that would have to be shipped as code.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::OptionValues;

// ---------------------------------------------------------------------------
// VisibilityRule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VisibilityRule {
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    OneOf { field: String, values: Vec<Value> },
    /// Field is present and not `null`, `false`, `0` or `""`.
    Truthy { field: String },
    All { rules: Vec<VisibilityRule> },
    Any { rules: Vec<VisibilityRule> },
    Not { rule: Box<VisibilityRule> },
}

impl VisibilityRule {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        VisibilityRule::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn truthy(field: impl Into<String>) -> Self {
        VisibilityRule::Truthy {
            field: field.into(),
        }
    }

    pub fn evaluate(&self, options: &OptionValues) -> bool {
        match self {
            VisibilityRule::Equals { field, value } => options.get(field) == Some(value),
            VisibilityRule::NotEquals { field, value } => options.get(field) != Some(value),
            VisibilityRule::OneOf { field, values } => options
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            VisibilityRule::Truthy { field } => options.get(field).map(is_truthy).unwrap_or(false),
            VisibilityRule::All { rules } => rules.iter().all(|r| r.evaluate(options)),
            VisibilityRule::Any { rules } => rules.iter().any(|r| r.evaluate(options)),
            VisibilityRule::Not { rule } => !rule.evaluate(options),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// InputField
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropdownChoice {
    pub id: Value,
    pub label: String,
}

impl DropdownChoice {
    pub fn new(id: impl Into<Value>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InputFieldKind {
    #[serde(rename_all = "camelCase")]
    TextInput {
        #[serde(default)]
        default: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
        #[serde(default)]
        use_variables: bool,
    },
    Number {
        default: f64,
        min: f64,
        max: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Checkbox {
        default: bool,
    },
    #[serde(rename_all = "camelCase")]
    Dropdown {
        default: Value,
        choices: Vec<DropdownChoice>,
        #[serde(default)]
        allow_custom: bool,
    },
    MultiDropdown {
        default: Vec<Value>,
        choices: Vec<DropdownChoice>,
    },
    Colorpicker {
        default: u32,
    },
    StaticText {
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputField {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: InputFieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_visible: Option<VisibilityRule>,
}

impl InputField {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: InputFieldKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            tooltip: None,
            is_visible: None,
        }
    }

    pub fn text(id: impl Into<String>, label: impl Into<String>, default: &str) -> Self {
        Self::new(
            id,
            label,
            InputFieldKind::TextInput {
                default: Some(default.to_string()),
                regex: None,
                use_variables: false,
            },
        )
    }

    pub fn number(id: impl Into<String>, label: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self::new(
            id,
            label,
            InputFieldKind::Number {
                default,
                min,
                max,
                step: None,
            },
        )
    }

    pub fn checkbox(id: impl Into<String>, label: impl Into<String>, default: bool) -> Self {
        Self::new(id, label, InputFieldKind::Checkbox { default })
    }

    pub fn dropdown(
        id: impl Into<String>,
        label: impl Into<String>,
        choices: Vec<DropdownChoice>,
        default: impl Into<Value>,
    ) -> Self {
        Self::new(
            id,
            label,
            InputFieldKind::Dropdown {
                default: default.into(),
                choices,
                allow_custom: false,
            },
        )
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = Some(tooltip.into());
        self
    }

    pub fn visible_when(mut self, rule: VisibilityRule) -> Self {
        self.is_visible = Some(rule);
        self
    }

    /// The value this field starts with, `None` for display-only fields.
    pub fn default_value(&self) -> Option<Value> {
        match &self.kind {
            InputFieldKind::TextInput { default, .. } => {
                Some(Value::String(default.clone().unwrap_or_default()))
            }
            InputFieldKind::Number { default, .. } => Some(Value::from(*default)),
            InputFieldKind::Checkbox { default } => Some(Value::Bool(*default)),
            InputFieldKind::Dropdown { default, .. } => Some(default.clone()),
            InputFieldKind::MultiDropdown { default, .. } => Some(Value::Array(default.clone())),
            InputFieldKind::Colorpicker { default } => Some(Value::from(*default)),
            InputFieldKind::StaticText { .. } => None,
        }
    }

    pub fn is_visible_for(&self, options: &OptionValues) -> bool {
        self.is_visible
            .as_ref()
            .map(|rule| rule.evaluate(options))
            .unwrap_or(true)
    }
}

/// Build a config object from the declared defaults of `fields`.
pub fn default_values(fields: &[InputField]) -> OptionValues {
    fields
        .iter()
        .filter_map(|f| f.default_value().map(|v| (f.id.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(v: Value) -> OptionValues {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn rules_evaluate_against_option_values() {
        let rule = VisibilityRule::All {
            rules: vec![
                VisibilityRule::equals("mode", "tcp"),
                VisibilityRule::Not {
                    rule: Box::new(VisibilityRule::truthy("legacy")),
                },
            ],
        };
        assert!(rule.evaluate(&opts(json!({"mode": "tcp", "legacy": false}))));
        assert!(!rule.evaluate(&opts(json!({"mode": "tcp", "legacy": 1}))));
        assert!(!rule.evaluate(&opts(json!({"mode": "udp"}))));
    }

    #[test]
    fn one_of_requires_the_field_to_exist() {
        let rule = VisibilityRule::OneOf {
            field: "input".into(),
            values: vec![json!(1), json!(2)],
        };
        assert!(rule.evaluate(&opts(json!({"input": 2}))));
        assert!(!rule.evaluate(&opts(json!({}))));
    }

    #[test]
    fn rule_wire_format_is_tagged_by_op() {
        let rule = VisibilityRule::Any {
            rules: vec![VisibilityRule::truthy("enabled")],
        };
        let wire = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            wire,
            json!({"op": "any", "rules": [{"op": "truthy", "field": "enabled"}]})
        );
        let back: VisibilityRule = serde_json::from_value(wire).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn input_field_serializes_flat_with_type_tag() {
        let field = InputField::checkbox("tls", "Use TLS", true)
            .visible_when(VisibilityRule::equals("mode", "tcp"));
        let wire = serde_json::to_value(&field).unwrap();
        assert_eq!(wire["type"], "checkbox");
        assert_eq!(wire["default"], true);
        assert_eq!(wire["isVisible"]["op"], "equals");
    }

    #[test]
    fn default_values_skip_static_text() {
        let fields = vec![
            InputField::text("host", "Host", "127.0.0.1"),
            InputField::number("port", "Port", 9000.0, 1.0, 65535.0),
            InputField::new(
                "info",
                "Info",
                InputFieldKind::StaticText {
                    value: "hello".into(),
                },
            ),
        ];
        let config = default_values(&fields);
        assert_eq!(config.len(), 2);
        assert_eq!(config["host"], "127.0.0.1");
        assert_eq!(config["port"], 9000.0);
    }

    #[test]
    fn fields_without_rule_are_always_visible() {
        let field = InputField::text("host", "Host", "");
        assert!(field.is_visible_for(&OptionValues::new()));
    }
}
