//! The capability surface a module uses to talk to the host.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use modlink_core::config::RuntimeSettings;
use modlink_core::messages::{
    method, LogMessage, ParseVariablesInStringMessage, ParseVariablesInStringResponse,
    RecordActionMessage, SaveConfigMessage, SetCustomVariableMessage, SetPresetDefinitionsMessage,
    SetStatusMessage, SetVariableDefinitionsMessage, SetVariableValuesMessage,
};
use modlink_core::types::{InstanceStatus, LogLevel, OptionValues, VariableDefinition, VariableValue};
use modlink_core::{ModlinkError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionDefinition, ActionManager};
use crate::feedbacks::{FeedbackDefinition, FeedbackManager};
use crate::host::HostLink;

struct ApiInner {
    host: Arc<dyn HostLink>,
    actions: ActionManager,
    feedbacks: FeedbackManager,
    variables: Mutex<HashMap<String, Value>>,
    recording: AtomicBool,
}

/// Cheap to clone; every clone talks to the same host connection.
#[derive(Clone)]
pub struct ModuleApi {
    inner: Arc<ApiInner>,
}

fn owned(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

impl ModuleApi {
    /// Must be called inside a Tokio runtime.
    pub fn new(host: Arc<dyn HostLink>, settings: &RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                actions: ActionManager::new(Arc::clone(&host)),
                feedbacks: FeedbackManager::new(Arc::clone(&host), settings),
                host,
                variables: Mutex::new(HashMap::new()),
                recording: AtomicBool::new(false),
            }),
        }
    }

    pub fn actions(&self) -> &ActionManager {
        &self.inner.actions
    }

    pub fn feedbacks(&self) -> &FeedbackManager {
        &self.inner.feedbacks
    }

    pub(crate) fn host(&self) -> &Arc<dyn HostLink> {
        &self.inner.host
    }

    // ─── Definitions ──────────────────────────────────────────────────────

    pub fn set_action_definitions(&self, definitions: Vec<ActionDefinition>) -> Result<()> {
        self.inner.actions.set_definitions(definitions)
    }

    pub fn set_feedback_definitions(&self, definitions: Vec<FeedbackDefinition>) -> Result<()> {
        self.inner.feedbacks.set_definitions(definitions)
    }

    pub fn set_preset_definitions(&self, presets: Vec<Value>) -> Result<()> {
        self.inner.host.notify(
            method::SET_PRESET_DEFINITIONS,
            &SetPresetDefinitionsMessage { presets },
        )
    }

    /// Replace the variable definitions. Cached values of variables that are
    /// no longer defined are forgotten.
    pub fn set_variable_definitions(&self, variables: Vec<VariableDefinition>) -> Result<()> {
        let defined: HashSet<&str> = variables.iter().map(|v| v.variable_id.as_str()).collect();
        self.inner
            .variables
            .lock()
            .retain(|id, _| defined.contains(id.as_str()));
        self.inner.host.notify(
            method::SET_VARIABLE_DEFINITIONS,
            &SetVariableDefinitionsMessage { variables },
        )
    }

    // ─── Variables ────────────────────────────────────────────────────────

    /// Set or clear (`None`) variable values.
    pub fn set_variable_values<I, S>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Option<Value>)>,
        S: Into<String>,
    {
        let new_values: Vec<VariableValue> = values
            .into_iter()
            .map(|(id, value)| VariableValue {
                id: id.into(),
                value,
            })
            .collect();
        {
            let mut cache = self.inner.variables.lock();
            for v in &new_values {
                match &v.value {
                    Some(value) => cache.insert(v.id.clone(), value.clone()),
                    None => cache.remove(&v.id),
                };
            }
        }
        self.inner.host.notify(
            method::SET_VARIABLE_VALUES,
            &SetVariableValuesMessage { new_values },
        )
    }

    /// Last value this module set for one of its own variables.
    pub fn get_variable_value(&self, variable_id: &str) -> Option<Value> {
        self.inner.variables.lock().get(variable_id).cloned()
    }

    /// Resolve variable references without any control scope.
    pub async fn parse_variables_in_string(&self, text: &str) -> Result<String> {
        let response: ParseVariablesInStringResponse = self
            .inner
            .host
            .request(
                method::PARSE_VARIABLES_IN_STRING,
                &ParseVariablesInStringMessage {
                    text: text.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.text)
    }

    pub async fn set_custom_variable_value(&self, custom_variable_id: &str, value: Value) -> Result<()> {
        let _: Value = self
            .inner
            .host
            .request(
                method::SET_CUSTOM_VARIABLE,
                &SetCustomVariableMessage {
                    custom_variable_id: custom_variable_id.to_string(),
                    value,
                    control_id: None,
                },
            )
            .await?;
        Ok(())
    }

    // ─── Status, logging, config ──────────────────────────────────────────

    pub fn update_status(&self, status: InstanceStatus, message: Option<&str>) -> Result<()> {
        debug!(status = status.as_str(), "status update");
        self.inner.host.notify(
            method::SET_STATUS,
            &SetStatusMessage {
                status,
                message: message.map(str::to_string),
            },
        )
    }

    /// Log locally and forward the line to the host's log view.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(target: "module", "{message}"),
            LogLevel::Info => info!(target: "module", "{message}"),
            LogLevel::Warn => warn!(target: "module", "{message}"),
            LogLevel::Error => error!(target: "module", "{message}"),
        }
        self.inner
            .host
            .notify(method::LOG_MESSAGE, &LogMessage { level, message })
    }

    /// Ask the host to persist a new config.
    pub fn save_config(&self, config: Value) -> Result<()> {
        self.inner
            .host
            .notify(method::SAVE_CONFIG, &SaveConfigMessage { config })
    }

    // ─── Action recording ─────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.inner.recording.load(Ordering::SeqCst)
    }

    pub(crate) fn set_recording(&self, recording: bool) {
        self.inner.recording.store(recording, Ordering::SeqCst);
    }

    /// Offer an action to the host's recorder. Fails unless the host
    /// started a recording session.
    pub fn record_action(
        &self,
        action_id: &str,
        options: OptionValues,
        uniqueness_id: Option<&str>,
    ) -> Result<()> {
        if !self.is_recording() {
            return Err(ModlinkError::NotRecording);
        }
        self.inner.host.notify(
            method::RECORD_ACTION,
            &RecordActionMessage {
                action_id: action_id.to_string(),
                options,
                uniqueness_id: uniqueness_id.map(str::to_string),
            },
        )
    }

    // ─── Feedbacks & subscriptions ────────────────────────────────────────

    /// Recheck every feedback of the given types, or all when empty.
    pub fn check_feedbacks(&self, feedback_ids: &[&str]) {
        self.inner.feedbacks.check_feedbacks(&owned(feedback_ids));
    }

    pub fn check_feedbacks_by_id(&self, instance_ids: &[&str]) {
        self.inner.feedbacks.check_feedbacks_by_id(&owned(instance_ids));
    }

    pub async fn subscribe_actions(&self, action_ids: &[&str]) {
        self.inner.actions.subscribe_all(&owned(action_ids)).await;
    }

    pub async fn unsubscribe_actions(&self, action_ids: &[&str]) {
        self.inner.actions.unsubscribe_all(&owned(action_ids)).await;
    }

    pub async fn subscribe_feedbacks(&self, feedback_ids: &[&str]) {
        self.inner.feedbacks.subscribe_all(&owned(feedback_ids)).await;
    }

    pub async fn unsubscribe_feedbacks(&self, feedback_ids: &[&str]) {
        self.inner.feedbacks.unsubscribe_all(&owned(feedback_ids)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHost;
    use serde_json::json;

    #[tokio::test]
    async fn variable_values_are_cached_and_sent() {
        let host = RecordingHost::new();
        let api = ModuleApi::new(host.clone(), &RuntimeSettings::default());

        api.set_variable_values([("volume", Some(json!(7))), ("input", Some(json!("hdmi")))])
            .unwrap();
        api.set_variable_values([("input", None)]).unwrap();

        assert_eq!(api.get_variable_value("volume"), Some(json!(7)));
        assert_eq!(api.get_variable_value("input"), None);
        let sent = host.sent(method::SET_VARIABLE_VALUES);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], json!({"newValues": [{"id": "input", "value": null}]}));
    }

    #[tokio::test]
    async fn redefining_variables_drops_stale_values() {
        let host = RecordingHost::new();
        let api = ModuleApi::new(host.clone(), &RuntimeSettings::default());
        api.set_variable_values([("a", Some(json!(1))), ("b", Some(json!(2)))])
            .unwrap();

        api.set_variable_definitions(vec![VariableDefinition::new("a", "A")])
            .unwrap();

        assert_eq!(api.get_variable_value("a"), Some(json!(1)));
        assert_eq!(api.get_variable_value("b"), None);
        assert_eq!(
            host.sent(method::SET_VARIABLE_DEFINITIONS)[0]["variables"][0]["variableId"],
            "a"
        );
    }

    #[tokio::test]
    async fn record_action_requires_a_session() {
        let host = RecordingHost::new();
        let api = ModuleApi::new(host.clone(), &RuntimeSettings::default());

        let err = api
            .record_action("press", OptionValues::new(), None)
            .unwrap_err();
        assert!(matches!(err, ModlinkError::NotRecording));

        api.set_recording(true);
        api.record_action("press", OptionValues::new(), Some("btn-1"))
            .unwrap();
        let sent = host.sent(method::RECORD_ACTION);
        assert_eq!(sent[0]["actionId"], "press");
        assert_eq!(sent[0]["uniquenessId"], "btn-1");
    }

    #[tokio::test]
    async fn status_and_log_reach_the_host() {
        let host = RecordingHost::new();
        let api = ModuleApi::new(host.clone(), &RuntimeSettings::default());

        api.update_status(InstanceStatus::ConnectionFailure, Some("refused"))
            .unwrap();
        api.log(LogLevel::Warn, "retrying").unwrap();
        api.save_config(json!({"host": "10.0.0.2"})).unwrap();

        assert_eq!(
            host.sent(method::SET_STATUS)[0],
            json!({"status": "connection_failure", "message": "refused"})
        );
        assert_eq!(
            host.sent(method::LOG_MESSAGE)[0],
            json!({"level": "warn", "message": "retrying"})
        );
        assert_eq!(host.sent(method::SAVE_CONFIG)[0]["config"]["host"], "10.0.0.2");
    }

    #[tokio::test]
    async fn unscoped_parse_and_custom_variables_are_calls() {
        let host = RecordingHost::new();
        host.set_variable("internal:time_hms", "12:00:00");
        let api = ModuleApi::new(host.clone(), &RuntimeSettings::default());

        let text = api
            .parse_variables_in_string("it is $(internal:time_hms)")
            .await
            .unwrap();
        assert_eq!(text, "it is 12:00:00");
        assert!(host.calls(method::PARSE_VARIABLES_IN_STRING)[0]
            .get("controlId")
            .is_none());

        api.set_custom_variable_value("scene", json!("B")).await.unwrap();
        assert_eq!(
            host.calls(method::SET_CUSTOM_VARIABLE)[0],
            json!({"customVariableId": "scene", "value": "B"})
        );
    }
}
