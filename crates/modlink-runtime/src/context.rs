//! Evaluation contexts handed to action and feedback callbacks.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use modlink_core::messages::{method, ParseVariablesInStringMessage, ParseVariablesInStringResponse};
use modlink_core::types::ALL_VARIABLES;
use modlink_core::Result;
use parking_lot::Mutex;

use crate::host::HostLink;

/// A module-supplied callback or hook taking an instance and its context.
pub type Callback<I, C, T> =
    Arc<dyn Fn(I, C) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

pub(crate) fn callback<I, C, T, F, Fut>(f: F) -> Callback<I, C, T>
where
    F: Fn(I, C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    I: 'static,
    C: 'static,
    T: 'static,
{
    Arc::new(move |instance, ctx| f(instance, ctx).boxed())
}

async fn parse_in_host(
    host: &Arc<dyn HostLink>,
    message: ParseVariablesInStringMessage,
) -> Result<ParseVariablesInStringResponse> {
    host.request(method::PARSE_VARIABLES_IN_STRING, &message).await
}

// ─── ActionContext ────────────────────────────────────────────────────────

/// Context for action callbacks and action subscribe/unsubscribe/learn hooks.
#[derive(Clone)]
pub struct ActionContext {
    host: Arc<dyn HostLink>,
    control_id: String,
    action_instance_id: String,
}

impl ActionContext {
    pub(crate) fn new(host: Arc<dyn HostLink>, control_id: &str, action_instance_id: &str) -> Self {
        Self {
            host,
            control_id: control_id.to_string(),
            action_instance_id: action_instance_id.to_string(),
        }
    }

    pub fn control_id(&self) -> &str {
        &self.control_id
    }

    /// Resolve `$(label:variable)` references in `text`, scoped to the
    /// control running this action.
    pub async fn parse_variables_in_string(&self, text: &str) -> Result<String> {
        let response = parse_in_host(
            &self.host,
            ParseVariablesInStringMessage {
                text: text.to_string(),
                control_id: Some(self.control_id.clone()),
                action_instance_id: Some(self.action_instance_id.clone()),
                feedback_instance_id: None,
            },
        )
        .await?;
        Ok(response.text)
    }
}

// ─── Variable dependencies ────────────────────────────────────────────────

/// Variables a feedback's last successful evaluation depended on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReferencedVariables {
    /// Never evaluated, or evaluation referenced nothing.
    #[default]
    None,
    Some(HashSet<String>),
    /// Depends on every variable.
    All,
}

impl ReferencedVariables {
    pub fn intersects(&self, changed: &ChangedVariables) -> bool {
        match self {
            ReferencedVariables::None => false,
            ReferencedVariables::All => !changed.is_empty(),
            ReferencedVariables::Some(ids) => {
                changed.all || ids.iter().any(|id| changed.ids.contains(id))
            }
        }
    }
}

/// Variable ids reported as changed; `all` is set by the wildcard id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedVariables {
    pub all: bool,
    pub ids: HashSet<String>,
}

impl ChangedVariables {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = ChangedVariables::default();
        for id in ids {
            let id = id.into();
            if id == ALL_VARIABLES {
                changed.all = true;
            } else {
                changed.ids.insert(id);
            }
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.ids.is_empty()
    }

    pub fn merge(&mut self, other: &ChangedVariables) {
        self.all |= other.all;
        self.ids.extend(other.ids.iter().cloned());
    }
}

/// Collects the variable ids the host reports while a feedback evaluates.
#[derive(Debug, Clone, Default)]
pub(crate) struct VariableRecorder {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl VariableRecorder {
    fn record(&self, ids: &[String]) {
        self.seen.lock().extend(ids.iter().cloned());
    }

    pub(crate) fn finish(&self) -> ReferencedVariables {
        let seen = std::mem::take(&mut *self.seen.lock());
        if seen.contains(ALL_VARIABLES) {
            ReferencedVariables::All
        } else if seen.is_empty() {
            ReferencedVariables::None
        } else {
            ReferencedVariables::Some(seen)
        }
    }
}

// ─── FeedbackContext ──────────────────────────────────────────────────────

/// Context for feedback callbacks and feedback hooks.
///
/// During an evaluation every variable the host reports as referenced is
/// recorded, so the feedback is rechecked when one of them changes.
#[derive(Clone)]
pub struct FeedbackContext {
    host: Arc<dyn HostLink>,
    control_id: String,
    feedback_instance_id: String,
    recorder: Option<VariableRecorder>,
}

impl FeedbackContext {
    pub(crate) fn new(
        host: Arc<dyn HostLink>,
        control_id: &str,
        feedback_instance_id: &str,
        recorder: Option<VariableRecorder>,
    ) -> Self {
        Self {
            host,
            control_id: control_id.to_string(),
            feedback_instance_id: feedback_instance_id.to_string(),
            recorder,
        }
    }

    pub fn control_id(&self) -> &str {
        &self.control_id
    }

    pub async fn parse_variables_in_string(&self, text: &str) -> Result<String> {
        let response = parse_in_host(
            &self.host,
            ParseVariablesInStringMessage {
                text: text.to_string(),
                control_id: Some(self.control_id.clone()),
                action_instance_id: None,
                feedback_instance_id: Some(self.feedback_instance_id.clone()),
            },
        )
        .await?;
        if let Some(recorder) = &self.recorder {
            recorder.record(&response.variable_ids);
        }
        Ok(response.text)
    }
}
