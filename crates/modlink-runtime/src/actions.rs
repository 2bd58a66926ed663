//! Action definitions and live action instances.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use modlink_core::messages::{method, ActionDefinitionInfo, SetActionDefinitionsMessage};
use modlink_core::options::InputField;
use modlink_core::types::{ActionInstance, InstancePatch, OptionValues};
use modlink_core::{ModlinkError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::{callback, ActionContext, Callback};
use crate::host::HostLink;

// ─── ActionDefinition ─────────────────────────────────────────────────────

pub struct ActionDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub options: Vec<InputField>,
    callback: Callback<ActionInstance, ActionContext, ()>,
    subscribe: Option<Callback<ActionInstance, ActionContext, ()>>,
    unsubscribe: Option<Callback<ActionInstance, ActionContext, ()>>,
    learn: Option<Callback<ActionInstance, ActionContext, Option<OptionValues>>>,
}

impl ActionDefinition {
    pub fn new<F, Fut>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionInstance, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            options: Vec::new(),
            callback: callback(f),
            subscribe: None,
            unsubscribe: None,
            learn: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_options(mut self, options: Vec<InputField>) -> Self {
        self.options = options;
        self
    }

    /// Called whenever an instance of this action appears or changes.
    pub fn on_subscribe<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActionInstance, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe = Some(callback(f));
        self
    }

    /// Called with the previous values whenever an instance changes or goes away.
    pub fn on_unsubscribe<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActionInstance, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.unsubscribe = Some(callback(f));
        self
    }

    /// Produce option values from the current device state.
    pub fn on_learn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActionInstance, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<OptionValues>>> + Send + 'static,
    {
        self.learn = Some(callback(f));
        self
    }

    pub fn info(&self) -> ActionDefinitionInfo {
        ActionDefinitionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            options: self.options.clone(),
            has_learn: self.learn.is_some(),
        }
    }
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("options", &self.options.len())
            .field("has_subscribe", &self.subscribe.is_some())
            .field("has_unsubscribe", &self.unsubscribe.is_some())
            .field("has_learn", &self.learn.is_some())
            .finish()
    }
}

// ─── ActionManager ────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    definitions: HashMap<String, Arc<ActionDefinition>>,
    instances: HashMap<String, ActionInstance>,
}

pub struct ActionManager {
    host: Arc<dyn HostLink>,
    state: Mutex<State>,
}

#[derive(Clone, Copy)]
enum Hook {
    Subscribe,
    Unsubscribe,
}

impl ActionManager {
    pub fn new(host: Arc<dyn HostLink>) -> Self {
        Self {
            host,
            state: Mutex::new(State::default()),
        }
    }

    /// Replace every definition and publish the new set to the host.
    pub fn set_definitions(&self, definitions: Vec<ActionDefinition>) -> Result<()> {
        let actions: Vec<ActionDefinitionInfo> = definitions.iter().map(|d| d.info()).collect();
        {
            let mut state = self.state.lock();
            state.definitions = definitions
                .into_iter()
                .map(|d| (d.id.clone(), Arc::new(d)))
                .collect();
        }
        self.host.notify(
            method::SET_ACTION_DEFINITIONS,
            &SetActionDefinitionsMessage { actions },
        )
    }

    fn definition(&self, action_id: &str) -> Option<Arc<ActionDefinition>> {
        self.state.lock().definitions.get(action_id).cloned()
    }

    fn context(&self, action: &ActionInstance) -> ActionContext {
        ActionContext::new(Arc::clone(&self.host), &action.control_id, &action.id)
    }

    pub async fn execute_action(&self, action: ActionInstance) -> Result<()> {
        let definition = self
            .definition(&action.action_id)
            .ok_or_else(|| ModlinkError::UnknownAction(action.action_id.clone()))?;
        debug!(action_id = %action.action_id, instance_id = %action.id, "executing action");
        let ctx = self.context(&action);
        (definition.callback)(action, ctx)
            .await
            .map_err(ModlinkError::callback)
    }

    /// Apply a host-pushed patch, entry by entry in the order the host wrote it.
    pub async fn handle_update_instances(&self, patch: InstancePatch<ActionInstance>) {
        for (id, update) in patch {
            let previous = self.state.lock().instances.get(&id).cloned();
            if let Some(previous) = previous {
                self.run_hook(Hook::Unsubscribe, previous).await;
            }

            match update.filter(|action| !action.disabled) {
                None => {
                    self.state.lock().instances.remove(&id);
                }
                Some(action) => {
                    self.state.lock().instances.insert(id, action.clone());
                    self.run_hook(Hook::Subscribe, action).await;
                }
            }
        }
    }

    /// Run a subscribe/unsubscribe hook, logging and swallowing failures.
    async fn run_hook(&self, hook: Hook, action: ActionInstance) {
        let Some(definition) = self.definition(&action.action_id) else {
            return;
        };
        let (f, label) = match hook {
            Hook::Subscribe => (definition.subscribe.as_ref(), "subscribe"),
            Hook::Unsubscribe => (definition.unsubscribe.as_ref(), "unsubscribe"),
        };
        let Some(f) = f else {
            return;
        };
        let instance_id = action.id.clone();
        let ctx = self.context(&action);
        if let Err(e) = f(action, ctx).await {
            warn!(
                action_id = %definition.id,
                instance_id = %instance_id,
                error = %format!("{e:#}"),
                "action {label} failed"
            );
        }
    }

    /// `Ok(None)` when the action has no learn hook or is unknown.
    pub async fn learn(&self, action: ActionInstance) -> Result<Option<OptionValues>> {
        let Some(definition) = self.definition(&action.action_id) else {
            return Ok(None);
        };
        let Some(learn) = definition.learn.as_ref() else {
            return Ok(None);
        };
        let ctx = self.context(&action);
        learn(action, ctx).await.map_err(ModlinkError::callback)
    }

    pub async fn subscribe_all(&self, action_ids: &[String]) {
        for action in self.matching(action_ids) {
            self.run_hook(Hook::Subscribe, action).await;
        }
    }

    pub async fn unsubscribe_all(&self, action_ids: &[String]) {
        for action in self.matching(action_ids) {
            self.run_hook(Hook::Unsubscribe, action).await;
        }
    }

    /// Instances whose type is in `action_ids`; every instance when empty.
    fn matching(&self, action_ids: &[String]) -> Vec<ActionInstance> {
        let state = self.state.lock();
        let mut out: Vec<ActionInstance> = state
            .instances
            .values()
            .filter(|a| action_ids.is_empty() || action_ids.contains(&a.action_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn instance(&self, id: &str) -> Option<ActionInstance> {
        self.state.lock().instances.get(id).cloned()
    }

    /// Ids of every live (enabled) instance, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().instances.keys().cloned().collect();
        ids.sort();
        ids
    }
}
