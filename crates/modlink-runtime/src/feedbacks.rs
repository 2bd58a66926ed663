//! Feedback definitions, live feedback instances and the recheck engine.
//!
//! Each feedback instance is either idle or checking. While checking it owns a
//! [`CheckStatus`]; any trigger that arrives meanwhile only marks the status,
//! and a single follow-up evaluation runs once the current one settles. Values
//! are buffered and sent to the host in debounced batches.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use modlink_core::config::RuntimeSettings;
use modlink_core::messages::{
    method, FeedbackDefinitionInfo, FeedbackKind, SetFeedbackDefinitionsMessage,
    UpdateFeedbackValuesMessage,
};
use modlink_core::options::InputField;
use modlink_core::types::{FeedbackInstance, FeedbackValue, InstancePatch, OptionValues, StyleProps};
use modlink_core::{ModlinkError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::context::{
    callback, Callback, ChangedVariables, FeedbackContext, ReferencedVariables, VariableRecorder,
};
use crate::debounce::Debouncer;
use crate::host::HostLink;

// ─── FeedbackDefinition ───────────────────────────────────────────────────

enum Evaluator {
    Boolean {
        default_style: StyleProps,
        callback: Callback<FeedbackInstance, FeedbackContext, bool>,
    },
    Advanced(Callback<FeedbackInstance, FeedbackContext, StyleProps>),
}

pub struct FeedbackDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub options: Vec<InputField>,
    evaluator: Evaluator,
    subscribe: Option<Callback<FeedbackInstance, FeedbackContext, ()>>,
    unsubscribe: Option<Callback<FeedbackInstance, FeedbackContext, ()>>,
    learn: Option<Callback<FeedbackInstance, FeedbackContext, Option<OptionValues>>>,
}

impl FeedbackDefinition {
    fn with_evaluator(id: String, name: String, evaluator: Evaluator) -> Self {
        Self {
            id,
            name,
            description: None,
            options: Vec::new(),
            evaluator,
            subscribe: None,
            unsubscribe: None,
            learn: None,
        }
    }

    /// A feedback that is either on or off; the host applies `default_style`
    /// (overridable per control) while it is on.
    pub fn boolean<F, Fut>(
        id: impl Into<String>,
        name: impl Into<String>,
        default_style: StyleProps,
        f: F,
    ) -> Self
    where
        F: Fn(FeedbackInstance, FeedbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self::with_evaluator(
            id.into(),
            name.into(),
            Evaluator::Boolean {
                default_style,
                callback: callback(f),
            },
        )
    }

    /// A feedback whose result is a set of style properties.
    pub fn advanced<F, Fut>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FeedbackInstance, FeedbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<StyleProps>> + Send + 'static,
    {
        Self::with_evaluator(id.into(), name.into(), Evaluator::Advanced(callback(f)))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_options(mut self, options: Vec<InputField>) -> Self {
        self.options = options;
        self
    }

    pub fn on_subscribe<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FeedbackInstance, FeedbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe = Some(callback(f));
        self
    }

    pub fn on_unsubscribe<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FeedbackInstance, FeedbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.unsubscribe = Some(callback(f));
        self
    }

    pub fn on_learn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FeedbackInstance, FeedbackContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<OptionValues>>> + Send + 'static,
    {
        self.learn = Some(callback(f));
        self
    }

    pub fn info(&self) -> FeedbackDefinitionInfo {
        let kind = match &self.evaluator {
            Evaluator::Boolean { default_style, .. } => FeedbackKind::Boolean {
                default_style: default_style.clone(),
            },
            Evaluator::Advanced(_) => FeedbackKind::Advanced,
        };
        FeedbackDefinitionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            options: self.options.clone(),
            kind,
            has_learn: self.learn.is_some(),
        }
    }

    fn evaluate(
        &self,
        feedback: FeedbackInstance,
        ctx: FeedbackContext,
    ) -> BoxFuture<'static, anyhow::Result<Value>> {
        match &self.evaluator {
            Evaluator::Boolean { callback, .. } => {
                callback(feedback, ctx).map(|r| r.map(Value::Bool)).boxed()
            }
            Evaluator::Advanced(callback) => {
                callback(feedback, ctx).map(|r| r.map(Value::Object)).boxed()
            }
        }
    }
}

impl fmt::Debug for FeedbackDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.info().kind)
            .field("has_learn", &self.learn.is_some())
            .finish()
    }
}

// ─── State ────────────────────────────────────────────────────────────────

struct FeedbackRecord {
    instance: FeedbackInstance,
    referenced: ReferencedVariables,
}

/// Bookkeeping for one in-flight evaluation.
#[derive(Debug, Default)]
struct CheckStatus {
    needs_recheck: bool,
    changed: ChangedVariables,
}

#[derive(Default)]
struct State {
    definitions: HashMap<String, Arc<FeedbackDefinition>>,
    instances: HashMap<String, FeedbackRecord>,
    checking: HashMap<String, CheckStatus>,
}

/// Values waiting for the next debounced flush, latest per instance.
///
/// Shared with the debouncer's flush so a burst still open when the manager
/// goes away is sent rather than lost.
struct Outbox {
    host: Arc<dyn HostLink>,
    values: Mutex<HashMap<String, FeedbackValue>>,
}

struct Inner {
    host: Arc<dyn HostLink>,
    state: Mutex<State>,
    output: Arc<Outbox>,
    debouncer: Debouncer,
    recheck_tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone, Copy)]
enum Hook {
    Subscribe,
    Unsubscribe,
}

// ─── FeedbackManager ──────────────────────────────────────────────────────

/// Owns feedback definitions and instances and decides when each instance is
/// evaluated. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct FeedbackManager {
    inner: Arc<Inner>,
}

impl FeedbackManager {
    pub fn new(host: Arc<dyn HostLink>, settings: &RuntimeSettings) -> Self {
        let debounce = settings.feedback_debounce();
        let max_wait = settings.feedback_max_wait();

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let (recheck_tx, recheck_rx) = mpsc::unbounded_channel();
            tokio::spawn(recheck_worker(weak.clone(), recheck_rx));

            let output = Arc::new(Outbox {
                host: Arc::clone(&host),
                values: Mutex::new(HashMap::new()),
            });
            let outbox = Arc::clone(&output);
            let debouncer = Debouncer::spawn(debounce, max_wait, move || outbox.flush());

            Inner {
                host,
                state: Mutex::new(State::default()),
                output,
                debouncer,
                recheck_tx,
            }
        });

        Self { inner }
    }

    /// Replace every definition and publish the new set to the host.
    pub fn set_definitions(&self, definitions: Vec<FeedbackDefinition>) -> Result<()> {
        let feedbacks: Vec<FeedbackDefinitionInfo> =
            definitions.iter().map(|d| d.info()).collect();
        self.inner.state.lock().definitions = definitions
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();
        self.inner.host.notify(
            method::SET_FEEDBACK_DEFINITIONS,
            &SetFeedbackDefinitionsMessage { feedbacks },
        )
    }

    /// Apply a host-pushed patch in the host's order. Every stored instance is
    /// checked straight after its subscribe hook.
    pub async fn handle_update_instances(&self, patch: InstancePatch<FeedbackInstance>) {
        for (id, update) in patch {
            let previous = self
                .inner
                .state
                .lock()
                .instances
                .get(&id)
                .map(|r| r.instance.clone());
            if let Some(previous) = previous {
                self.run_hook(Hook::Unsubscribe, previous).await;
            }

            match update.filter(|feedback| !feedback.disabled) {
                None => {
                    self.inner.state.lock().instances.remove(&id);
                    self.inner.output.values.lock().remove(&id);
                }
                Some(feedback) => {
                    self.inner.state.lock().instances.insert(
                        id.clone(),
                        FeedbackRecord {
                            instance: feedback.clone(),
                            referenced: ReferencedVariables::None,
                        },
                    );
                    self.run_hook(Hook::Subscribe, feedback).await;
                    self.inner.trigger_check(&id);
                }
            }
        }
    }

    async fn run_hook(&self, hook: Hook, feedback: FeedbackInstance) {
        let Some(definition) = self.inner.definition(&feedback.feedback_id) else {
            return;
        };
        let (f, label) = match hook {
            Hook::Subscribe => (definition.subscribe.as_ref(), "subscribe"),
            Hook::Unsubscribe => (definition.unsubscribe.as_ref(), "unsubscribe"),
        };
        let Some(f) = f else {
            return;
        };
        let instance_id = feedback.id.clone();
        let ctx = self.inner.context(&feedback, None);
        if let Err(e) = f(feedback, ctx).await {
            warn!(
                feedback_id = %definition.id,
                instance_id = %instance_id,
                error = %format!("{e:#}"),
                "feedback {label} failed"
            );
        }
    }

    /// `Ok(None)` when the feedback has no learn hook or is unknown.
    pub async fn learn(&self, feedback: FeedbackInstance) -> Result<Option<OptionValues>> {
        let Some(definition) = self.inner.definition(&feedback.feedback_id) else {
            return Ok(None);
        };
        let Some(learn) = definition.learn.as_ref() else {
            return Ok(None);
        };
        let ctx = self.inner.context(&feedback, None);
        learn(feedback, ctx).await.map_err(ModlinkError::callback)
    }

    /// Check every instance whose type is in `feedback_ids`, or every
    /// instance with a known definition when empty.
    pub fn check_feedbacks(&self, feedback_ids: &[String]) {
        let ids: Vec<String> = {
            let state = self.inner.state.lock();
            state
                .instances
                .iter()
                .filter(|(_, r)| {
                    let type_id = &r.instance.feedback_id;
                    if feedback_ids.is_empty() {
                        state.definitions.contains_key(type_id)
                    } else {
                        feedback_ids.contains(type_id)
                    }
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.inner.trigger_check(&id);
        }
    }

    pub fn check_feedbacks_by_id(&self, instance_ids: &[String]) {
        for id in instance_ids {
            self.inner.trigger_check(id);
        }
    }

    /// Route a variable change: in-flight checks remember it, idle instances
    /// that depend on a changed variable are queued for a recheck.
    pub fn handle_variables_changed(&self, variable_ids: &[String]) {
        let changed = ChangedVariables::from_ids(variable_ids.iter().cloned());
        if changed.is_empty() {
            return;
        }

        let due: Vec<String> = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            for status in state.checking.values_mut() {
                status.changed.merge(&changed);
            }
            state
                .instances
                .iter()
                .filter(|(id, r)| {
                    !state.checking.contains_key(id.as_str()) && r.referenced.intersects(&changed)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        debug!(count = due.len(), "variables changed, rechecking feedbacks");
        for id in due {
            self.inner.queue_recheck(id);
        }
    }

    pub async fn subscribe_all(&self, feedback_ids: &[String]) {
        for feedback in self.matching(feedback_ids) {
            self.run_hook(Hook::Subscribe, feedback).await;
        }
    }

    pub async fn unsubscribe_all(&self, feedback_ids: &[String]) {
        for feedback in self.matching(feedback_ids) {
            self.run_hook(Hook::Unsubscribe, feedback).await;
        }
    }

    fn matching(&self, feedback_ids: &[String]) -> Vec<FeedbackInstance> {
        let state = self.inner.state.lock();
        let mut out: Vec<FeedbackInstance> = state
            .instances
            .values()
            .map(|r| &r.instance)
            .filter(|f| feedback_ids.is_empty() || feedback_ids.contains(&f.feedback_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn instance(&self, id: &str) -> Option<FeedbackInstance> {
        self.inner
            .state
            .lock()
            .instances
            .get(id)
            .map(|r| r.instance.clone())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().instances.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether an evaluation of `id` is in flight.
    pub fn is_checking(&self, id: &str) -> bool {
        self.inner.state.lock().checking.contains_key(id)
    }

    /// Send buffered values now instead of waiting for the debounce.
    pub fn flush(&self) {
        self.inner.output.flush();
    }
}

// ─── Recheck engine ───────────────────────────────────────────────────────

/// Drains deferred rechecks so they never run while the instance map is
/// being iterated.
async fn recheck_worker(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(id) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.trigger_check(&id);
    }
}

impl Inner {
    fn definition(&self, feedback_id: &str) -> Option<Arc<FeedbackDefinition>> {
        self.state.lock().definitions.get(feedback_id).cloned()
    }

    fn context(
        &self,
        feedback: &FeedbackInstance,
        recorder: Option<VariableRecorder>,
    ) -> FeedbackContext {
        FeedbackContext::new(
            Arc::clone(&self.host),
            &feedback.control_id,
            &feedback.id,
            recorder,
        )
    }

    fn queue_recheck(&self, id: String) {
        // The worker only stops once `Inner` is gone.
        let _ = self.recheck_tx.send(id);
    }

    fn trigger_check(self: &Arc<Self>, id: &str) {
        let (feedback, definition) = {
            let mut state = self.state.lock();
            if let Some(status) = state.checking.get_mut(id) {
                status.needs_recheck = true;
                return;
            }
            let Some(record) = state.instances.get(id) else {
                return;
            };
            // Instances of unknown types stay inert.
            let Some(definition) = state.definitions.get(&record.instance.feedback_id).cloned()
            else {
                return;
            };
            let feedback = record.instance.clone();
            state.checking.insert(id.to_string(), CheckStatus::default());
            (feedback, definition)
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.evaluate(feedback, definition).await });
    }

    async fn evaluate(
        self: Arc<Self>,
        feedback: FeedbackInstance,
        definition: Arc<FeedbackDefinition>,
    ) {
        let id = feedback.id.clone();
        let recorder = VariableRecorder::default();
        let ctx = self.context(&feedback, Some(recorder.clone()));

        let result = AssertUnwindSafe(definition.evaluate(feedback, ctx))
            .catch_unwind()
            .await;

        let mut published = false;
        let recheck = {
            let mut state = self.state.lock();
            let status = state.checking.remove(&id).unwrap_or_default();

            match result {
                Ok(Ok(value)) => {
                    if let Some(record) = state.instances.get_mut(&id) {
                        record.referenced = recorder.finish();
                        self.output.values.lock().insert(
                            id.clone(),
                            FeedbackValue {
                                id: id.clone(),
                                control_id: record.instance.control_id.clone(),
                                value,
                            },
                        );
                        published = true;
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        feedback_id = %definition.id,
                        instance_id = %id,
                        error = %format!("{e:#}"),
                        "feedback check failed"
                    );
                }
                Err(_) => {
                    warn!(
                        feedback_id = %definition.id,
                        instance_id = %id,
                        "feedback check panicked"
                    );
                }
            }

            status.needs_recheck
                || state
                    .instances
                    .get(&id)
                    .is_some_and(|r| r.referenced.intersects(&status.changed))
        };

        if published {
            self.debouncer.poke();
        }
        if recheck {
            self.queue_recheck(id);
        }
    }
}

impl Outbox {
    fn flush(&self) {
        let pending = std::mem::take(&mut *self.values.lock());
        if pending.is_empty() {
            return;
        }
        let mut values: Vec<FeedbackValue> = pending.into_values().collect();
        values.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(count = values.len(), "sending feedback values");
        if let Err(e) = self.host.notify(
            method::UPDATE_FEEDBACK_VALUES,
            &UpdateFeedbackValuesMessage { values },
        ) {
            warn!(error = %e, "failed to send feedback values");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHost;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn settings() -> RuntimeSettings {
        RuntimeSettings::default()
    }

    fn feedback(id: &str, feedback_id: &str) -> FeedbackInstance {
        FeedbackInstance {
            id: id.to_string(),
            control_id: format!("bank:{id}"),
            feedback_id: feedback_id.to_string(),
            options: OptionValues::new(),
            disabled: false,
            upgrade_index: None,
            image: None,
        }
    }

    fn add(ids: &[(&str, &str)]) -> InstancePatch<FeedbackInstance> {
        ids.iter()
            .map(|(id, type_id)| (id.to_string(), Some(feedback(id, type_id))))
            .collect()
    }

    fn remove(id: &str) -> InstancePatch<FeedbackInstance> {
        [(id.to_string(), None)].into_iter().collect()
    }

    /// Boolean feedback counting its evaluations, optionally parsing `text`
    /// and sleeping `delay` before answering.
    fn counting(
        type_id: &str,
        counter: Arc<AtomicUsize>,
        text: Option<&'static str>,
        delay: Duration,
    ) -> FeedbackDefinition {
        FeedbackDefinition::boolean(type_id, type_id, StyleProps::new(), move |_, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(text) = text {
                    ctx.parse_variables_in_string(text).await?;
                }
                sleep(delay).await;
                Ok(false)
            }
        })
    }

    async fn settle() {
        sleep(Duration::from_millis(200)).await;
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn never_evaluates_one_feedback_twice_at_once() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host, &settings());
        let started = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (s, r, p) = (started.clone(), running.clone(), peak.clone());
        manager
            .set_definitions(vec![FeedbackDefinition::boolean(
                "slow",
                "Slow",
                StyleProps::new(),
                move |_, _| {
                    let (s, r, p) = (s.clone(), r.clone(), p.clone());
                    async move {
                        s.fetch_add(1, Ordering::SeqCst);
                        let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        r.fetch_sub(1, Ordering::SeqCst);
                        Ok(true)
                    }
                },
            )])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "slow")])).await;
        sleep(Duration::from_millis(1)).await;
        assert!(manager.is_checking("f1"));

        manager.check_feedbacks(&[]);
        manager.check_feedbacks(&[]);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        settle().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!manager.is_checking("f1"));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_one_batched_update_then_stops_after_removal() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host.clone(), &settings());
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        let u = unsubscribed.clone();
        manager
            .set_definitions(vec![FeedbackDefinition::boolean(
                "power",
                "Power",
                StyleProps::new(),
                |_, _| async { Ok(false) },
            )
            .on_unsubscribe(move |_, _| {
                let u = u.clone();
                async move {
                    u.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "power")])).await;
        settle().await;

        let sent = host.sent(method::UPDATE_FEEDBACK_VALUES);
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            json!({"values": [{"id": "f1", "controlId": "bank:f1", "value": false}]})
        );

        manager.handle_update_instances(remove("f1")).await;
        manager.check_feedbacks(&[]);
        settle().await;
        assert_eq!(unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(host.sent(method::UPDATE_FEEDBACK_VALUES).len(), 1);
        assert!(manager.instance_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_message() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host.clone(), &settings());
        manager
            .set_definitions(vec![FeedbackDefinition::advanced("color", "Color", |f, _| async move {
                let mut style = StyleProps::new();
                style.insert("text".into(), json!(f.id));
                Ok(style)
            })])
            .unwrap();

        manager
            .handle_update_instances(add(&[("a", "color"), ("b", "color"), ("c", "color")]))
            .await;
        settle().await;

        let sent = host.sent(method::UPDATE_FEEDBACK_VALUES);
        assert_eq!(sent.len(), 1);
        let values = sent[0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[1]["value"], json!({"text": "b"}));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_instances_are_never_evaluated() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host, &settings());
        let count = Arc::new(AtomicUsize::new(0));
        manager
            .set_definitions(vec![counting("t", count.clone(), None, Duration::ZERO)])
            .unwrap();

        let mut off = feedback("f1", "t");
        off.disabled = true;
        manager
            .handle_update_instances([("f1".to_string(), Some(off))].into_iter().collect())
            .await;
        manager.check_feedbacks(&[]);
        manager.check_feedbacks_by_id(&ids(&["f1"]));
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(manager.instance_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn filters_by_type_and_by_id() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host, &settings());
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        manager
            .set_definitions(vec![
                counting("A", a.clone(), None, Duration::ZERO),
                counting("B", b.clone(), None, Duration::ZERO),
            ])
            .unwrap();
        manager
            .handle_update_instances(add(&[("fa", "A"), ("fb1", "B"), ("fb2", "B")]))
            .await;
        settle().await;
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (1, 2));

        manager.check_feedbacks(&ids(&["A"]));
        settle().await;
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (2, 2));

        manager.check_feedbacks_by_id(&ids(&["fb2"]));
        settle().await;
        assert_eq!((a.load(Ordering::SeqCst), b.load(Ordering::SeqCst)), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn rechecks_only_on_referenced_variables() {
        let host = RecordingHost::new();
        host.set_variable("dev:v1", "on");
        let manager = FeedbackManager::new(host, &settings());
        let uses_v1 = Arc::new(AtomicUsize::new(0));
        let uses_none = Arc::new(AtomicUsize::new(0));
        manager
            .set_definitions(vec![
                counting("v1", uses_v1.clone(), Some("$(dev:v1)"), Duration::ZERO),
                counting("plain", uses_none.clone(), None, Duration::ZERO),
            ])
            .unwrap();
        manager
            .handle_update_instances(add(&[("f1", "v1"), ("f2", "plain")]))
            .await;
        settle().await;
        assert_eq!(uses_v1.load(Ordering::SeqCst), 1);

        manager.handle_variables_changed(&ids(&["dev:v2"]));
        settle().await;
        assert_eq!(uses_v1.load(Ordering::SeqCst), 1);

        manager.handle_variables_changed(&ids(&["dev:v1"]));
        settle().await;
        assert_eq!(uses_v1.load(Ordering::SeqCst), 2);

        manager.handle_variables_changed(&ids(&["*"]));
        settle().await;
        assert_eq!(uses_v1.load(Ordering::SeqCst), 3);
        assert_eq!(uses_none.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_check_triggers_one_recheck() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host, &settings());
        let count = Arc::new(AtomicUsize::new(0));
        manager
            .set_definitions(vec![counting(
                "slow",
                count.clone(),
                Some("$(dev:level)"),
                Duration::from_millis(50),
            )])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "slow")])).await;
        sleep(Duration::from_millis(10)).await;
        assert!(manager.is_checking("f1"));

        // Not referenced yet when the check started; the accumulator still
        // catches it once the evaluation reports its dependencies.
        manager.handle_variables_changed(&ids(&["dev:level"]));
        manager.handle_variables_changed(&ids(&["dev:level"]));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_check_publishes_nothing_and_keeps_dependencies() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host.clone(), &settings());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager
            .set_definitions(vec![FeedbackDefinition::boolean(
                "flaky",
                "Flaky",
                StyleProps::new(),
                move |_, ctx| {
                    let c = c.clone();
                    async move {
                        ctx.parse_variables_in_string("$(dev:x)").await?;
                        let n = c.fetch_add(1, Ordering::SeqCst);
                        anyhow::ensure!(n == 0, "device timeout");
                        Ok(true)
                    }
                },
            )])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "flaky")])).await;
        settle().await;
        assert_eq!(host.sent(method::UPDATE_FEEDBACK_VALUES).len(), 1);

        manager.check_feedbacks(&[]);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(host.sent(method::UPDATE_FEEDBACK_VALUES).len(), 1);

        manager.handle_variables_changed(&ids(&["dev:x"]));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_wedge_the_instance() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host, &settings());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager
            .set_definitions(vec![FeedbackDefinition::boolean(
                "boom",
                "Boom",
                StyleProps::new(),
                move |_, _| {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) == 0 {
                            panic!("driver bug");
                        }
                        Ok(true)
                    }
                },
            )])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "boom")])).await;
        settle().await;
        assert!(!manager.is_checking("f1"));

        manager.check_feedbacks_by_id(&ids(&["f1"]));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_types_are_inert() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host.clone(), &settings());
        manager.set_definitions(Vec::new()).unwrap();

        manager.handle_update_instances(add(&[("f1", "ghost")])).await;
        manager.check_feedbacks(&ids(&["ghost"]));
        settle().await;

        assert_eq!(manager.instance_ids(), ids(&["f1"]));
        assert!(host.sent(method::UPDATE_FEEDBACK_VALUES).is_empty());
        assert_eq!(manager.learn(feedback("f1", "ghost")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn definitions_describe_kind() {
        let host = RecordingHost::new();
        let manager = FeedbackManager::new(host.clone(), &settings());
        let mut style = StyleProps::new();
        style.insert("bgcolor".into(), json!(0xff0000));
        manager
            .set_definitions(vec![FeedbackDefinition::boolean("on", "On", style, |_, _| async {
                Ok(true)
            })
            .on_learn(|_, _| async { Ok(None) })])
            .unwrap();

        let sent = host.sent(method::SET_FEEDBACK_DEFINITIONS);
        let info = &sent[0]["feedbacks"][0];
        assert_eq!(info["type"], "boolean");
        assert_eq!(info["defaultStyle"]["bgcolor"], 0xff0000);
        assert_eq!(info["hasLearn"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_manager_sends_buffered_values() {
        let host = RecordingHost::new();
        let slow = RuntimeSettings {
            feedback_debounce_ms: 1_000,
            feedback_max_wait_ms: 1_000,
            ..settings()
        };
        let manager = FeedbackManager::new(host.clone(), &slow);
        manager
            .set_definitions(vec![FeedbackDefinition::boolean(
                "on",
                "On",
                StyleProps::new(),
                |_, _| async { Ok(true) },
            )])
            .unwrap();

        manager.handle_update_instances(add(&[("f1", "on")])).await;
        sleep(Duration::from_millis(5)).await;
        assert!(host.sent(method::UPDATE_FEEDBACK_VALUES).is_empty());

        drop(manager);
        sleep(Duration::from_millis(5)).await;
        let sent = host.sent(method::UPDATE_FEEDBACK_VALUES);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["values"][0]["value"], true);
    }
}
