//! Serialises init/destroy/config updates and wires host calls to the managers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use modlink_core::messages::{
    method, ExecuteActionMessage, GetConfigFieldsResponse, HandleHttpRequestMessage,
    HandleHttpRequestResponse, InitMessage, InitResponse, LearnActionMessage, LearnFeedbackMessage,
    LearnResponse, StartStopRecordActionsMessage, UpdateActionInstancesMessage, UpdateConfigMessage,
    UpdateFeedbackInstancesMessage, VariablesChangedMessage,
};
use modlink_core::options::default_values;
use modlink_core::types::{ActionInstance, FeedbackInstance, InstancePatch};
use modlink_core::upgrade::{latest_index, run_upgrades, UpgradeOutcome, UpgradeScript};
use modlink_core::{ModlinkError, RemoteError, Result};
use modlink_ipc::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::api::ModuleApi;
use crate::module::Module;

#[derive(Debug, Default)]
struct Lifecycle {
    initialized: bool,
}

enum InstanceUpdate {
    Actions(InstancePatch<ActionInstance>),
    Feedbacks(InstancePatch<FeedbackInstance>),
    /// The snapshot handed to `init`, already upgraded.
    Replay {
        actions: InstancePatch<ActionInstance>,
        feedbacks: InstancePatch<FeedbackInstance>,
    },
}

struct QueuedUpdate {
    update: InstanceUpdate,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// One module instance as seen from the host.
///
/// `init`, `destroy` and `config_updated` queue on a single async mutex so
/// they never interleave. Instance patches and the post-init replay go
/// through a separate FIFO worker, one at a time, so each patch sees the
/// instances the previous one left behind. Everything else goes straight
/// to the managers.
pub struct ModuleRuntime {
    module: Arc<dyn Module>,
    api: ModuleApi,
    scripts: Vec<UpgradeScript>,
    lifecycle: Mutex<Lifecycle>,
    /// Upgrade index every live instance is known to be at.
    baseline: parking_lot::Mutex<Option<usize>>,
    updates: mpsc::UnboundedSender<QueuedUpdate>,
}

impl ModuleRuntime {
    /// Must be called from within a Tokio runtime.
    pub fn new(module: Arc<dyn Module>, api: ModuleApi) -> Arc<Self> {
        let scripts = module.upgrade_scripts();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let (updates, rx) = mpsc::unbounded_channel();
            tokio::spawn(update_worker(weak.clone(), rx));
            Self {
                module,
                api,
                scripts,
                lifecycle: Mutex::new(Lifecycle::default()),
                baseline: parking_lot::Mutex::new(None),
                updates,
            }
        })
    }

    pub fn api(&self) -> &ModuleApi {
        &self.api
    }

    pub async fn is_initialized(&self) -> bool {
        self.lifecycle.lock().await.initialized
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    pub async fn init(&self, msg: InitMessage) -> Result<InitResponse> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.initialized {
            return Err(ModlinkError::AlreadyInitialized);
        }

        let InitMessage {
            label,
            is_first_init,
            config,
            last_upgrade_index,
            mut actions,
            mut feedbacks,
        } = msg;

        // A fresh config is built from current field defaults, so it never
        // goes through the upgrade scripts.
        let (mut config, upgrade_config) = if is_first_init {
            let mut merged = default_values(&self.module.config_fields());
            if let Value::Object(given) = config {
                merged.extend(given);
            }
            (Value::Object(merged), false)
        } else {
            (config, true)
        };

        let outcome = run_upgrades(
            &live(&actions),
            &live(&feedbacks),
            last_upgrade_index,
            &self.scripts,
            upgrade_config.then_some(&config),
        )?;
        self.send_upgraded(&outcome)?;
        let UpgradeOutcome {
            updated_actions,
            updated_feedbacks,
            updated_config,
        } = outcome;
        if let Some(updated) = updated_config {
            config = updated;
        }
        apply(&mut actions, updated_actions);
        apply(
            &mut feedbacks,
            updated_feedbacks
                .into_iter()
                .map(|(id, f)| (id, f.feedback))
                .collect(),
        );

        info!(label = %label, first = is_first_init, "initialising module");
        self.module
            .init(config.clone(), is_first_init)
            .await
            .map_err(ModlinkError::callback)?;

        lifecycle.initialized = true;
        let new_upgrade_index = latest_index(&self.scripts).or(last_upgrade_index);
        *self.baseline.lock() = new_upgrade_index;

        // Queued before the response goes out, so it runs ahead of any patch
        // the host sends once it knows init succeeded.
        let replay = QueuedUpdate {
            update: InstanceUpdate::Replay { actions, feedbacks },
            done: None,
        };
        if self.updates.send(replay).is_err() {
            warn!("instance update queue closed; skipping replay");
        }

        Ok(InitResponse {
            has_http_handler: self.module.has_http_handler(),
            has_record_actions_handler: self.module.has_record_actions_handler(),
            new_upgrade_index,
            updated_config: config,
        })
    }

    pub async fn destroy(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.initialized {
            return Err(ModlinkError::NotInitialized);
        }
        let result = self.module.destroy().await;
        lifecycle.initialized = false;
        result.map_err(ModlinkError::callback)
    }

    pub async fn config_updated(&self, config: Value) -> Result<()> {
        let lifecycle = self.lifecycle.lock().await;
        if !lifecycle.initialized {
            return Err(ModlinkError::NotInitialized);
        }
        self.module
            .config_updated(config)
            .await
            .map_err(ModlinkError::callback)
    }

    // ─── Instance updates ─────────────────────────────────────────────────

    fn send_upgraded(&self, outcome: &UpgradeOutcome) -> Result<()> {
        let message = outcome.to_message();
        if message.is_empty() {
            return Ok(());
        }
        debug!(
            actions = message.updated_actions.len(),
            feedbacks = message.updated_feedbacks.len(),
            "sending upgraded items"
        );
        self.api.host().notify(method::UPGRADED_ITEMS, &message)
    }

    /// Entries recorded at an older index than the baseline, for the
    /// upgrade pipeline.
    fn stale<T: modlink_core::types::Instance>(&self, patch: &InstancePatch<T>) -> Vec<T> {
        let Some(baseline) = *self.baseline.lock() else {
            return Vec::new();
        };
        patch
            .values()
            .flatten()
            .filter(|i| i.upgrade_index().is_some_and(|index| index < baseline))
            .cloned()
            .collect()
    }

    /// Queue a host patch behind every earlier one. The patch takes its place
    /// in the queue when this is called, not when the future is polled.
    pub fn update_actions(
        &self,
        patch: InstancePatch<ActionInstance>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.enqueue(InstanceUpdate::Actions(patch))
    }

    /// See [`update_actions`](Self::update_actions).
    pub fn update_feedbacks(
        &self,
        patch: InstancePatch<FeedbackInstance>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        self.enqueue(InstanceUpdate::Feedbacks(patch))
    }

    fn enqueue(&self, update: InstanceUpdate) -> impl Future<Output = Result<()>> + Send + 'static {
        let (done, finished) = oneshot::channel();
        let queued = self
            .updates
            .send(QueuedUpdate {
                update,
                done: Some(done),
            })
            .map_err(|_| ModlinkError::ChannelClosed);
        async move {
            queued?;
            finished.await.map_err(|_| ModlinkError::ChannelClosed)?
        }
    }

    async fn apply_update(&self, update: InstanceUpdate) -> Result<()> {
        match update {
            InstanceUpdate::Actions(patch) => self.apply_action_patch(patch).await,
            InstanceUpdate::Feedbacks(patch) => self.apply_feedback_patch(patch).await,
            InstanceUpdate::Replay { actions, feedbacks } => {
                self.api.actions().handle_update_instances(actions).await;
                self.api.feedbacks().handle_update_instances(feedbacks).await;
                Ok(())
            }
        }
    }

    async fn apply_action_patch(&self, mut patch: InstancePatch<ActionInstance>) -> Result<()> {
        let stale = self.stale(&patch);
        if !stale.is_empty() {
            let baseline = *self.baseline.lock();
            let outcome = run_upgrades(&stale, &[], baseline, &self.scripts, None)?;
            self.send_upgraded(&outcome)?;
            apply(&mut patch, outcome.updated_actions);
        }
        self.api.actions().handle_update_instances(patch).await;
        Ok(())
    }

    async fn apply_feedback_patch(&self, mut patch: InstancePatch<FeedbackInstance>) -> Result<()> {
        let stale = self.stale(&patch);
        if !stale.is_empty() {
            let baseline = *self.baseline.lock();
            let outcome = run_upgrades(&[], &stale, baseline, &self.scripts, None)?;
            self.send_upgraded(&outcome)?;
            apply(
                &mut patch,
                outcome
                    .updated_feedbacks
                    .into_iter()
                    .map(|(id, f)| (id, f.feedback))
                    .collect(),
            );
        }
        self.api.feedbacks().handle_update_instances(patch).await;
        Ok(())
    }

    // ─── Host calls ───────────────────────────────────────────────────────

    pub async fn start_stop_record_actions(&self, recording: bool) -> Result<()> {
        self.api.set_recording(recording);
        self.module
            .handle_start_stop_record_actions(recording)
            .await
            .map_err(ModlinkError::callback)
    }

    pub async fn handle_http_request(
        &self,
        msg: HandleHttpRequestMessage,
    ) -> Result<HandleHttpRequestResponse> {
        let response = if self.module.has_http_handler() {
            self.module
                .handle_http_request(msg.request)
                .await
                .map_err(ModlinkError::callback)?
        } else {
            modlink_core::messages::HttpResponse::not_found()
        };
        Ok(HandleHttpRequestResponse { response })
    }

    /// Install a handler on `transport` for every host → module call.
    pub fn register_handlers(self: &Arc<Self>, transport: &Transport) {
        handle(transport, self, method::INIT, |rt, msg: InitMessage| async move {
            rt.init(msg).await
        });
        handle(transport, self, method::DESTROY, |rt, _: Value| async move {
            rt.destroy().await
        });
        handle(
            transport,
            self,
            method::UPDATE_CONFIG,
            |rt, msg: UpdateConfigMessage| async move { rt.config_updated(msg.config).await },
        );
        handle(
            transport,
            self,
            method::UPDATE_ACTIONS,
            |rt, msg: UpdateActionInstancesMessage| rt.update_actions(msg.actions),
        );
        handle(
            transport,
            self,
            method::UPDATE_FEEDBACKS,
            |rt, msg: UpdateFeedbackInstancesMessage| rt.update_feedbacks(msg.feedbacks),
        );
        handle(
            transport,
            self,
            method::EXECUTE_ACTION,
            |rt, msg: ExecuteActionMessage| async move {
                rt.api.actions().execute_action(msg.action).await
            },
        );
        handle(transport, self, method::GET_CONFIG_FIELDS, |rt, _: Value| async move {
            Ok(GetConfigFieldsResponse {
                fields: rt.module.config_fields(),
            })
        });
        handle(
            transport,
            self,
            method::LEARN_ACTION,
            |rt, msg: LearnActionMessage| async move {
                let options = rt.api.actions().learn(msg.action).await?;
                Ok(LearnResponse { options })
            },
        );
        handle(
            transport,
            self,
            method::LEARN_FEEDBACK,
            |rt, msg: LearnFeedbackMessage| async move {
                let options = rt.api.feedbacks().learn(msg.feedback).await?;
                Ok(LearnResponse { options })
            },
        );
        handle(
            transport,
            self,
            method::START_STOP_RECORD_ACTIONS,
            |rt, msg: StartStopRecordActionsMessage| async move {
                rt.start_stop_record_actions(msg.recording).await
            },
        );
        handle(
            transport,
            self,
            method::VARIABLES_CHANGED,
            |rt, msg: VariablesChangedMessage| async move {
                rt.api.feedbacks().handle_variables_changed(&msg.variables_ids);
                Ok(())
            },
        );
        handle(
            transport,
            self,
            method::HANDLE_HTTP_REQUEST,
            |rt, msg: HandleHttpRequestMessage| async move { rt.handle_http_request(msg).await },
        );
    }
}

/// Applies queued instance updates one at a time, in the order they were queued.
async fn update_worker(runtime: Weak<ModuleRuntime>, mut rx: mpsc::UnboundedReceiver<QueuedUpdate>) {
    while let Some(QueuedUpdate { update, done }) = rx.recv().await {
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        let result = runtime.apply_update(update).await;
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

/// Register `f` under `name`, handing it its own reference to the runtime.
/// `f` runs inline in arrival order; the future it returns does not.
fn handle<Req, Resp, F, Fut>(transport: &Transport, runtime: &Arc<ModuleRuntime>, name: &str, f: F)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<ModuleRuntime>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let runtime = Arc::clone(runtime);
    transport.register(name, move |req: Req| {
        let fut = f(Arc::clone(&runtime), req);
        async move { fut.await.map_err(RemoteError::from) }
    });
}

fn live<T: Clone>(patch: &InstancePatch<T>) -> Vec<T> {
    patch.values().flatten().cloned().collect()
}

fn apply<T>(patch: &mut InstancePatch<T>, updated: BTreeMap<String, T>) {
    for (id, instance) in updated {
        patch.insert(id, Some(instance));
    }
}
