//! A small counter module used by `modlink demo` and as a reference for
//! module authors.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use modlink_core::messages::{HttpRequest, HttpResponse};
use modlink_core::options::{InputField, VisibilityRule};
use modlink_core::types::{InstanceStatus, LogLevel, OptionValues, StyleProps, VariableDefinition};
use modlink_core::upgrade::{script, ActionPatch, UpgradeScript, UpgradeScriptResult};
use modlink_runtime::{ActionDefinition, FeedbackDefinition, Module, ModuleApi};
use serde_json::{json, Value};

const COUNT_VARIABLE: &str = "count";

fn number(options: &OptionValues, key: &str, fallback: i64) -> i64 {
    options
        .get(key)
        .and_then(Value::as_f64)
        .map_or(fallback, |n| n as i64)
}

struct Shared {
    count: AtomicI64,
    step: AtomicI64,
}

impl Shared {
    fn publish(&self, api: &ModuleApi) -> modlink_core::Result<()> {
        let count = self.count.load(Ordering::SeqCst);
        api.set_variable_values([(COUNT_VARIABLE, Some(json!(count)))])?;
        api.check_feedbacks(&["above", "count_text"]);
        Ok(())
    }
}

pub struct Counter {
    api: ModuleApi,
    shared: Arc<Shared>,
}

impl Counter {
    pub fn new(api: ModuleApi) -> Self {
        let shared = Arc::new(Shared {
            count: AtomicI64::new(0),
            step: AtomicI64::new(1),
        });
        if let Err(e) = register_definitions(&api, &shared) {
            tracing::error!(error = %e, "failed to register definitions");
        }
        Self { api, shared }
    }

    fn apply_config(&self, config: &Value) {
        let step = config
            .get("step")
            .and_then(Value::as_f64)
            .map_or(1, |n| n as i64);
        self.shared.step.store(step, Ordering::SeqCst);
    }
}

fn register_definitions(api: &ModuleApi, shared: &Arc<Shared>) -> modlink_core::Result<()> {
    let (inc_api, inc_shared) = (api.clone(), Arc::clone(shared));
    let (reset_api, reset_shared) = (api.clone(), Arc::clone(shared));
    let learn_shared = Arc::clone(shared);

    api.set_action_definitions(vec![
        ActionDefinition::new("increment", "Increment", move |action, _| {
            let (api, shared) = (inc_api.clone(), Arc::clone(&inc_shared));
            async move {
                let step = shared.step.load(Ordering::SeqCst);
                let amount = if action.options.get("use_step") == Some(&Value::Bool(true)) {
                    step
                } else {
                    number(&action.options, "amount", 1)
                };
                shared.count.fetch_add(amount, Ordering::SeqCst);
                if api.is_recording() {
                    api.record_action("increment", action.options.clone(), None)?;
                }
                shared.publish(&api)?;
                Ok(())
            }
        })
        .with_description("Add to the counter")
        .with_options(vec![
            InputField::checkbox("use_step", "Use configured step", false),
            InputField::number("amount", "Amount", 1.0, -1000.0, 1000.0)
                .visible_when(VisibilityRule::Not {
                    rule: Box::new(VisibilityRule::truthy("use_step")),
                }),
        ]),
        ActionDefinition::new("reset", "Reset", move |_, _| {
            let (api, shared) = (reset_api.clone(), Arc::clone(&reset_shared));
            async move {
                shared.count.store(0, Ordering::SeqCst);
                shared.publish(&api)?;
                Ok(())
            }
        })
        .on_learn(move |_, _| {
            let shared = Arc::clone(&learn_shared);
            async move {
                let mut options = OptionValues::new();
                options.insert("count".into(), json!(shared.count.load(Ordering::SeqCst)));
                Ok(Some(options))
            }
        }),
    ])?;

    let above_shared = Arc::clone(shared);
    let text_shared = Arc::clone(shared);
    let mut highlight = StyleProps::new();
    highlight.insert("bgcolor".into(), json!(0xcc0000));
    highlight.insert("color".into(), json!(0xffffff));

    api.set_feedback_definitions(vec![
        FeedbackDefinition::boolean("above", "Count above threshold", highlight, move |fb, _| {
            let shared = Arc::clone(&above_shared);
            async move {
                let threshold = number(&fb.options, "threshold", 10);
                Ok(shared.count.load(Ordering::SeqCst) >= threshold)
            }
        })
        .with_options(vec![InputField::number(
            "threshold",
            "Threshold",
            10.0,
            -100000.0,
            100000.0,
        )]),
        FeedbackDefinition::advanced("count_text", "Show count", move |fb, ctx| {
            let shared = Arc::clone(&text_shared);
            async move {
                let prefix = fb
                    .options
                    .get("prefix")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let prefix = ctx.parse_variables_in_string(&prefix).await?;
                let mut style = StyleProps::new();
                style.insert(
                    "text".into(),
                    json!(format!("{prefix}{}", shared.count.load(Ordering::SeqCst))),
                );
                Ok(style)
            }
        })
        .with_options(vec![InputField::text("prefix", "Prefix", "")]),
    ])?;

    api.set_variable_definitions(vec![VariableDefinition::new(COUNT_VARIABLE, "Current count")])?;
    api.set_preset_definitions(vec![json!({
        "type": "button",
        "category": "Counter",
        "name": "Increment",
        "style": {"text": "+1"},
        "steps": [{"down": [{"actionId": "increment", "options": {"amount": 1}}]}],
        "feedbacks": [{"feedbackId": "above", "options": {"threshold": 10}}],
    })])?;
    Ok(())
}

/// Script 0: the first release called the increment action `inc`.
fn rename_inc() -> UpgradeScript {
    script(|props| {
        let mut result = UpgradeScriptResult::default();
        for action in props.actions.iter().filter(|a| a.action_id == "inc") {
            result.updated_actions.push(ActionPatch {
                id: action.id.clone(),
                action_id: "increment".into(),
                options: action.options.clone(),
            });
        }
        Ok(result)
    })
}

#[async_trait]
impl Module for Counter {
    async fn init(&self, config: Value, is_first_init: bool) -> anyhow::Result<()> {
        self.apply_config(&config);
        if is_first_init {
            self.api.log(LogLevel::Info, "counter created")?;
        }
        self.shared.publish(&self.api)?;
        self.api.update_status(InstanceStatus::Ok, None)?;
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.api.log(LogLevel::Debug, "counter destroyed")?;
        Ok(())
    }

    async fn config_updated(&self, config: Value) -> anyhow::Result<()> {
        self.apply_config(&config);
        Ok(())
    }

    fn config_fields(&self) -> Vec<InputField> {
        vec![
            InputField::text("label", "Label", "Counter"),
            InputField::number("step", "Step", 1.0, 1.0, 100.0)
                .with_tooltip("Used by increment actions set to the configured step"),
        ]
    }

    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        vec![rename_inc()]
    }

    fn has_http_handler(&self) -> bool {
        true
    }

    async fn handle_http_request(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        if request.method == "GET" && request.path == "/count" {
            let mut response = HttpResponse::not_found();
            response.status = 200;
            response.body = Some(self.shared.count.load(Ordering::SeqCst).to_string());
            return Ok(response);
        }
        Ok(HttpResponse::not_found())
    }

    fn has_record_actions_handler(&self) -> bool {
        true
    }

    async fn handle_start_stop_record_actions(&self, recording: bool) -> anyhow::Result<()> {
        tracing::info!(recording, "action recording toggled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modlink_core::config::RuntimeSettings;
    use modlink_core::types::ActionInstance;
    use modlink_ipc::{Envelope, Transport};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// The receiver must stay alive or every send fails.
    fn counter() -> (Counter, UnboundedReceiver<Envelope>) {
        let (transport, outbound) = Transport::channel(Duration::from_secs(1));
        let api = ModuleApi::new(Arc::new(transport), &RuntimeSettings::default());
        (Counter::new(api), outbound)
    }

    fn action(action_id: &str, options: Value) -> ActionInstance {
        ActionInstance {
            id: "a1".into(),
            control_id: "page1:b1".into(),
            action_id: action_id.into(),
            options: options.as_object().cloned().unwrap_or_default(),
            disabled: false,
            upgrade_index: None,
        }
    }

    #[tokio::test]
    async fn increment_and_reset_update_the_variable() {
        let (counter, _outbound) = counter();
        counter.init(json!({"step": 5}), true).await.unwrap();
        let actions = counter.api.actions();

        actions
            .execute_action(action("increment", json!({"amount": 3})))
            .await
            .unwrap();
        actions
            .execute_action(action("increment", json!({"use_step": true})))
            .await
            .unwrap();
        assert_eq!(counter.api.get_variable_value(COUNT_VARIABLE), Some(json!(8)));

        actions.execute_action(action("reset", json!({}))).await.unwrap();
        assert_eq!(counter.api.get_variable_value(COUNT_VARIABLE), Some(json!(0)));
    }

    #[tokio::test]
    async fn http_handler_serves_the_count() {
        let (counter, _outbound) = counter();
        let request = HttpRequest {
            method: "GET".into(),
            path: "/count".into(),
            headers: Default::default(),
            query: Default::default(),
            body: None,
        };
        let response = counter.handle_http_request(request.clone()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some("0"));

        let missing = HttpRequest {
            path: "/nope".into(),
            ..request
        };
        assert_eq!(counter.handle_http_request(missing).await.unwrap().status, 404);
    }

    #[test]
    fn rename_script_only_touches_old_actions() {
        let old = action("inc", json!({"amount": 2}));
        let current = ActionInstance {
            id: "a2".into(),
            ..action("increment", json!({}))
        };
        let result = rename_inc()(modlink_core::upgrade::UpgradeScriptProps {
            config: None,
            actions: vec![&old, &current],
            feedbacks: Vec::new(),
        })
        .unwrap();
        assert_eq!(result.updated_actions.len(), 1);
        assert_eq!(result.updated_actions[0].action_id, "increment");
        assert_eq!(result.updated_actions[0].options["amount"], 2);
    }
}
