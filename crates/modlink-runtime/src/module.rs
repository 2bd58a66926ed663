use async_trait::async_trait;
use modlink_core::messages::{HttpRequest, HttpResponse};
use modlink_core::options::InputField;
use modlink_core::upgrade::UpgradeScript;
use serde_json::Value;

/// Device-specific behaviour of a module.
///
/// Definitions, variables and status go through the [`ModuleApi`](crate::ModuleApi)
/// handed to the module's constructor; this trait only covers what the host
/// asks of the module.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Called once per connection, after any pending upgrades ran.
    async fn init(&self, config: Value, is_first_init: bool) -> anyhow::Result<()>;

    async fn destroy(&self) -> anyhow::Result<()>;

    async fn config_updated(&self, config: Value) -> anyhow::Result<()>;

    fn config_fields(&self) -> Vec<InputField>;

    /// Ordered migrations; script `i` moves instances from version `i - 1` to `i`.
    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        Vec::new()
    }

    fn has_http_handler(&self) -> bool {
        false
    }

    async fn handle_http_request(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse::not_found())
    }

    fn has_record_actions_handler(&self) -> bool {
        false
    }

    async fn handle_start_stop_record_actions(&self, _recording: bool) -> anyhow::Result<()> {
        Ok(())
    }
}
