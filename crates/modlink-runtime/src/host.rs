use async_trait::async_trait;
use modlink_core::Result;
use modlink_ipc::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

// ─── HostLink ─────────────────────────────────────────────────────────────

/// The managers' only way to reach the host.
///
/// Implemented by [`Transport`]; tests substitute a recorder. Payloads are
/// passed as JSON values so the trait stays object safe; use the typed
/// helpers on `dyn HostLink` at call sites.
#[async_trait]
pub trait HostLink: Send + Sync + 'static {
    /// Fire-and-forget call.
    fn send(&self, name: &str, payload: Value) -> Result<()>;

    /// Correlated call, resolved with the host's response payload.
    async fn call(&self, name: &str, payload: Value) -> Result<Value>;
}

#[async_trait]
impl HostLink for Transport {
    fn send(&self, name: &str, payload: Value) -> Result<()> {
        self.call_no_response(name, &payload)
    }

    async fn call(&self, name: &str, payload: Value) -> Result<Value> {
        Transport::call(self, name, &payload).await
    }
}

impl dyn HostLink {
    pub fn notify<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        self.send(name, serde_json::to_value(payload)?)
    }

    pub async fn request<Req, Resp>(&self, name: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let value = self.call(name, serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(value)?)
    }
}
