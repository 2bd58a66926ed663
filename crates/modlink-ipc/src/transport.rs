use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use modlink_core::{ModlinkError, RemoteError, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::codec;
use crate::envelope::Envelope;

type CallOutcome = std::result::Result<Value, RemoteError>;
type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, CallOutcome> + Send + Sync>;

// ─── PendingCall ──────────────────────────────────────────────────────────

/// An outbound call waiting for its response.
struct PendingCall {
    name: String,
    tx: oneshot::Sender<CallOutcome>,
}

/// Removes the pending entry when the awaiting future finishes or is
/// dropped, so a timed-out or cancelled call never lingers in the table.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingCall>>,
    callback_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.callback_id);
    }
}

// ─── Transport ────────────────────────────────────────────────────────────

/// Call/response transport over one duplex channel.
///
/// Outbound envelopes are pushed to the `mpsc` sender given at construction;
/// whoever owns the receiving end writes them to the real channel. Inbound
/// envelopes are fed in through [`Transport::on_message`].
///
/// Cheap to clone; all clones share the same pending-call and handler tables.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: Mutex<HashMap<String, PendingCall>>,
    handlers: RwLock<HashMap<String, Handler>>,
    call_timeout: Duration,
}

impl Transport {
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>, call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbound,
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                call_timeout,
            }),
        }
    }

    /// Create a transport together with the receiver its outbound envelopes
    /// arrive on.
    pub fn channel(call_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, call_timeout), rx)
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Number of outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    // ── Handlers ──

    /// Register the handler for inbound calls named `name`, replacing any
    /// previous one. The payload is decoded into `Req`; the handler's output
    /// is encoded as the response payload.
    ///
    /// `handler` itself is invoked inline, in the order calls arrive; only
    /// the future it returns runs on its own task. Work done before that
    /// future is built is therefore sequenced with the channel.
    pub fn register<Req, Resp, F, Fut>(&self, name: &str, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, RemoteError>> + Send + 'static,
    {
        let call_name = name.to_string();
        let erased: Handler = Arc::new(move |payload: Value| {
            let request: Req = match codec::decode_for_call(&call_name, payload) {
                Ok(request) => request,
                Err(e) => return futures::future::ready(Err::<Value, _>(e)).boxed(),
            };
            let response = handler(request);
            async move {
                let response = response.await?;
                serde_json::to_value(response)
                    .map_err(|e| RemoteError::new(format!("failed to encode response: {e}")))
            }
            .boxed()
        });
        self.inner.handlers.write().insert(name.to_string(), erased);
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    // ── Outbound ──

    /// Send a call the remote side must not answer.
    pub fn call_no_response<Req: Serialize + ?Sized>(&self, name: &str, payload: &Req) -> Result<()> {
        let envelope = Envelope::Call {
            name: name.to_string(),
            payload: codec::encode(payload)?,
            callback_id: None,
        };
        self.inner
            .outbound
            .send(envelope)
            .map_err(|_| ModlinkError::ChannelClosed)
    }

    /// Call with the default timeout and decode the response as `Resp`.
    pub async fn call<Req, Resp>(&self, name: &str, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = self.inner.call_timeout;
        self.call_with_timeout(name, payload, timeout, || ModlinkError::Timeout {
            name: name.to_string(),
            after_ms: timeout.as_millis() as u64,
        })
        .await
    }

    /// Call and wait at most `timeout`. On timeout the call fails with the
    /// error produced by `on_timeout`, and any late response is discarded.
    pub async fn call_with_timeout<Req, Resp, F>(
        &self,
        name: &str,
        payload: &Req,
        timeout: Duration,
        on_timeout: F,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
        F: FnOnce() -> ModlinkError,
    {
        let payload = codec::encode(payload)?;
        let callback_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.inner.pending.lock().insert(
            callback_id.clone(),
            PendingCall {
                name: name.to_string(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            callback_id: callback_id.clone(),
        };

        tracing::debug!(name, callback_id = %callback_id, "ipc call");
        self.inner
            .outbound
            .send(Envelope::Call {
                name: name.to_string(),
                payload,
                callback_id: Some(callback_id),
            })
            .map_err(|_| ModlinkError::ChannelClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(remote))) => Err(remote.into()),
            // Sender dropped: the transport was shut down.
            Ok(Err(_)) => Err(ModlinkError::ChannelClosed),
            Err(_) => {
                tracing::debug!(name, "ipc call timed out");
                Err(on_timeout())
            }
        }
    }

    // ── Inbound ──

    /// Dispatch one inbound envelope.
    ///
    /// Handlers are entered in arrival order; the futures they return run on
    /// their own tasks so a slow handler never blocks the reader.
    pub fn on_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::Call {
                name,
                payload,
                callback_id,
            } => self.handle_call(name, payload, callback_id),
            Envelope::Response {
                callback_id,
                success,
                payload,
            } => self.handle_response(&callback_id, success, &payload),
        }
    }

    fn handle_call(&self, name: String, payload: String, callback_id: Option<String>) {
        let handler = self.inner.handlers.read().get(&name).cloned();
        let Some(handler) = handler else {
            tracing::debug!(name = %name, "no handler for inbound call");
            if let Some(callback_id) = callback_id {
                let err = RemoteError::from(ModlinkError::UnknownCommand(name));
                self.respond(callback_id, Err(err));
            }
            return;
        };

        let call = match codec::decode_value(&payload) {
            Ok(value) => handler(value),
            Err(e) => {
                let err = RemoteError::new(format!("invalid payload for '{name}': {e}"));
                futures::future::ready(Err::<Value, _>(err)).boxed()
            }
        };
        let transport = self.clone();
        tokio::spawn(async move {
            let outcome = call.await;
            match callback_id {
                Some(callback_id) => transport.respond(callback_id, outcome),
                None => {
                    if let Err(e) = outcome {
                        tracing::warn!(name = %name, error = %e.message, "one-way call failed");
                    }
                }
            }
        });
    }

    fn handle_response(&self, callback_id: &str, success: bool, payload: &str) {
        let Some(pending) = self.inner.pending.lock().remove(callback_id) else {
            // Expected after a timeout.
            tracing::debug!(callback_id, "response for unknown or expired call");
            return;
        };

        let outcome = if success {
            codec::decode_value(payload).map_err(|e| {
                RemoteError::new(format!("invalid response payload for '{}': {e}", pending.name))
            })
        } else {
            Err(codec::decode_error(payload))
        };
        let _ = pending.tx.send(outcome);
    }

    fn respond(&self, callback_id: String, outcome: CallOutcome) {
        let (success, payload) = match outcome {
            Ok(value) => match codec::encode(&value) {
                Ok(text) => (true, text),
                Err(e) => (false, codec::encode_error(&RemoteError::from(e))),
            },
            Err(err) => (false, codec::encode_error(&err)),
        };
        if self
            .inner
            .outbound
            .send(Envelope::Response {
                callback_id,
                success,
                payload,
            })
            .is_err()
        {
            tracing::debug!("response dropped: ipc channel closed");
        }
    }

    /// Fail every outstanding call with [`ModlinkError::ChannelClosed`].
    pub fn shutdown(&self) {
        let drained: Vec<PendingCall> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        // Dropping the senders wakes the waiters.
        drop(drained);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
