use serde::{Deserialize, Serialize};

// ─── Envelope ─────────────────────────────────────────────────────────────

/// One message on the channel, in either direction.
///
/// `payload` is already-encoded text (see [`crate::codec`]); the envelope
/// itself is plain JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Call {
        name: String,
        payload: String,
        /// Absent for fire-and-forget calls.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        callback_id: String,
        success: bool,
        payload: String,
    },
}

impl Envelope {
    pub fn name(&self) -> Option<&str> {
        match self {
            Envelope::Call { name, .. } => Some(name),
            Envelope::Response { .. } => None,
        }
    }

    pub fn callback_id(&self) -> Option<&str> {
        match self {
            Envelope::Call { callback_id, .. } => callback_id.as_deref(),
            Envelope::Response { callback_id, .. } => Some(callback_id),
        }
    }
}
