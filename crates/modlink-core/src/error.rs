use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModlinkError {
    #[error("module already initialized")]
    AlreadyInitialized,

    #[error("module not initialized")]
    NotInitialized,

    #[error("actions are not being recorded")]
    NotRecording,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("call '{name}' timed out after {after_ms}ms")]
    Timeout { name: String, after_ms: u64 },

    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },

    #[error("ipc channel closed")]
    ChannelClosed,

    #[error("upgrade script {index} failed: {message}")]
    Upgrade { index: usize, message: String },

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("{0}")]
    Callback(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModlinkError>;

impl ModlinkError {
    /// Wrap a failure returned by module-supplied code.
    pub fn callback(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        ModlinkError::Callback(format!("{err:#}"))
    }
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// An error as it travels across the process boundary.
///
/// Only the message and an optional stack/context survive the trip; the
/// receiving side rebuilds a [`ModlinkError::Remote`] from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl From<&ModlinkError> for RemoteError {
    fn from(err: &ModlinkError) -> Self {
        match err {
            ModlinkError::Remote { message, stack } => RemoteError {
                message: message.clone(),
                stack: stack.clone(),
            },
            other => RemoteError::new(other.to_string()),
        }
    }
}

impl From<ModlinkError> for RemoteError {
    fn from(err: ModlinkError) -> Self {
        RemoteError::from(&err)
    }
}

impl From<anyhow::Error> for RemoteError {
    fn from(err: anyhow::Error) -> Self {
        let chain: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        RemoteError {
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

impl From<RemoteError> for ModlinkError {
    fn from(err: RemoteError) -> Self {
        ModlinkError::Remote {
            message: err.message,
            stack: err.stack,
        }
    }
}
