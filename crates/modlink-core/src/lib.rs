pub mod config;
pub mod error;
pub mod messages;
pub mod options;
pub mod types;
pub mod upgrade;

pub use error::{ModlinkError, RemoteError, Result};

/// Protocol version spoken by this runtime. Sent in the `register` handshake
/// and checked against `runtime.api` in the module manifest.
pub const API_VERSION: &str = "1.2.0";
