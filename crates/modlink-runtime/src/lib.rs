//! `modlink-runtime` — everything that runs inside a module process.
//!
//! # Architecture
//!
//! ```text
//! host ──▶ Transport ──▶ ModuleRuntime (init / destroy / configUpdated, one at a time)
//!                           │  upgrade pipeline on incoming snapshots
//!                           ▼
//!              ActionManager / FeedbackManager ──▶ module callbacks
//!                           │
//!                           ▼
//!                 HostLink (send / call) ──▶ host
//! ```
//!
//! A module implements [`Module`] and registers its definitions through the
//! [`ModuleApi`] handed to its constructor; [`run_module`] does the rest.

pub mod actions;
pub mod api;
pub mod context;
pub mod debounce;
pub mod entrypoint;
pub mod feedbacks;
pub mod host;
pub mod lifecycle;
pub mod module;

#[cfg(test)]
pub(crate) mod testing;

pub use actions::{ActionDefinition, ActionManager};
pub use api::ModuleApi;
pub use context::{ActionContext, FeedbackContext};
pub use entrypoint::{run_module, serve, ConnectionParams, StartupError};
pub use feedbacks::{FeedbackDefinition, FeedbackManager};
pub use host::HostLink;
pub use lifecycle::ModuleRuntime;
pub use module::Module;

pub use modlink_core as core;
