//! `modlink-ipc` — the wire between a module process and its host.
//!
//! # Architecture
//!
//! ```text
//! Transport       ← call/response correlation, handler table, timeouts
//!     │              outbound envelopes go to an mpsc channel
//!     ▼
//! line channel    ← one JSON envelope per line over any AsyncRead/AsyncWrite
//!     │              (stdin/stdout for a spawned module)
//!     ▼
//! host process
//! ```
//!
//! Payloads inside an envelope are encoded separately by [`codec`] so that
//! dates and errors survive the trip.

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod transport;


pub use channel::{run_line_channel, run_stdio};
pub use envelope::Envelope;
pub use transport::Transport;
