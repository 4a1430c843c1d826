//! Event dispatch engine: lifecycle validation, a bounded dispatch queue,
//! a retrying batch delivery worker and an optional realtime listener,
//! behind a session facade.
//!
//! Everything here is single-threaded and runs inside a tokio `LocalSet`.
//! I/O lives behind the port traits; adapters are in `beacon-platform`.

pub mod capture;
pub mod client;
pub mod lifecycle;
pub mod listener;
pub mod ports;
pub mod queue;
pub mod retry;
pub mod session;
pub mod worker;

pub use capture::{CaptureHandler, Callbacks, Notification};
pub use client::Client;
pub use lifecycle::EventOptions;
pub use session::Session;
pub use worker::DeliveryStats;

#[cfg(test)]
mod tests;
