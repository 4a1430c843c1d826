//! Concrete adapters for the beacon-core ports.
//!
//! - `http`: batch delivery over HTTPS (reqwest)
//! - `sse`: realtime inbound frames over server-sent events
//! - `memory`: recording transport for tests and dry runs

pub mod connect;
pub mod http;
pub mod memory;
pub mod sse;

pub use connect::{connect, connect_recording};
pub use http::HttpTransport;
pub use memory::RecordingTransport;
pub use sse::SseStreamPort;
