//! Port traits — the hexagonal architecture boundary.
//!
//! These traits are defined here in `beacon-core` (pure Rust).
//! Implementations live in `beacon-platform` (HTTP / SSE adapters).
//! The core never imports platform code; it only depends on these traits.

use std::pin::Pin;
use std::time::Duration;
use async_trait::async_trait;
use futures::Stream;
use beacon_types::{
    Result,
    event::Event,
    inbound::InboundFrame,
};

// ─── Outbound Transport Port ─────────────────────────────────

/// Outcome of sending one batch to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    Accepted,
    /// HTTP 429; `retry_after` overrides the computed backoff when present
    RateLimited { retry_after: Option<Duration> },
    /// 4xx other than 429 — never retried
    ClientError { status: u16, message: String },
    /// 5xx
    ServerError { status: u16, message: String },
    /// The request never produced a response
    NetworkError(String),
}

impl DeliveryResult {
    /// Network errors, 5xx and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryResult::RateLimited { .. }
                | DeliveryResult::ServerError { .. }
                | DeliveryResult::NetworkError(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryResult::Accepted => None,
            DeliveryResult::RateLimited { .. } => Some(429),
            DeliveryResult::ClientError { status, .. } => Some(*status),
            DeliveryResult::ServerError { status, .. } => Some(*status),
            DeliveryResult::NetworkError(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            DeliveryResult::Accepted => "accepted".to_string(),
            DeliveryResult::RateLimited { .. } => "rate limited".to_string(),
            DeliveryResult::ClientError { message, .. } => message.clone(),
            DeliveryResult::ServerError { message, .. } => message.clone(),
            DeliveryResult::NetworkError(message) => message.clone(),
        }
    }
}

#[async_trait(?Send)]
pub trait TransportPort {
    /// Send one ordered batch as a single logical request.
    async fn send_batch(&self, events: &[Event]) -> DeliveryResult;

    /// Name of this transport (for logging/debug)
    fn transport_name(&self) -> &str;
}

// ─── Inbound Stream Port ─────────────────────────────────────

/// Decoded frames from the realtime connection. An `Err` item is a malformed
/// frame or a connection-level failure; end of stream means the server closed it.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<InboundFrame>>>>;

#[async_trait(?Send)]
pub trait StreamPort {
    /// Open a stream scoped to one session. The session id is the handshake.
    async fn open_stream(&self, session_id: &str) -> Result<InboundStream>;
}
