use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::{BeaconError, Result};
use crate::properties::Properties;

pub const DEFAULT_SERVER_ENDPOINT: &str = "https://app.mindlytics.ai";

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_key: String,
    pub project_id: String,
    #[serde(default)]
    pub server_endpoint: Option<String>,
    /// Realtime stream base URL; falls back to `server_endpoint`.
    #[serde(default)]
    pub stream_endpoint: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            server_endpoint: None,
            stream_endpoint: None,
            debug: false,
            queue: QueueConfig::default(),
            delivery: DeliveryConfig::default(),
            listener: ListenerConfig::default(),
        }
    }

    pub fn server_url(&self) -> &str {
        self.server_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_SERVER_ENDPOINT)
            .trim_end_matches('/')
    }

    pub fn stream_url(&self) -> &str {
        self.stream_endpoint
            .as_deref()
            .map(|s| s.trim_end_matches('/'))
            .unwrap_or_else(|| self.server_url())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(BeaconError::Config("api_key must not be empty".to_string()));
        }
        if self.project_id.trim().is_empty() {
            return Err(BeaconError::Config("project_id must not be empty".to_string()));
        }
        if self.queue.capacity == 0 {
            return Err(BeaconError::Config("queue.capacity must be at least 1".to_string()));
        }
        if self.delivery.max_batch_size == 0 {
            return Err(BeaconError::Config(
                "delivery.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(BeaconError::Config(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.delivery.jitter) {
            return Err(BeaconError::Config(
                "delivery.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Dispatch queue ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            backpressure: Backpressure::DropOldest,
        }
    }
}

/// What `enqueue` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backpressure {
    /// Evict the oldest unsent event and count it as dropped.
    DropOldest,
    /// Suspend the caller until space frees up. If the wait expires the
    /// incoming event is dropped and counted.
    Block { timeout_ms: u64 },
}

impl Backpressure {
    pub fn block() -> Self {
        Backpressure::Block { timeout_ms: 5_000 }
    }
}

// ─── Delivery worker ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub max_batch_size: usize,
    /// How long a partial batch waits for more events.
    pub batch_timeout_ms: u64,
    /// Total send attempts per batch, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Ceiling on the summed retry delays for one batch.
    pub max_total_wait_ms: u64,
    /// Fractional jitter applied to each computed backoff (0.2 = ±20%).
    pub jitter: f64,
    pub flush_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            batch_timeout_ms: 250,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_total_wait_ms: 60_000,
            jitter: 0.2,
            flush_timeout_ms: 30_000,
        }
    }
}

impl DeliveryConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }
}

// ─── Realtime listener ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Consecutive failed connections tolerated before the listener gives up.
    pub max_reconnects: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long `flush` waits for the session-ended acknowledgment.
    pub ack_grace_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            ack_grace_ms: 10_000,
        }
    }
}

impl ListenerConfig {
    pub fn ack_grace(&self) -> Duration {
        Duration::from_millis(self.ack_grace_ms)
    }
}

// ─── Session ─────────────────────────────────────────────────

/// Per-session settings supplied at creation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Caller-supplied id; a UUID is generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Expected to be stable per physical client.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub attributes: Properties,
}

impl SessionConfig {
    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_attributes(mut self, attributes: Properties) -> Self {
        self.attributes = attributes;
        self
    }
}
