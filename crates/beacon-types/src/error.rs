use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BeaconError {
    /// Lifecycle misuse: start-on-started, end-on-ended, turn on an ended session.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Delivery failed: {0}")]
    Delivery(DeliveryError),

    #[error("Stream error{}: {message}", code_suffix(.code))]
    Stream {
        code: Option<String>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl BeaconError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        BeaconError::InvalidState(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        BeaconError::Stream {
            code: None,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(e: serde_json::Error) -> Self {
        BeaconError::Serialization(e.to_string())
    }
}

/// A batch the worker gave up on, either because the backend rejected it
/// or because the retry budget ran out.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}{message} ({events} events, {attempts} attempts)", status_prefix(.status))]
pub struct DeliveryError {
    pub status: Option<u16>,
    pub message: String,
    pub attempts: u32,
    pub events: usize,
    pub first_seq: u64,
    pub last_seq: u64,
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

fn status_prefix(status: &Option<u16>) -> String {
    status.map(|s| format!("HTTP {s}: ")).unwrap_or_default()
}
