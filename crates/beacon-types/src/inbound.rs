use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::properties::Properties;

/// A server-computed analytics event delivered over the realtime stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub event_id: String,
    /// Links a derived/summary event back to the event that triggered it.
    #[serde(default)]
    pub origin_event_id: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub traits: Option<Properties>,
}

impl InboundEvent {
    pub fn is_derived(&self) -> bool {
        self.origin_event_id.is_some()
    }
}

/// One decoded frame from the realtime stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Event(InboundEvent),
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    /// Terminal frame: the backend has processed the session's end.
    SessionEnded {
        #[serde(default)]
        session_id: Option<String>,
    },
}
