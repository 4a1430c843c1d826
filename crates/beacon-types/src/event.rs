use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::properties::Properties;

/// An outbound telemetry event. Built once by the lifecycle state machine,
/// then moved through the dispatch queue to the transport untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-client local sequence number; strictly increasing, never reused.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
    #[serde(skip_serializing_if = "Properties::is_empty", default)]
    pub properties: Properties,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub traits: Option<Properties>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cost: Option<Cost>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// Kind-specific part of an event, tagged on the wire by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStart {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        device_id: Option<String>,
    },
    SessionEnd,
    ConversationStart,
    ConversationTurn {
        /// 1-based index of this turn within its conversation
        turn: u32,
        user: String,
        assistant: String,
    },
    ConversationEnd {
        turn_count: u32,
    },
    Track {
        event: String,
    },
    Identify {
        user_id: String,
    },
    Alias {
        user_id: String,
        previous_id: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionStart { .. } => EventKind::SessionStart,
            EventPayload::SessionEnd => EventKind::SessionEnd,
            EventPayload::ConversationStart => EventKind::ConversationStart,
            EventPayload::ConversationTurn { .. } => EventKind::ConversationTurn,
            EventPayload::ConversationEnd { .. } => EventKind::ConversationEnd,
            EventPayload::Track { .. } => EventKind::Track,
            EventPayload::Identify { .. } => EventKind::Identify,
            EventPayload::Alias { .. } => EventKind::Alias,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    ConversationStart,
    ConversationTurn,
    ConversationEnd,
    Track,
    Identify,
    Alias,
}

/// Token usage for one model call; spend is computed downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Cost {
    pub fn new(model: impl Into<String>, prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            model: model.into(),
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}
