use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::properties::Properties;

/// Lifecycle of a session or a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unstarted,
    Active,
    Ended,
}

/// The top-level unit of telemetry: one user's engagement span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: LifecycleState,
    pub attributes: Properties,
}

impl SessionRecord {
    pub fn new(id: String) -> Self {
        Self {
            id,
            user_id: None,
            device_id: None,
            created_at: Utc::now(),
            state: LifecycleState::Unstarted,
            attributes: Properties::new(),
        }
    }
}

/// A nested exchange sequence within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub turn_count: u32,
    pub state: LifecycleState,
}

impl Conversation {
    pub fn start(id: String, session_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id,
            started_at,
            ended_at: None,
            turn_count: 0,
            state: LifecycleState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }
}

/// Generate a fresh identifier for a session or conversation.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
