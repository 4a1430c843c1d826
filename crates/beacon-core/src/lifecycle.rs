//! Session / conversation lifecycle state machine.
//!
//! Session:      Unstarted → Active → Ended
//! Conversation: Unstarted → Active → Ended   (independent per conversation id)
//!
//! Every operation validates first and mutates second, so a rejected call
//! leaves no trace. Successful operations return the events to enqueue, in
//! order, already stamped with identifiers, timestamp and sequence number.
//! Pure and synchronous: the facade owns the queue.

use std::cell::Cell;
use std::rc::Rc;
use chrono::{DateTime, Utc};
use beacon_types::{
    BeaconError, Result,
    config::SessionConfig,
    event::{Cost, Event, EventPayload},
    properties::{Properties, PropertyValue},
    session::{new_id, Conversation, LifecycleState, SessionRecord},
};

/// Per-client sequence source — clone-cheap via Rc.
#[derive(Debug, Clone, Default)]
pub struct Sequencer(Rc<Cell<u64>>);

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let seq = self.0.get() + 1;
        self.0.set(seq);
        seq
    }

    /// Last number handed out (0 before the first).
    pub fn last(&self) -> u64 {
        self.0.get()
    }
}

/// Optional per-call overrides shared by every tracking operation.
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub timestamp: Option<DateTime<Utc>>,
    pub properties: Properties,
    pub cost: Option<Cost>,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn cost(mut self, cost: Cost) -> Self {
        self.cost = Some(cost);
        self
    }
}

pub struct Lifecycle {
    session: SessionRecord,
    /// In start order; ended conversations stay so ids are never reused.
    conversations: Vec<Conversation>,
    implicit_starts: u32,
    sequencer: Sequencer,
}

impl Lifecycle {
    pub fn new(config: SessionConfig, sequencer: Sequencer) -> Self {
        let mut session = SessionRecord::new(config.session_id.unwrap_or_else(new_id));
        session.user_id = config.user_id;
        session.device_id = config.device_id;
        session.attributes = config.attributes;
        Self {
            session,
            conversations: Vec::new(),
            implicit_starts: 0,
            sequencer,
        }
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn state(&self) -> LifecycleState {
        self.session.state
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn open_conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter().filter(|c| c.is_active())
    }

    // ─── Session ─────────────────────────────────────────────

    pub fn start_session(&mut self, opts: EventOptions) -> Result<Vec<Event>> {
        match self.session.state {
            LifecycleState::Unstarted => Ok(vec![self.begin(opts)]),
            LifecycleState::Active => Err(BeaconError::invalid_state(format!(
                "session {} already started",
                self.session.id
            ))),
            LifecycleState::Ended => Err(BeaconError::invalid_state(format!(
                "session {} already ended",
                self.session.id
            ))),
        }
    }

    /// Idempotent: starts the session with its configured attributes if it
    /// has not started yet. Fails only on an ended session.
    pub fn ensure_started(&mut self, at: DateTime<Utc>, out: &mut Vec<Event>) -> Result<()> {
        self.check_not_ended()?;
        if self.session.state == LifecycleState::Unstarted {
            log::debug!("Auto-starting session {}", self.session.id);
            out.push(self.begin(EventOptions::new().at(at)));
        }
        Ok(())
    }

    /// Ends every open conversation (in start order), then the session.
    pub fn end_session(&mut self, opts: EventOptions) -> Result<Vec<Event>> {
        match self.session.state {
            LifecycleState::Active => {}
            LifecycleState::Unstarted => {
                return Err(BeaconError::invalid_state(format!(
                    "session {} has not started",
                    self.session.id
                )))
            }
            LifecycleState::Ended => {
                return Err(BeaconError::invalid_state(format!(
                    "session {} already ended",
                    self.session.id
                )))
            }
        }

        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let open: Vec<usize> = (0..self.conversations.len())
            .filter(|&i| self.conversations[i].is_active())
            .collect();

        let mut out = Vec::with_capacity(open.len() + 1);
        for index in open {
            out.push(self.finish_conversation(index, EventOptions::new().at(at)));
        }
        self.session.state = LifecycleState::Ended;
        out.push(self.stamp(EventPayload::SessionEnd, None, EventOptions { timestamp: Some(at), ..opts }));
        Ok(out)
    }

    // ─── Conversations ───────────────────────────────────────

    /// Returns the conversation id (generated when not supplied).
    pub fn start_conversation(
        &mut self,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<(String, Vec<Event>)> {
        self.check_not_ended()?;
        if let Some(id) = conversation_id {
            if self.conversation(id).is_some() {
                return Err(BeaconError::invalid_state(format!(
                    "conversation {} already exists",
                    id
                )));
            }
        }

        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let mut out = Vec::new();
        self.ensure_started(at, &mut out)?;
        let id = conversation_id.map(str::to_string).unwrap_or_else(new_id);
        out.push(self.open_conversation(id.clone(), EventOptions { timestamp: Some(at), ..opts }));
        Ok((id, out))
    }

    /// Records one user/assistant exchange. Without an explicit id the turn
    /// goes to the most recently started open conversation, or to a default
    /// conversation started on the spot.
    pub fn track_conversation_turn(
        &mut self,
        conversation_id: Option<&str>,
        user: &str,
        assistant: &str,
        opts: EventOptions,
    ) -> Result<(String, Vec<Event>)> {
        self.check_not_ended()?;
        let target = match conversation_id {
            Some(id) => Some(self.active_index(id)?),
            None => self.latest_open(),
        };

        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let mut out = Vec::new();
        self.ensure_started(at, &mut out)?;

        let index = match target {
            Some(index) => index,
            None => {
                let id = self.next_default_id();
                self.implicit_starts += 1;
                out.push(self.open_conversation(id, EventOptions::new().at(at)));
                self.conversations.len() - 1
            }
        };

        let conversation = &mut self.conversations[index];
        conversation.turn_count += 1;
        let turn = conversation.turn_count;
        let id = conversation.id.clone();
        out.push(self.stamp(
            EventPayload::ConversationTurn {
                turn,
                user: user.to_string(),
                assistant: assistant.to_string(),
            },
            Some(&id),
            EventOptions { timestamp: Some(at), ..opts },
        ));
        Ok((id, out))
    }

    /// Without an explicit id, ends the most recently started open conversation.
    pub fn end_conversation(
        &mut self,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<Vec<Event>> {
        let index = match conversation_id {
            Some(id) => self.active_index(id)?,
            None => self.latest_open().ok_or_else(|| {
                BeaconError::invalid_state(format!(
                    "session {} has no open conversation to end",
                    self.session.id
                ))
            })?,
        };
        Ok(vec![self.finish_conversation(index, opts)])
    }

    // ─── Free-standing events ────────────────────────────────

    /// Attaches to the given conversation, or to the most recent open one.
    pub fn track_event(
        &mut self,
        name: &str,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<Vec<Event>> {
        self.check_not_ended()?;
        let conversation = match conversation_id {
            Some(id) => Some(self.active_index(id)?),
            None => self.latest_open(),
        }
        .map(|index| self.conversations[index].id.clone());

        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let mut out = Vec::new();
        self.ensure_started(at, &mut out)?;
        out.push(self.stamp(
            EventPayload::Track {
                event: name.to_string(),
            },
            conversation.as_deref(),
            EventOptions { timestamp: Some(at), ..opts },
        ));
        Ok(out)
    }

    /// Permitted in every state. Updates the session's user id.
    pub fn identify(
        &mut self,
        user_id: &str,
        traits: Properties,
        opts: EventOptions,
    ) -> Result<Vec<Event>> {
        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let mut out = self.start_if_unstarted(at);
        self.session.user_id = Some(user_id.to_string());
        let mut event = self.stamp(
            EventPayload::Identify {
                user_id: user_id.to_string(),
            },
            None,
            EventOptions { timestamp: Some(at), ..opts },
        );
        if !traits.is_empty() {
            event.traits = Some(traits);
        }
        out.push(event);
        Ok(out)
    }

    /// Permitted in every state. Links `previous_id` to `user_id`.
    pub fn alias(
        &mut self,
        user_id: &str,
        previous_id: &str,
        opts: EventOptions,
    ) -> Result<Vec<Event>> {
        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let mut out = self.start_if_unstarted(at);
        out.push(self.stamp(
            EventPayload::Alias {
                user_id: user_id.to_string(),
                previous_id: previous_id.to_string(),
            },
            None,
            EventOptions { timestamp: Some(at), ..opts },
        ));
        Ok(out)
    }

    // ─── Internals ───────────────────────────────────────────

    fn begin(&mut self, opts: EventOptions) -> Event {
        self.session.state = LifecycleState::Active;
        let mut properties = self.session.attributes.clone();
        properties.extend(opts.properties);
        self.stamp(
            EventPayload::SessionStart {
                user_id: self.session.user_id.clone(),
                device_id: self.session.device_id.clone(),
            },
            None,
            EventOptions {
                timestamp: opts.timestamp,
                properties,
                cost: opts.cost,
            },
        )
    }

    fn start_if_unstarted(&mut self, at: DateTime<Utc>) -> Vec<Event> {
        if self.session.state == LifecycleState::Unstarted {
            vec![self.begin(EventOptions::new().at(at))]
        } else {
            Vec::new()
        }
    }

    fn open_conversation(&mut self, id: String, opts: EventOptions) -> Event {
        let at = opts.timestamp.unwrap_or_else(Utc::now);
        self.conversations
            .push(Conversation::start(id.clone(), self.session.id.clone(), at));
        self.stamp(EventPayload::ConversationStart, Some(&id), opts)
    }

    fn finish_conversation(&mut self, index: usize, opts: EventOptions) -> Event {
        let at = opts.timestamp.unwrap_or_else(Utc::now);
        let conversation = &mut self.conversations[index];
        conversation.state = LifecycleState::Ended;
        conversation.ended_at = Some(at);
        let turn_count = conversation.turn_count;
        let id = conversation.id.clone();
        self.stamp(
            EventPayload::ConversationEnd { turn_count },
            Some(&id),
            EventOptions { timestamp: Some(at), ..opts },
        )
    }

    fn stamp(&self, payload: EventPayload, conversation_id: Option<&str>, opts: EventOptions) -> Event {
        Event {
            seq: self.sequencer.next(),
            timestamp: opts.timestamp.unwrap_or_else(Utc::now),
            session_id: self.session.id.clone(),
            conversation_id: conversation_id.map(str::to_string),
            payload,
            properties: opts.properties,
            traits: None,
            cost: opts.cost,
        }
    }

    fn check_not_ended(&self) -> Result<()> {
        if self.session.state == LifecycleState::Ended {
            return Err(BeaconError::invalid_state(format!(
                "session {} already ended",
                self.session.id
            )));
        }
        Ok(())
    }

    fn active_index(&self, id: &str) -> Result<usize> {
        let index = self
            .conversations
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| {
                BeaconError::invalid_state(format!("conversation {} was never started", id))
            })?;
        if !self.conversations[index].is_active() {
            return Err(BeaconError::invalid_state(format!(
                "conversation {} already ended",
                id
            )));
        }
        Ok(index)
    }

    fn latest_open(&self) -> Option<usize> {
        self.conversations.iter().rposition(|c| c.is_active())
    }

    fn next_default_id(&self) -> String {
        let mut n = self.implicit_starts + 1;
        loop {
            let id = format!("{}:default-{}", self.session.id, n);
            if self.conversation(&id).is_none() {
                return id;
            }
            n += 1;
        }
    }
}
