//! Client — owns configuration and adapters, hands out sessions.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use beacon_types::{
    BeaconError, Result,
    config::{ClientConfig, SessionConfig},
};
use crate::capture::CaptureHandler;
use crate::lifecycle::{Lifecycle, Sequencer};
use crate::ports::{StreamPort, TransportPort};
use crate::queue::DispatchQueue;
use crate::session::{Session, SessionParts};

/// Sessions share the client's transport and sequence numbers but each owns
/// its dispatch queue and delivery worker, so one session can be flushed
/// while others keep tracking. Emission order is guaranteed per session;
/// across sessions, `seq` orders events.
pub struct Client {
    config: ClientConfig,
    transport: Rc<dyn TransportPort>,
    stream: Option<Rc<dyn StreamPort>>,
    sequencer: Sequencer,
    session_ids: RefCell<HashSet<String>>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Rc<dyn TransportPort>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            stream: None,
            sequencer: Sequencer::new(),
            session_ids: RefCell::new(HashSet::new()),
        })
    }

    /// Enable the realtime listener for sessions created with a handler.
    pub fn with_stream(mut self, stream: Rc<dyn StreamPort>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create a session. Nothing is sent until the first tracking call.
    ///
    /// Session ids are unique per client; reusing one fails with `InvalidState`.
    pub fn create_session(
        &self,
        session: SessionConfig,
        handler: Option<Rc<dyn CaptureHandler>>,
    ) -> Result<Session> {
        let lifecycle = Lifecycle::new(session, self.sequencer.clone());
        let id = lifecycle.session_id().to_string();
        if !self.session_ids.borrow_mut().insert(id.clone()) {
            return Err(BeaconError::invalid_state(format!(
                "session {} already exists",
                id
            )));
        }
        log::debug!("Created session {}", id);

        Ok(Session::new(SessionParts {
            lifecycle,
            queue: DispatchQueue::new(&self.config.queue),
            transport: self.transport.clone(),
            stream: self.stream.clone(),
            handler,
            delivery: self.config.delivery.clone(),
            listener: self.config.listener.clone(),
        }))
    }
}
