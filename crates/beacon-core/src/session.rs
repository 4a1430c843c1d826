//! Session facade — the public tracking surface.
//!
//! Every call validates against the lifecycle state machine, then enqueues
//! the resulting events and returns; delivery happens on the background
//! worker. Only lifecycle misuse (`InvalidState`) and calls after `flush`
//! (`QueueClosed`) fail synchronously.
//!
//! A `Session` is a cheap `Rc` handle and must be used from inside a tokio
//! `LocalSet`: the delivery worker and realtime listener are `spawn_local`
//! tasks started on first use.

use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time;
use beacon_types::{
    BeaconError, DeliveryError, Result,
    config::{DeliveryConfig, ListenerConfig},
    event::Event,
    properties::Properties,
    session::{Conversation, LifecycleState},
};
use crate::capture::CaptureHandler;
use crate::lifecycle::{EventOptions, Lifecycle};
use crate::listener::{ListenerHandle, RealtimeListener};
use crate::ports::{StreamPort, TransportPort};
use crate::queue::DispatchQueue;
use crate::worker::{report_failure, DeliveryLedger, DeliveryStats, DeliveryWorker};

/// Handle to one tracked session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

/// Everything a session needs from its client.
pub(crate) struct SessionParts {
    pub lifecycle: Lifecycle,
    pub queue: DispatchQueue,
    pub transport: Rc<dyn TransportPort>,
    pub stream: Option<Rc<dyn StreamPort>>,
    pub handler: Option<Rc<dyn CaptureHandler>>,
    pub delivery: DeliveryConfig,
    pub listener: ListenerConfig,
}

struct SessionInner {
    lifecycle: RefCell<Lifecycle>,
    queue: DispatchQueue,
    transport: Rc<dyn TransportPort>,
    stream: Option<Rc<dyn StreamPort>>,
    handler: Option<Rc<dyn CaptureHandler>>,
    delivery: DeliveryConfig,
    listener_config: ListenerConfig,
    ledger: Rc<RefCell<DeliveryLedger>>,
    worker: RefCell<Option<JoinHandle<()>>>,
    listener: RefCell<Option<ListenerHandle>>,
    flushed: OnceCell<Result<()>>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                lifecycle: RefCell::new(parts.lifecycle),
                queue: parts.queue,
                transport: parts.transport,
                stream: parts.stream,
                handler: parts.handler,
                delivery: parts.delivery,
                listener_config: parts.listener,
                ledger: Rc::new(RefCell::new(DeliveryLedger::default())),
                worker: RefCell::new(None),
                listener: RefCell::new(None),
                flushed: OnceCell::new(),
            }),
        }
    }

    // ─── Tracking surface ────────────────────────────────────

    pub async fn start_session(&self, opts: EventOptions) -> Result<()> {
        self.apply(|lc| lc.start_session(opts)).await
    }

    /// Track a named event, attached to `conversation_id` or to the most
    /// recently started open conversation.
    pub async fn track_event(
        &self,
        name: &str,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<()> {
        self.apply(|lc| lc.track_event(name, conversation_id, opts)).await
    }

    /// Returns the id of the new conversation.
    pub async fn start_conversation(
        &self,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<String> {
        self.apply_with(|lc| lc.start_conversation(conversation_id, opts))
            .await
    }

    /// Returns the id of the conversation the turn was recorded in.
    pub async fn track_conversation_turn(
        &self,
        conversation_id: Option<&str>,
        user: &str,
        assistant: &str,
        opts: EventOptions,
    ) -> Result<String> {
        self.apply_with(|lc| lc.track_conversation_turn(conversation_id, user, assistant, opts))
            .await
    }

    pub async fn end_conversation(
        &self,
        conversation_id: Option<&str>,
        opts: EventOptions,
    ) -> Result<()> {
        self.apply(|lc| lc.end_conversation(conversation_id, opts)).await
    }

    /// Ends open conversations, then the session. Does not wait for delivery;
    /// call `flush` for that.
    pub async fn end_session(&self, opts: EventOptions) -> Result<()> {
        self.apply(|lc| lc.end_session(opts)).await
    }

    pub async fn user_identify(
        &self,
        user_id: &str,
        traits: Properties,
        opts: EventOptions,
    ) -> Result<()> {
        self.apply(|lc| lc.identify(user_id, traits, opts)).await
    }

    pub async fn user_alias(
        &self,
        user_id: &str,
        previous_id: &str,
        opts: EventOptions,
    ) -> Result<()> {
        self.apply(|lc| lc.alias(user_id, previous_id, opts)).await
    }

    // ─── Shutdown ────────────────────────────────────────────

    /// Close the queue, wait for the worker to deliver (or give up on)
    /// everything enqueued, then wait for the listener's session-ended
    /// acknowledgment. Idempotent: later calls, from any clone, wait for the
    /// same drain and return its outcome.
    ///
    /// Fails with `Timeout` when the worker is still busy after
    /// `flush_timeout`; it is then aborted and whatever is left is lost.
    /// Fails with `Delivery` when the worker died, carrying the events it
    /// never attempted.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flushed.get_or_init(|| self.drain()).await.clone()
    }

    async fn drain(&self) -> Result<()> {
        self.inner.queue.close();

        let mut result = Ok(());
        let worker = self.inner.worker.borrow_mut().take();
        if let Some(mut join) = worker {
            let limit = self.inner.delivery.flush_timeout();
            match time::timeout(limit, &mut join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Delivery worker failed: {}", e);
                    result = Err(self.abandon_queue(e.to_string()));
                }
                Err(_) => {
                    join.abort();
                    log::warn!(
                        "Flush timed out after {:?}, {} events left undelivered",
                        limit,
                        self.inner.queue.len()
                    );
                    result = Err(BeaconError::Timeout(self.inner.delivery.flush_timeout_ms));
                }
            }
        }

        let listener = self.inner.listener.borrow_mut().take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }

        log::debug!("Session {} flushed", self.id());
        result
    }

    /// Report everything still queued as undelivered.
    fn abandon_queue(&self, reason: String) -> BeaconError {
        let events = self.inner.queue.take_remaining();
        let error = DeliveryError {
            status: None,
            message: format!("delivery worker stopped: {}", reason),
            attempts: 0,
            events: events.len(),
            first_seq: events.first().map(|e| e.seq).unwrap_or_default(),
            last_seq: events.last().map(|e| e.seq).unwrap_or_default(),
        };
        report_failure(&self.inner.ledger, self.inner.handler.as_ref(), error.clone());
        BeaconError::Delivery(error)
    }

    /// Run `body` with this session, then end the session (if it started)
    /// and flush, whether the body succeeded, failed or panicked. A panic
    /// is resumed after the flush.
    pub async fn scope<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.clone();
        let outcome = AssertUnwindSafe(async move { body(session).await })
            .catch_unwind()
            .await;
        let closed = self.close().await;

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(result) => {
                let value = result?;
                closed?;
                Ok(value)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let ended = if self.state() == LifecycleState::Active && !self.inner.queue.is_closed() {
            self.end_session(EventOptions::new()).await
        } else {
            Ok(())
        };
        let flushed = self.flush().await;
        ended.and(flushed)
    }

    // ─── Introspection ───────────────────────────────────────

    pub fn id(&self) -> String {
        self.inner.lifecycle.borrow().session_id().to_string()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.borrow().state()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.lifecycle.borrow().session().user_id.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.lifecycle.borrow().conversation(id).cloned()
    }

    /// Ids of conversations not yet ended, in start order.
    pub fn open_conversations(&self) -> Vec<String> {
        self.inner
            .lifecycle
            .borrow()
            .open_conversations()
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn is_flushed(&self) -> bool {
        self.inner.flushed.initialized()
    }

    /// Events enqueued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn stats(&self) -> DeliveryStats {
        let mut stats = self.inner.ledger.borrow().stats.clone();
        stats.dropped_events = self.inner.queue.dropped_count();
        stats
    }

    /// Every batch the worker gave up on, oldest first.
    pub fn failures(&self) -> Vec<DeliveryError> {
        self.inner.ledger.borrow().failures.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.inner.ledger.borrow().failures.is_empty()
    }

    // ─── Internals ───────────────────────────────────────────

    async fn apply<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Lifecycle) -> Result<Vec<Event>>,
    {
        self.apply_with(|lc| op(lc).map(|events| ((), events))).await
    }

    async fn apply_with<F, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Lifecycle) -> Result<(T, Vec<Event>)>,
    {
        if self.inner.queue.is_closed() {
            return Err(BeaconError::QueueClosed);
        }

        let (value, events, started) = {
            let mut lifecycle = self.inner.lifecycle.borrow_mut();
            let before = lifecycle.state();
            let (value, events) = op(&mut lifecycle)?;
            let started = before == LifecycleState::Unstarted
                && lifecycle.state() != LifecycleState::Unstarted;
            (value, events, started)
        };

        self.ensure_worker();
        if started {
            self.start_listener();
        }
        for event in events {
            self.inner.queue.enqueue(event).await?;
        }
        Ok(value)
    }

    fn ensure_worker(&self) {
        let mut worker = self.inner.worker.borrow_mut();
        if worker.is_some() {
            return;
        }
        let task = DeliveryWorker::new(
            self.inner.queue.clone(),
            self.inner.transport.clone(),
            self.inner.handler.clone(),
            self.inner.delivery.clone(),
            self.inner.ledger.clone(),
        );
        *worker = Some(tokio::task::spawn_local(task.run()));
    }

    fn start_listener(&self) {
        let (Some(port), Some(handler)) = (&self.inner.stream, &self.inner.handler) else {
            return;
        };
        if !handler.wants_stream() {
            return;
        }
        let listener = RealtimeListener::new(
            port.clone(),
            handler.clone(),
            self.id(),
            self.inner.listener_config.clone(),
        );
        *self.inner.listener.borrow_mut() = Some(listener.spawn());
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.flushed.initialized() {
            return;
        }
        // Lets a detached worker drain and exit.
        self.queue.close();
        let lifecycle = self.lifecycle.borrow();
        if lifecycle.state() != LifecycleState::Unstarted {
            log::warn!(
                "Session {} dropped without flush, {} queued events may be lost",
                lifecycle.session_id(),
                self.queue.len()
            );
        }
    }
}
