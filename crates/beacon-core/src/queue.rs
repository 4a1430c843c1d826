//! Dispatch queue — bounded FIFO hand-off between the session facade
//! (producers) and the delivery worker (single consumer).
//!
//! The queue is single-threaded and uses interior mutability via RefCell.
//! Producers and the consumer rendezvous on two `Notify`s; a `RefCell`
//! borrow is never held across an await point.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use beacon_types::{
    BeaconError, Result,
    config::{Backpressure, QueueConfig},
    event::Event,
};

/// Shared dispatch queue — clone-cheap via Rc.
#[derive(Clone)]
pub struct DispatchQueue {
    state: Rc<RefCell<QueueState>>,
    items: Rc<Notify>,
    space: Rc<Notify>,
}

struct QueueState {
    buffer: VecDeque<Event>,
    capacity: usize,
    backpressure: Backpressure,
    closed: bool,
    dropped: u64,
}

impl DispatchQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                buffer: VecDeque::with_capacity(config.capacity.min(1024)),
                capacity: config.capacity.max(1),
                backpressure: config.backpressure,
                closed: false,
                dropped: 0,
            })),
            items: Rc::new(Notify::new()),
            space: Rc::new(Notify::new()),
        }
    }

    /// Append an event. Returns immediately unless the queue is full and the
    /// policy is `Block`, in which case the caller waits (bounded) for space.
    pub async fn enqueue(&self, event: Event) -> Result<()> {
        let mut deadline = None;

        loop {
            // Register interest before inspecting state so a pop between the
            // check and the await cannot be missed.
            let space = self.space.notified();
            let timeout_ms = {
                let mut state = self.state.borrow_mut();
                if state.closed {
                    return Err(BeaconError::QueueClosed);
                }
                if state.buffer.len() < state.capacity {
                    state.buffer.push_back(event);
                    drop(state);
                    self.items.notify_waiters();
                    return Ok(());
                }
                let backpressure = state.backpressure;
                match backpressure {
                    Backpressure::DropOldest => {
                        if let Some(evicted) = state.buffer.pop_front() {
                            state.dropped += 1;
                            log::warn!(
                                "Dispatch queue full ({}), dropped oldest event seq={}",
                                state.capacity,
                                evicted.seq
                            );
                        }
                        state.buffer.push_back(event);
                        drop(state);
                        self.items.notify_waiters();
                        return Ok(());
                    }
                    Backpressure::Block { timeout_ms } => timeout_ms,
                }
            };

            let deadline = *deadline
                .get_or_insert_with(|| Instant::now() + Duration::from_millis(timeout_ms));
            if time::timeout_at(deadline, space).await.is_err() {
                let mut state = self.state.borrow_mut();
                if state.closed {
                    return Err(BeaconError::QueueClosed);
                }
                state.dropped += 1;
                log::warn!(
                    "Dispatch queue still full after {}ms, dropped event seq={}",
                    timeout_ms,
                    event.seq
                );
                return Ok(());
            }
        }
    }

    /// Wait for the next batch: at least one event, then up to `max` events or
    /// until `window` elapses, whichever comes first. Returns `None` once the
    /// queue is closed and fully drained.
    pub async fn next_batch(&self, max: usize, window: Duration) -> Option<Vec<Event>> {
        let max = max.max(1);

        loop {
            let items = self.items.notified();
            {
                let state = self.state.borrow();
                if !state.buffer.is_empty() {
                    break;
                }
                if state.closed {
                    return None;
                }
            }
            items.await;
        }

        let deadline = Instant::now() + window;
        loop {
            let items = self.items.notified();
            {
                let state = self.state.borrow();
                // A full buffer cannot grow further; waiting out the window
                // would only stall blocked producers.
                if state.buffer.len() >= max.min(state.capacity) || state.closed {
                    break;
                }
            }
            if time::timeout_at(deadline, items).await.is_err() {
                break;
            }
        }

        let batch: Vec<Event> = {
            let mut state = self.state.borrow_mut();
            let n = state.buffer.len().min(max);
            state.buffer.drain(..n).collect()
        };
        self.space.notify_waiters();
        Some(batch)
    }

    /// Empty the buffer without a consumer, for when the worker is gone.
    pub fn take_remaining(&self) -> Vec<Event> {
        let events: Vec<Event> = self.state.borrow_mut().buffer.drain(..).collect();
        self.space.notify_waiters();
        events
    }

    /// Stop accepting events. The consumer keeps draining what is buffered.
    pub fn close(&self) {
        self.state.borrow_mut().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().buffer.is_empty()
    }

    /// Events lost to backpressure since the queue was created.
    pub fn dropped_count(&self) -> u64 {
        self.state.borrow().dropped
    }
}
