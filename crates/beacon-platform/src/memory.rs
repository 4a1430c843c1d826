//! In-memory recording transport.
//! Nothing leaves the process; used by tests and dry runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use async_trait::async_trait;
use beacon_core::ports::{DeliveryResult, TransportPort};
use beacon_types::event::Event;

/// Records every batch it is handed and answers from a script,
/// `Accepted` once the script runs out.
#[derive(Default)]
pub struct RecordingTransport {
    attempts: RefCell<Vec<(Vec<Event>, DeliveryResult)>>,
    script: RefCell<VecDeque<DeliveryResult>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(results: impl IntoIterator<Item = DeliveryResult>) -> Self {
        Self {
            attempts: RefCell::new(Vec::new()),
            script: RefCell::new(results.into_iter().collect()),
        }
    }

    /// Queue the answer for a future send.
    pub fn push_result(&self, result: DeliveryResult) {
        self.script.borrow_mut().push_back(result);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.borrow().len()
    }

    /// Every send attempt with the answer it got, oldest first.
    pub fn attempts(&self) -> Vec<(Vec<Event>, DeliveryResult)> {
        self.attempts.borrow().clone()
    }

    /// Batches that were answered `Accepted`.
    pub fn accepted_batches(&self) -> Vec<Vec<Event>> {
        self.attempts
            .borrow()
            .iter()
            .filter(|(_, result)| *result == DeliveryResult::Accepted)
            .map(|(batch, _)| batch.clone())
            .collect()
    }

    /// Accepted events, flattened in delivery order.
    pub fn accepted_events(&self) -> Vec<Event> {
        self.accepted_batches().into_iter().flatten().collect()
    }

    pub fn clear(&self) {
        self.attempts.borrow_mut().clear();
    }
}

#[async_trait(?Send)]
impl TransportPort for RecordingTransport {
    async fn send_batch(&self, events: &[Event]) -> DeliveryResult {
        let result = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or(DeliveryResult::Accepted);
        self.attempts
            .borrow_mut()
            .push((events.to_vec(), result.clone()));
        result
    }

    fn transport_name(&self) -> &str {
        "recording"
    }
}
