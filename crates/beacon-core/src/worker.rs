//! Delivery worker — the single consumer of the dispatch queue.
//!
//! Each cycle:
//! 1. Pull a batch (up to `max_batch_size`, or whatever arrived within `batch_timeout`)
//! 2. Send it through the transport port
//! 3. On a transient failure, back off and resend the same batch
//! 4. On a permanent failure or an exhausted retry budget, drop the batch,
//!    report it, and move on to the next one
//!
//! The loop ends when the queue is closed and drained.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use serde::Serialize;
use beacon_types::{
    BeaconError, DeliveryError,
    config::DeliveryConfig,
    event::Event,
};
use crate::capture::CaptureHandler;
use crate::ports::{DeliveryResult, TransportPort};
use crate::queue::DispatchQueue;
use crate::retry::Backoff;

/// Counters kept by the worker, readable from the session facade.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub batches_failed: u64,
    pub events_failed: u64,
    pub retries: u64,
    /// Failures no error callback consumed.
    pub unreported_errors: u64,
    /// Events lost to queue backpressure (filled in from the queue).
    pub dropped_events: u64,
}

/// What the worker and the facade share.
#[derive(Default)]
pub struct DeliveryLedger {
    pub stats: DeliveryStats,
    pub failures: Vec<DeliveryError>,
}

pub struct DeliveryWorker {
    queue: DispatchQueue,
    transport: Rc<dyn TransportPort>,
    handler: Option<Rc<dyn CaptureHandler>>,
    config: DeliveryConfig,
    backoff: Backoff,
    ledger: Rc<RefCell<DeliveryLedger>>,
}

impl DeliveryWorker {
    pub fn new(
        queue: DispatchQueue,
        transport: Rc<dyn TransportPort>,
        handler: Option<Rc<dyn CaptureHandler>>,
        config: DeliveryConfig,
        ledger: Rc<RefCell<DeliveryLedger>>,
    ) -> Self {
        let backoff = Backoff::from(&config);
        Self {
            queue,
            transport,
            handler,
            config,
            backoff,
            ledger,
        }
    }

    /// Drain the queue until it is closed and empty.
    ///
    /// Must be spawned via `tokio::task::spawn_local`; it never blocks producers.
    pub async fn run(self) {
        log::debug!(
            "Delivery worker started (transport: {})",
            self.transport.transport_name()
        );
        let window = self.config.batch_timeout();
        while let Some(batch) = self
            .queue
            .next_batch(self.config.max_batch_size, window)
            .await
        {
            self.deliver(batch).await;
        }
        log::debug!("Delivery worker exiting, queue closed and drained");
    }

    async fn deliver(&self, batch: Vec<Event>) {
        let max_total_wait = self.config.max_total_wait();
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 1;

        loop {
            let result = self.transport.send_batch(&batch).await;

            if result == DeliveryResult::Accepted {
                let mut ledger = self.ledger.borrow_mut();
                ledger.stats.batches_sent += 1;
                ledger.stats.events_sent += batch.len() as u64;
                return;
            }

            if !result.is_transient() {
                log::warn!(
                    "Batch of {} events rejected: {}",
                    batch.len(),
                    result.message()
                );
                self.fail(&batch, &result, attempt, result.message());
                return;
            }

            if attempt >= self.config.max_attempts {
                let message = format!(
                    "retries exhausted after {} attempts: {}",
                    attempt,
                    result.message()
                );
                log::warn!("Dropping batch of {} events, {}", batch.len(), message);
                self.fail(&batch, &result, attempt, message);
                return;
            }

            let delay = match &result {
                DeliveryResult::RateLimited {
                    retry_after: Some(hint),
                } => *hint,
                _ => self.backoff.delay(attempt),
            };
            if waited.saturating_add(delay) > max_total_wait {
                let message = format!(
                    "retry budget of {}ms exhausted after {} attempts: {}",
                    max_total_wait.as_millis(),
                    attempt,
                    result.message()
                );
                log::warn!("Dropping batch of {} events, {}", batch.len(), message);
                self.fail(&batch, &result, attempt, message);
                return;
            }

            log::debug!(
                "Batch delivery attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                self.config.max_attempts,
                result.message(),
                delay
            );
            self.ledger.borrow_mut().stats.retries += 1;
            tokio::time::sleep(delay).await;
            waited += delay;
            attempt += 1;
        }
    }

    fn fail(&self, batch: &[Event], result: &DeliveryResult, attempts: u32, message: String) {
        let error = DeliveryError {
            status: result.status(),
            message,
            attempts,
            events: batch.len(),
            first_seq: batch.first().map(|e| e.seq).unwrap_or_default(),
            last_seq: batch.last().map(|e| e.seq).unwrap_or_default(),
        };

        self.ledger.borrow_mut().stats.batches_failed += 1;
        report_failure(&self.ledger, self.handler.as_ref(), error);
    }
}

/// Record undelivered events and hand the error to the handler. Counted as
/// unreported when no handler consumes errors.
pub(crate) fn report_failure(
    ledger: &RefCell<DeliveryLedger>,
    handler: Option<&Rc<dyn CaptureHandler>>,
    error: DeliveryError,
) {
    {
        let mut ledger = ledger.borrow_mut();
        ledger.stats.events_failed += error.events as u64;
        if !handler.is_some_and(|h| h.reports_errors()) {
            ledger.stats.unreported_errors += 1;
        }
        ledger.failures.push(error.clone());
    }

    if let Some(handler) = handler {
        handler.on_error(BeaconError::Delivery(error));
    }
}
