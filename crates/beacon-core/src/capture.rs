//! Caller-facing notifications: inbound analytics events and asynchronous
//! delivery / stream failures.

use futures::channel::mpsc::UnboundedSender;
use beacon_types::{BeaconError, inbound::InboundEvent};

/// Receives what the engine cannot return synchronously.
/// Called on the event loop; implementations must not block.
pub trait CaptureHandler {
    fn on_event(&self, event: InboundEvent);

    fn on_error(&self, error: BeaconError);

    /// Whether `on_error` actually delivers errors somewhere. Failures a
    /// handler swallows are counted as unreported.
    fn reports_errors(&self) -> bool {
        true
    }

    /// Whether the realtime listener should run for sessions using this handler.
    fn wants_stream(&self) -> bool {
        true
    }
}

/// Closure-based handler. A `Callbacks` with neither closure set disables
/// the realtime listener.
#[derive(Default)]
pub struct Callbacks {
    on_event: Option<Box<dyn Fn(InboundEvent)>>,
    on_error: Option<Box<dyn Fn(BeaconError)>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_event(mut self, f: impl Fn(InboundEvent) + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(BeaconError) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_event.is_none() && self.on_error.is_none()
    }
}

impl CaptureHandler for Callbacks {
    fn on_event(&self, event: InboundEvent) {
        if let Some(f) = &self.on_event {
            f(event);
        }
    }

    fn on_error(&self, error: BeaconError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    fn reports_errors(&self) -> bool {
        self.on_error.is_some()
    }

    fn wants_stream(&self) -> bool {
        !self.is_empty()
    }
}

/// Everything a channel-based handler forwards.
#[derive(Debug, Clone)]
pub enum Notification {
    Event(InboundEvent),
    Error(BeaconError),
}

impl CaptureHandler for UnboundedSender<Notification> {
    fn on_event(&self, event: InboundEvent) {
        if self.unbounded_send(Notification::Event(event)).is_err() {
            log::debug!("Notification receiver dropped, inbound event discarded");
        }
    }

    fn on_error(&self, error: BeaconError) {
        if self.unbounded_send(Notification::Error(error)).is_err() {
            log::debug!("Notification receiver dropped, error discarded");
        }
    }

    fn reports_errors(&self) -> bool {
        !self.is_closed()
    }
}
