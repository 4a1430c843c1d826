//! Realtime listener — receives server-computed analytics events for one
//! session over a persistent stream and forwards them to the capture handler.
//!
//! The listener runs as its own `spawn_local` task, independent of delivery.
//! Connection failures and malformed frames are reported through
//! `on_error` and followed by a reconnect with backoff; the listener only
//! gives up after `max_reconnects` consecutive failures. It exits on its own
//! once the `session_ended` acknowledgment arrives.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use beacon_types::{BeaconError, config::ListenerConfig, inbound::InboundFrame};
use crate::capture::CaptureHandler;
use crate::ports::StreamPort;
use crate::retry::Backoff;

pub struct RealtimeListener {
    port: Rc<dyn StreamPort>,
    handler: Rc<dyn CaptureHandler>,
    session_id: String,
    config: ListenerConfig,
}

/// How one connection ended.
enum Disconnect {
    Acknowledged,
    Stopped,
    Failed,
}

impl RealtimeListener {
    pub fn new(
        port: Rc<dyn StreamPort>,
        handler: Rc<dyn CaptureHandler>,
        session_id: impl Into<String>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            port,
            handler,
            session_id: session_id.into(),
            config,
        }
    }

    /// Start the listener on the current `LocalSet`.
    pub fn spawn(self) -> ListenerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let acked = Rc::new(Cell::new(false));
        let grace = self.config.ack_grace();
        let join = tokio::task::spawn_local(self.run(stop_rx, acked.clone()));
        ListenerHandle {
            stop: Some(stop_tx),
            join,
            acked,
            grace,
        }
    }

    async fn run(self, mut stop: oneshot::Receiver<()>, acked: Rc<Cell<bool>>) {
        let backoff = Backoff::from(&self.config);
        let mut failures: u32 = 0;

        loop {
            let opened = tokio::select! {
                _ = &mut stop => break,
                opened = self.port.open_stream(&self.session_id) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    log::info!("Realtime listener connected (session {})", self.session_id);
                    let outcome = loop {
                        let item = tokio::select! {
                            _ = &mut stop => break Disconnect::Stopped,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(InboundFrame::Event(event))) => {
                                failures = 0;
                                self.handler.on_event(event);
                            }
                            Some(Ok(InboundFrame::Error { code, message })) => {
                                failures = 0;
                                self.handler.on_error(BeaconError::Stream { code, message });
                            }
                            Some(Ok(InboundFrame::SessionEnded { .. })) => {
                                acked.set(true);
                                break Disconnect::Acknowledged;
                            }
                            Some(Err(e)) => {
                                log::warn!("Realtime stream error: {}", e);
                                self.handler.on_error(e);
                                break Disconnect::Failed;
                            }
                            None => {
                                log::warn!("Realtime stream closed by server");
                                break Disconnect::Failed;
                            }
                        }
                    };
                    match outcome {
                        Disconnect::Acknowledged => {
                            log::debug!("Session {} acknowledged as ended", self.session_id);
                            break;
                        }
                        Disconnect::Stopped => break,
                        Disconnect::Failed => {}
                    }
                }
                Err(e) => {
                    log::warn!("Realtime listener failed to connect: {}", e);
                    self.handler.on_error(e);
                }
            }

            failures += 1;
            if failures > self.config.max_reconnects {
                log::error!(
                    "Realtime listener giving up after {} consecutive failures",
                    failures
                );
                self.handler.on_error(BeaconError::stream(format!(
                    "gave up after {} consecutive connection failures",
                    failures
                )));
                break;
            }

            let delay = backoff.delay(failures);
            log::debug!("Reconnecting realtime listener in {:?}", delay);
            tokio::select! {
                _ = &mut stop => break,
                _ = time::sleep(delay) => {}
            }
        }

        log::debug!("Realtime listener exiting (session {})", self.session_id);
    }
}

/// Owner-side control of a running listener. Dropping it stops the listener.
pub struct ListenerHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    acked: Rc<Cell<bool>>,
    grace: Duration,
}

impl ListenerHandle {
    /// Whether the `session_ended` acknowledgment has been seen.
    pub fn acknowledged(&self) -> bool {
        self.acked.get()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait up to the grace period for the listener to see the session-ended
    /// acknowledgment and exit, then stop it. Returns whether the ack arrived.
    pub async fn shutdown(mut self) -> bool {
        if time::timeout(self.grace, &mut self.join).await.is_err() {
            log::warn!(
                "No session-ended acknowledgment within {:?}, stopping realtime listener",
                self.grace
            );
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            if let Err(e) = (&mut self.join).await {
                log::warn!("Realtime listener task failed: {}", e);
            }
        }
        self.acked.get()
    }
}
