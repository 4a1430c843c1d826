//! Wire a `Client` to concrete adapters.

use std::rc::Rc;
use beacon_core::Client;
use beacon_types::{Result, config::ClientConfig};
use crate::http::HttpTransport;
use crate::memory::RecordingTransport;
use crate::sse::SseStreamPort;

/// Client backed by the HTTP batch transport and the SSE realtime stream.
pub fn connect(config: ClientConfig) -> Result<Client> {
    let transport = HttpTransport::new(&config)?;
    let stream = SseStreamPort::new(&config)?;
    log::info!(
        "Delivering to {}, listening on {}",
        transport.endpoint(),
        stream.endpoint()
    );
    Ok(Client::new(config, Rc::new(transport))?.with_stream(Rc::new(stream)))
}

/// Client that records batches in memory instead of sending them.
/// No realtime stream is attached.
pub fn connect_recording(config: ClientConfig) -> Result<(Client, Rc<RecordingTransport>)> {
    let transport = Rc::new(RecordingTransport::new());
    log::info!("Dry run: events are recorded in memory");
    let client = Client::new(config, transport.clone())?;
    Ok((client, transport))
}
