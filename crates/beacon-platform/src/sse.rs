//! Realtime stream over server-sent events.
//!
//! GET `{stream}/bc/v1/live/events?session_id=<id>` with the session id
//! repeated in `X-Session-ID`. Each `data:` payload is one JSON
//! `InboundFrame`; payloads that do not decode become error items so the
//! listener can report them and reconnect.

use std::collections::VecDeque;
use std::fmt::Display;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use beacon_core::ports::{InboundStream, StreamPort};
use beacon_types::{
    BeaconError, Result,
    config::ClientConfig,
    inbound::InboundFrame,
};
use crate::http::APP_ID_HEADER;

pub const STREAM_PATH: &str = "/bc/v1/live/events";
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Incremental SSE parser. Bytes are buffered until a blank line closes the
/// frame, so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<InboundFrame>> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut frames = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..split + 2).collect();
            let text = String::from_utf8_lossy(&raw[..split]);
            if let Some(payload) = extract_data_payload(&text) {
                frames.push(decode(&payload));
            }
        }

        frames
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(|b| b.is_ascii_whitespace())
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn decode(payload: &str) -> Result<InboundFrame> {
    serde_json::from_str(payload)
        .map_err(|e| BeaconError::Serialization(format!("malformed frame: {}", e)))
}

/// Turn a byte-chunk stream into decoded frames. A transport error becomes
/// the final item.
pub fn decode_stream<S, B, E>(bytes: S) -> InboundStream
where
    S: Stream<Item = std::result::Result<B, E>> + 'static,
    B: AsRef<[u8]> + 'static,
    E: Display + 'static,
{
    let state = (Box::pin(bytes), SseParser::default(), VecDeque::new(), false);
    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut parser, mut pending, mut done)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, parser, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(parser.feed(chunk.as_ref())),
                    Some(Err(e)) => {
                        done = true;
                        pending.push_back(Err(BeaconError::Network(e.to_string())));
                    }
                    None => return None,
                }
            }
        },
    ))
}

pub struct SseStreamPort {
    client: reqwest::Client,
    url: String,
    api_key: String,
    project_id: String,
}

impl SseStreamPort {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // No overall timeout: the connection is meant to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BeaconError::Config(format!("stream client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}{}", config.stream_url(), STREAM_PATH),
            api_key: config.api_key.clone(),
            project_id: config.project_id.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }
}

#[async_trait(?Send)]
impl StreamPort for SseStreamPort {
    async fn open_stream(&self, session_id: &str) -> Result<InboundStream> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("session_id", session_id)])
            .bearer_auth(&self.api_key)
            .header(APP_ID_HEADER, &self.project_id)
            .header(SESSION_HEADER, session_id)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BeaconError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BeaconError::Stream {
                code: Some(status.as_u16().to_string()),
                message: format!("Error: {} - {}", status.as_u16(), text.trim()),
            });
        }

        Ok(decode_stream(response.bytes_stream()))
    }
}
