//! HTTP batch transport.
//!
//! One POST per batch to `{server}/bc/v1/events/batch` with body
//! `{"events": [...]}`. Status codes are mapped onto `DeliveryResult`;
//! retrying is the delivery worker's job, not this adapter's.

use std::time::Duration;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;

use beacon_core::ports::{DeliveryResult, TransportPort};
use beacon_types::{
    BeaconError, Result,
    config::ClientConfig,
    event::Event,
};

pub const BATCH_PATH: &str = "/bc/v1/events/batch";
pub const APP_ID_HEADER: &str = "X-App-ID";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
    project_id: String,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    events: &'a [Event],
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BeaconError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}{}", config.server_url(), BATCH_PATH),
            api_key: config.api_key.clone(),
            project_id: config.project_id.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }
}

#[async_trait(?Send)]
impl TransportPort for HttpTransport {
    async fn send_batch(&self, events: &[Event]) -> DeliveryResult {
        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header(APP_ID_HEADER, &self.project_id)
            .json(&BatchBody { events })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return DeliveryResult::NetworkError(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            log::debug!("Delivered {} events ({})", events.len(), status);
            return DeliveryResult::Accepted;
        }

        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
        classify(status.as_u16(), &body, retry_after)
    }

    fn transport_name(&self) -> &str {
        "http"
    }
}

/// Map a non-success response onto a delivery outcome.
pub fn classify(status: u16, body: &str, retry_after: Option<Duration>) -> DeliveryResult {
    let message = format!("Error: {} - {}", status, body.trim());
    match status {
        429 => DeliveryResult::RateLimited { retry_after },
        500..=599 => DeliveryResult::ServerError { status, message },
        _ => DeliveryResult::ClientError { status, message },
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_retry_after)
}

/// `Retry-After` in (possibly fractional) seconds. HTTP-date values, and
/// values too large for a `Duration`, are ignored and fall back to the
/// computed backoff.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
