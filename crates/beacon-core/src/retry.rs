//! Exponential backoff with jitter, shared by the delivery worker and the
//! realtime listener's reconnect loop.

use std::time::Duration;
use rand::Rng;
use beacon_types::config::{DeliveryConfig, ListenerConfig};

/// Backoff parameters in a form both retry loops can use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    /// Delay before retry number `retry` (1 = first retry).
    /// `initial * 2^(retry-1)`, capped at `max`, then jittered by ±`jitter`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30);
        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);
        apply_jitter(base, self.jitter).min(self.max)
    }
}

impl From<&DeliveryConfig> for Backoff {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter,
        }
    }
}

impl From<&ListenerConfig> for Backoff {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            jitter: 0.2,
        }
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let jitter = jitter.min(1.0);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}
