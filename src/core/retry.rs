//! Exponential backoff shared by the durable queue and the transcription queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy with capped exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay() -> u64 {
    5000
}
fn default_max_delay() -> u64 {
    60000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-indexed): `base * mult^(retry - 1)`, capped
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::from_millis(self.base_delay_ms.min(self.max_delay_ms));
        }

        let delay =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi((retry - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}
