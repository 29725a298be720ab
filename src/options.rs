use std::time::Duration;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::config::ThrottleConfig;
use crate::{Result, Throttle};

#[derive(Debug, Clone, Default)]
pub struct ThrottleOptions {
    config: ThrottleConfig,
}

impl ThrottleOptions {
    pub fn new() -> Self {
        Self {
            config: Default::default(),
        }
    }

    pub fn from_config(config: ThrottleConfig) -> Self {
        Self { config }
    }

    pub fn validate(self) -> Result<Self> {
        self.config.validate()?;
        Ok(self)
    }

    /// Spawn the throttle on the current tokio runtime.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<Throttle> {
        Throttle::new(cancel, self.config.clone())
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Tokens in the bucket at start.
    /// Anything above capacity is dropped when the throttle is spawned.
    pub fn num_tokens(mut self, tokens: f64) -> Self {
        self.config.num_tokens = tokens;
        self
    }

    /// Shortest sleep between two bucket checks.
    /// Rounded down to whole milliseconds, and never below 1ms.
    pub fn delay(mut self, delay: Duration) -> Self {
        let millis = delay.as_millis().clamp(1, u64::MAX as u128) as u64;
        if delay.subsec_nanos() % 1_000_000 != 0 || delay.is_zero() {
            warn!("tick delay {delay:?} rounded to {millis}ms");
        }
        self.config.delay_ms = millis;
        self
    }

    /// Tokens added per second until a request brings its own rate.
    /// 0 means unlimited.
    pub fn refill_rate(mut self, tokens_per_sec: f64) -> Self {
        self.config.refill_rate = tokens_per_sec;
        self
    }

    /// Cost charged when a request does not name one.
    pub fn default_cost(mut self, cost: f64) -> Self {
        self.config.default_cost = cost;
        self
    }

    /// Bucket size. 0 disables throttling.
    pub fn capacity(mut self, capacity: f64) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn max_queue_depth(mut self, depth: usize) -> Self {
        self.config.max_queue_depth = depth;
        self
    }
}
