//! Token bucket state owned by the admission worker.
use std::fmt;
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ThrottleConfig;
use crate::error::err_config;
use crate::utils::Json;
use crate::Result;

/// The refill rate a submitter wants in force while its request is served.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// No refill limit: requests are admitted as soon as they reach the head.
    /// Their cost is still charged.
    Unlimited,
    /// One token per period.
    Every(Duration),
    /// Tokens per second.
    PerSecond(f64),
    /// Keep whatever rate the bucket currently has.
    Current,
}

impl Rate {
    /// Build a rate from a period in seconds. 0 means unlimited.
    pub fn from_period_secs(period: f64) -> Result<Self> {
        if !period.is_finite() || period < 0.0 {
            return Err(err_config!(
                "rate period must be finite and non-negative, got {period}"
            ));
        }
        let period = Duration::try_from_secs_f64(period)
            .map_err(|e| err_config!("rate period {period}s out of range: {e}"))?;
        Ok(period.into())
    }

    /// Build a rate from a number of tokens per second. 0 means unlimited.
    pub fn per_second(tokens: f64) -> Result<Self> {
        if !tokens.is_finite() || tokens < 0.0 {
            return Err(err_config!(
                "tokens per second must be finite and non-negative, got {tokens}"
            ));
        }
        if tokens == 0.0 {
            return Ok(Rate::Unlimited);
        }
        Ok(Rate::PerSecond(tokens))
    }

    /// Tokens per second, or `None` when the bucket rate should be left alone.
    pub(crate) fn refill_rate(&self) -> Option<f64> {
        match self {
            Rate::Unlimited => Some(0.0),
            Rate::Every(period) if period.is_zero() => Some(0.0),
            Rate::Every(period) => Some(1.0 / period.as_secs_f64()),
            Rate::PerSecond(tokens) if tokens.is_finite() && *tokens > 0.0 => Some(*tokens),
            Rate::PerSecond(_) => Some(0.0),
            Rate::Current => None,
        }
    }
}

impl From<Duration> for Rate {
    fn from(period: Duration) -> Self {
        if period.is_zero() {
            Rate::Unlimited
        } else {
            Rate::Every(period)
        }
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Unlimited => write!(f, "unlimited"),
            Rate::Every(period) => write!(f, "1 token every {period:?}"),
            Rate::PerSecond(tokens) => write!(f, "{tokens} tokens/s"),
            Rate::Current => write!(f, "current"),
        }
    }
}

/// Point-in-time view of the bucket, as seen by the admission worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens per second, 0 when unlimited.
    pub refill_rate: f64,
    pub default_cost: f64,
    /// Number of requests admitted so far.
    pub admitted: u64,
}

impl<'a> Json<'a> for BucketSnapshot {
    type Item = BucketSnapshot;
}

#[derive(Debug)]
pub(crate) struct BucketState {
    tokens: f64,
    capacity: f64,
    // tokens per second
    refill_rate: f64,
    default_cost: f64,
    tick_delay: Duration,
    last_refill: Option<Instant>,
    admitted: u64,
}

impl BucketState {
    pub(crate) fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            tokens: config.num_tokens.min(config.capacity),
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            default_cost: config.default_cost,
            tick_delay: config.delay(),
            last_refill: None,
            admitted: 0,
        }
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    /// A bucket with no refill rate or no capacity never holds anyone back.
    /// Only the latter is also free of charge.
    pub(crate) fn is_unlimited(&self) -> bool {
        self.refill_rate == 0.0 || self.capacity == 0.0
    }

    pub(crate) fn effective_cost(&self, cost: Option<f64>) -> f64 {
        cost.unwrap_or(self.default_cost)
    }

    /// Tokens needed before `cost` is admitted. Costs above capacity only
    /// need a full bucket, otherwise they could never be served.
    fn threshold(&self, cost: f64) -> f64 {
        cost.min(self.capacity)
    }

    pub(crate) fn is_sufficient(&self, cost: f64) -> bool {
        self.is_unlimited() || self.tokens >= self.threshold(cost)
    }

    /// Charge `cost` and return the admission sequence number.
    /// Tokens may go negative when `cost` exceeds capacity, or at any cost
    /// while the rate is unlimited. A bucket without capacity is never charged.
    pub(crate) fn admit(&mut self, cost: f64) -> u64 {
        if self.capacity != 0.0 {
            self.tokens -= cost;
        }
        let order = self.admitted;
        self.admitted += 1;
        order
    }

    /// Start measuring refill time if nothing has been measured yet.
    pub(crate) fn start_clock(&mut self, now: Instant) {
        if self.last_refill.is_none() {
            self.last_refill = Some(now);
        }
    }

    /// Credit the tokens earned since the last refill. No-op until the clock
    /// has been started.
    pub(crate) fn refill(&mut self, now: Instant) {
        let Some(last) = self.last_refill else {
            return;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        self.tokens = self
            .capacity
            .min(self.tokens + elapsed * self.refill_rate);
        self.last_refill = Some(now);
        trace!(
            "refill: {elapsed:.6}s elapsed, {:.3}/{:.3} tokens",
            self.tokens,
            self.capacity
        );
    }

    /// Switch to the rate a request asks for. Time already elapsed is
    /// credited at the previous rate first.
    pub(crate) fn set_rate(&mut self, rate: Rate, now: Instant) {
        if let Some(refill_rate) = rate.refill_rate() {
            self.refill(now);
            self.refill_rate = refill_rate;
        }
    }

    /// Exact time until `cost` becomes admissible, rounded up to the
    /// microsecond. Zero if it already is.
    pub(crate) fn wait_hint(&self, cost: f64) -> Duration {
        if self.is_sufficient(cost) {
            return Duration::ZERO;
        }
        let deficit = self.threshold(cost) - self.tokens;
        let micros = (deficit / self.refill_rate * 1e6).ceil();
        Duration::from_micros(micros as u64)
    }

    /// How long the worker sleeps before checking again, never less than a tick.
    pub(crate) fn next_sleep(&self, cost: f64) -> Duration {
        self.wait_hint(cost).max(self.tick_delay)
    }

    pub(crate) fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            tokens: self.tokens,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            default_cost: self.default_cost,
            admitted: self.admitted,
        }
    }
}
