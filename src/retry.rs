// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Backoff
//!
//! Exponential backoff with multiplicative jitter, shared by the dial loop of
//! the connection provider and the per-message retry loop of the consumer.

use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter factor applied to every delay.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter factor applied to every delay.
pub const JITTER_MAX: f64 = 1.2;

/// Exponential backoff parameters.
///
/// For attempt `n >= 1` the delay is
/// `min(initial * multiplier^(n-1) * jitter, max)` with `jitter` drawn
/// uniformly from `[JITTER_MIN, JITTER_MAX]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        RetryPolicy {
            initial,
            max,
            multiplier,
        }
    }

    /// Delay to wait before attempt `attempt + 1`, with a random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.backoff_with_jitter(attempt, jitter)
    }

    /// Deterministic form of [`RetryPolicy::backoff`]; `jitter` is clamped
    /// into the allowed range. Attempt `0` is treated as attempt `1`.
    pub fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);
        let cap = self.max.as_secs_f64() * 1000.0;
        let millis = (base * jitter.clamp(JITTER_MIN, JITTER_MAX)).min(cap);

        if millis.is_nan() || millis <= 0.0 {
            return Duration::ZERO;
        }

        Duration::from_millis(millis as u64)
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
