//! Reconnect backoff: exponential with jitter, capped

use crate::io::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomised either way (0.0 disables jitter)
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Millisecond-scale delays for tests
    pub fn fast() -> Self {
        BackoffConfig {
            initial_ms: 5,
            max_ms: 50,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Backoff state for one reconnect sequence
pub struct Backoff<R: Rng> {
    config: BackoffConfig,
    rng: R,
    attempt: u32,
}

impl<R: Rng> Backoff<R> {
    pub fn new(config: BackoffConfig, rng: R) -> Self {
        Backoff {
            config,
            rng,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(32) as i32;
        let base = (self.config.initial_ms as f64) * self.config.multiplier.max(1.0).powi(exp);
        let anchor = base.min(self.config.max_ms as f64);

        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        let delay_ms = if ratio > 0.0 {
            let span = anchor * ratio;
            let lower = (anchor - span).max(0.0);
            let upper = (anchor + span).min(self.config.max_ms as f64);
            lower + (upper - lower) * self.rng.gen_unit()
        } else {
            anchor
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Start over from the initial delay (after a successful subscribe)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
