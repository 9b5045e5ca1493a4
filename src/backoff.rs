//! Exponential backoff with jitter for terminal reconnects.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay schedule for one recovery episode. Build a fresh one per episode.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            current: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            attempts: 0,
            max_attempts: config.reconnect_attempts,
        }
    }

    /// Delay before the next reconnect, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.with_jitter(self.current);
        let scaled = (self.current.as_millis() as f64 * self.multiplier).round();
        let next = if scaled.is_finite() && scaled > 0.0 {
            Duration::from_millis(scaled as u64)
        } else {
            self.current
        };
        self.current = next.min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn with_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let millis = base.as_millis() as f64;
        let range = millis * self.jitter;
        let offset: f64 = rand::rng().random_range(-range..=range);
        Duration::from_millis((millis + offset).max(1.0) as u64)
    }
}
