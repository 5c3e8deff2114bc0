//! Exponential reconnect backoff.

use std::time::Duration;

/// Exponential backoff with jitter.
///
/// Delays double from `base` up to `cap`, each drawn ±25% to keep a fleet
/// of reconnecting servers from thundering in step.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    /// Unbounded backoff from `base` capped at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, max_attempts: None, attempt: 0 }
    }

    /// Give up after `max_attempts` delays.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Next delay, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exponent = self.attempt.min(16);
        self.attempt += 1;

        let base_ms = self.base.as_millis() as u64;
        let cap_ms = self.cap.as_millis() as u64;
        let raw = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);

        let jitter_range = raw / 4;
        let jittered = if jitter_range > 0 {
            raw - jitter_range + fastrand::u64(0..=jitter_range * 2)
        } else {
            raw
        };
        Some(Duration::from_millis(jittered.min(cap_ms.saturating_add(cap_ms / 4))))
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
