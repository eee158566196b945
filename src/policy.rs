// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Policy
//!
//! This module defines the policy driving automatic recovery: whether
//! reconnection is enabled, how the delay between attempts grows, where it
//! is capped, and how many attempts are made before giving up. Delays follow
//! bounded exponential backoff with an optional uniform jitter of up to +10%
//! to avoid synchronized retry storms.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Policy for automatic session recovery.
///
/// Implements the builder pattern for configuration. The policy is immutable
/// once a connector has been built from it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    pub(crate) enabled: bool,
    pub(crate) initial_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
    /// Maximum number of reconnection attempts, 0 meaning unbounded.
    pub(crate) max_retries: u32,
    pub(crate) backoff_multiplier: f64,
    pub(crate) jitter: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        ReconnectionPolicy {
            enabled: true,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: 0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Creates a new policy with default settings.
    pub fn new() -> ReconnectionPolicy {
        ReconnectionPolicy::default()
    }

    /// Disables automatic reconnection entirely.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Sets the delay before the first reconnection attempt.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn initial_delay_ms(mut self, delay: u64) -> Self {
        self.initial_delay_ms = delay;
        self
    }

    /// Sets the cap applied to the computed backoff delay.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the maximum number of reconnection attempts, 0 for unbounded.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the backoff multiplier, clamped to at least 1.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Disables the random jitter applied to computed delays.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether automatic reconnection is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Raw backoff delay for the given attempt, without jitter:
    /// `min(max_delay, initial_delay * multiplier^attempt)`.
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay to wait before the given attempt, with jitter applied when
    /// enabled. The jitter stretches the delay by a uniform factor in
    /// `[1.0, 1.1)`.
    pub(crate) fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        if !self.jitter {
            return base;
        }
        base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_delay_per_attempt() {
        let policy = ReconnectionPolicy::new().without_jitter();
        for (attempt, expected) in [(0, 1_000), (1, 2_000), (2, 4_000), (3, 8_000)] {
            assert_eq!(
                policy.backoff_delay(attempt),
                Duration::from_millis(expected)
            );
        }
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = ReconnectionPolicy::new().max_delay_ms(5_000).without_jitter();
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = ReconnectionPolicy::new();
        for _ in 0..100 {
            let delay = policy.next_delay(0);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_100));
        }
    }

    #[test]
    fn multiplier_is_clamped_to_one() {
        let policy = ReconnectionPolicy::new()
            .backoff_multiplier(0.5)
            .without_jitter();
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1_000));
    }
}
