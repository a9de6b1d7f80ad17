// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry delay computation: exponential growth per error category, capped,
//! with additive jitter.

use std::time::Duration;

use rand::Rng;

use crate::classify::{ClassifiedError, ErrorType};

/// Maximum jitter added on top of the exponential delay.
const MAX_JITTER: Duration = Duration::from_millis(1000);

/// Base delays and cap for [`BackoffScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Base for network, malformed-request and unknown failures.
    pub network_base: Duration,
    /// Base for server errors and service outages.
    pub server_base: Duration,
    /// Base for rate limiting.
    pub rate_limit_base: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            network_base: Duration::from_millis(1000),
            server_base: Duration::from_millis(2000),
            rate_limit_base: Duration::from_millis(5000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// Pure retry-delay calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffScheduler {
    config: BackoffConfig,
}

impl BackoffScheduler {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Starting delay for an error category.
    pub fn base_for(&self, error_type: ErrorType) -> Duration {
        match error_type {
            ErrorType::RateLimited => self.config.rate_limit_base,
            ErrorType::ServiceUnavailable | ErrorType::ServerError => self.config.server_base,
            _ => self.config.network_base,
        }
    }

    /// Delay before retry number `attempt` (1-based) without jitter:
    /// `base * 2^(attempt-1)`, capped.
    pub fn base_delay(&self, attempt: u32, err: &ClassifiedError) -> Duration {
        let base_ms = duration_ms(self.base_for(err.error_type));
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let cap_ms = duration_ms(self.config.max_delay);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// Delay before retry number `attempt` with random jitter.
    pub fn delay(&self, attempt: u32, err: &ClassifiedError) -> Duration {
        let unit: f64 = rand::rng().random();
        self.delay_with_jitter(attempt, err, unit)
    }

    /// Delay with an explicit jitter sample in `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, err: &ClassifiedError, unit: f64) -> Duration {
        let base = self.base_for(err.error_type);
        let jitter_span = duration_ms(base.min(MAX_JITTER)) as f64;
        let jitter = Duration::from_millis((unit.clamp(0.0, 1.0) * jitter_span) as u64);
        (self.base_delay(attempt, err) + jitter).min(self.config.max_delay)
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
