// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breakers guarding external token endpoints.
//!
//! One breaker per endpoint category (e.g. `direct:reddit`), shared by every
//! instance that calls that endpoint. State transitions are taken under a
//! per-breaker mutex so admission and outcome recording never interleave.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::backoff::duration_ms;
use crate::state::epoch_ms;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_millis(60_000) }
    }
}

/// Failure returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum CircuitError<E> {
    /// Rejected without running the call.
    Open { key: String, retry_after: Duration },
    /// The call ran and failed.
    Inner(E),
}

/// Point-in-time view of a breaker, for logs and the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    next_attempt_at: Option<Instant>,
}

pub struct CircuitBreaker {
    key: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt_at: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let now = Instant::now();
        CircuitSnapshot {
            key: self.key.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            next_attempt_at_ms: inner.next_attempt_at.map(|at| {
                epoch_ms().saturating_add(duration_ms(at.saturating_duration_since(now)))
            }),
        }
    }

    /// Force the breaker back to `CLOSED`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt_at = None;
    }

    /// Run `f` through the breaker; every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Run `f` through the breaker. Errors for which `trips` returns false
    /// prove the endpoint is answering and are recorded like a success.
    pub async fn call_classified<T, E, F, Fut, P>(
        &self,
        f: F,
        trips: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let mut permit = self
            .admit()
            .map_err(|retry_after| CircuitError::Open { key: self.key.clone(), retry_after })?;
        let result = f().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(e) if trips(e) => permit.fail(),
            Err(_) => permit.succeed(),
        }
        result.map_err(CircuitError::Inner)
    }

    /// Admit one call, or return how long until the next trial is allowed.
    fn admit(&self) -> Result<Permit<'_>, Duration> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Ok(Permit { breaker: self, trial: false, settled: false }),
            CircuitState::Open => {
                let at = inner.next_attempt_at.unwrap_or(now);
                if now >= at {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(breaker = %self.key, "circuit half-open, allowing trial call");
                    Ok(Permit { breaker: self, trial: true, settled: false })
                } else {
                    Err(at - now)
                }
            }
            // A trial call is already in flight.
            CircuitState::HalfOpen => Err(Duration::ZERO),
        }
    }
}

/// Admission ticket for one call. Settles the outcome exactly once; a trial
/// dropped without an outcome (cancelled) re-opens with an immediate retry.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(&mut self) {
        self.settled = true;
        let mut inner = self.breaker.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(breaker = %self.breaker.key, "circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.next_attempt_at = None;
    }

    fn fail(&mut self) {
        self.settled = true;
        let config = self.breaker.config;
        let mut inner = self.breaker.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        let reopen = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= config.failure_threshold,
            // Concurrent calls admitted before the breaker opened.
            CircuitState::Open => false,
        };
        if reopen {
            inner.state = CircuitState::Open;
            inner.next_attempt_at = Some(Instant::now() + config.reset_timeout);
            tracing::warn!(
                breaker = %self.breaker.key,
                failures = inner.failure_count,
                reset_ms = duration_ms(config.reset_timeout),
                "circuit opened"
            );
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Open;
                inner.next_attempt_at = Some(Instant::now());
            }
        }
    }
}

/// Process-wide set of breakers, created on first use per key.
pub struct CircuitRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config))),
        )
    }

    /// Snapshots of every known breaker, sorted by key.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<_> = self.breakers.lock().values().map(Arc::clone).collect();
        let mut out: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
#[path = "circuit_tests.rs"]
mod tests;
