// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh attempt metrics and health assessment.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classify::ErrorType;
use crate::state::epoch_ms;

/// Latencies kept per instance for the rolling average.
const LATENCY_WINDOW: usize = 20;
/// Entries kept in the recent-activity ring.
const RECENT_CAPACITY: usize = 20;
/// Error types listed in the export.
const TOP_ERRORS: usize = 5;

const UNHEALTHY_SUCCESS_RATE: f64 = 0.90;
const DEGRADED_SUCCESS_RATE: f64 = 0.95;
const UNHEALTHY_LATENCY_MS: f64 = 5000.0;
const DEGRADED_LATENCY_MS: f64 = 2500.0;

/// Which path an attempt took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMethod {
    Broker,
    Direct,
}

impl RefreshMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Direct => "direct",
        }
    }
}

/// One timed refresh or exchange attempt. Times are epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshAttempt {
    pub instance_id: String,
    pub method: RefreshMethod,
    pub start_ms: u64,
    pub end_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RefreshAttempt {
    pub fn latency_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Counters for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean over the last few attempts.
    pub average_latency_ms: f64,
    pub last_attempt_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_type: Option<ErrorType>,
    #[serde(skip)]
    latencies: VecDeque<u64>,
}

impl InstanceStats {
    fn record(&mut self, attempt: &RefreshAttempt) {
        self.attempts += 1;
        if attempt.success {
            self.successes += 1;
        } else {
            self.failures += 1;
            self.last_error_type = attempt.error_type;
        }
        self.last_attempt_ms = attempt.end_ms;
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(attempt.latency_ms());
        let sum: u64 = self.latencies.iter().sum();
        self.average_latency_ms = sum as f64 / self.latencies.len() as f64;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    attempts: u64,
    successes: u64,
}

impl Counts {
    fn failures(&self) -> u64 {
        self.attempts - self.successes
    }

    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    totals: Counts,
    total_latency_ms: u64,
    by_method: HashMap<RefreshMethod, Counts>,
    instances: HashMap<String, InstanceStats>,
    errors: HashMap<ErrorType, u64>,
    recent: VecDeque<RefreshAttempt>,
}

impl Inner {
    fn average_latency_ms(&self) -> f64 {
        if self.totals.attempts == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.totals.attempts as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub total_attempts: u64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub instances: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub average_latency_ms: f64,
    pub by_method: BTreeMap<RefreshMethod, MethodSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub error_type: ErrorType,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub top: Vec<ErrorCount>,
}

/// JSON document for external monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    pub generated_at_ms: u64,
    pub overview: Overview,
    pub performance: Performance,
    pub errors: ErrorSummary,
    pub instances: BTreeMap<String, InstanceStats>,
    pub recent: Vec<RefreshAttempt>,
    pub health: HealthReport,
}

/// Thread-safe recorder owned by the process context.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: Mutex<Inner>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, attempt: RefreshAttempt) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.totals.attempts += 1;
        inner.total_latency_ms = inner.total_latency_ms.saturating_add(attempt.latency_ms());

        let method = inner.by_method.entry(attempt.method).or_default();
        method.attempts += 1;
        if attempt.success {
            method.successes += 1;
            inner.totals.successes += 1;
        } else if let Some(error_type) = attempt.error_type {
            *inner.errors.entry(error_type).or_default() += 1;
        }

        inner.instances.entry(attempt.instance_id.clone()).or_default().record(&attempt);

        if inner.recent.len() == RECENT_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(attempt);
    }

    pub fn instance_stats(&self, instance_id: &str) -> Option<InstanceStats> {
        self.inner.lock().instances.get(instance_id).cloned()
    }

    pub fn health_assessment(&self) -> HealthReport {
        let inner = self.inner.lock();
        assess(&inner)
    }

    /// Most frequent error types, ties broken by name.
    pub fn top_errors(&self, n: usize) -> Vec<ErrorCount> {
        top_errors(&self.inner.lock(), n)
    }

    pub fn export(&self) -> MetricsExport {
        let inner = self.inner.lock();
        let by_method = inner
            .by_method
            .iter()
            .map(|(method, c)| {
                let summary = MethodSummary {
                    attempts: c.attempts,
                    successes: c.successes,
                    failures: c.failures(),
                    success_rate: c.success_rate(),
                };
                (*method, summary)
            })
            .collect();
        MetricsExport {
            generated_at_ms: epoch_ms(),
            overview: Overview {
                total_attempts: inner.totals.attempts,
                successes: inner.totals.successes,
                failures: inner.totals.failures(),
                success_rate: inner.totals.success_rate(),
                instances: inner.instances.len(),
            },
            performance: Performance { average_latency_ms: inner.average_latency_ms(), by_method },
            errors: ErrorSummary {
                total: inner.errors.values().sum(),
                top: top_errors(&inner, TOP_ERRORS),
            },
            instances: inner.instances.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            recent: inner.recent.iter().cloned().collect(),
            health: assess(&inner),
        }
    }

    /// Emit one structured summary event.
    pub fn log_summary(&self) {
        let export = self.export();
        let top = export
            .errors
            .top
            .iter()
            .map(|e| format!("{}={}", e.error_type, e.count))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            attempts = export.overview.total_attempts,
            successes = export.overview.successes,
            failures = export.overview.failures,
            success_rate = export.overview.success_rate,
            avg_latency_ms = export.performance.average_latency_ms,
            instances = export.overview.instances,
            health = ?export.health.status,
            top_errors = %top,
            "token refresh metrics"
        );
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }
}

fn top_errors(inner: &Inner, n: usize) -> Vec<ErrorCount> {
    let mut counts: Vec<_> = inner
        .errors
        .iter()
        .map(|(error_type, count)| ErrorCount { error_type: *error_type, count: *count })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error_type.as_str().cmp(b.error_type.as_str())));
    counts.truncate(n);
    counts
}

fn assess(inner: &Inner) -> HealthReport {
    let success_rate = inner.totals.success_rate();
    let average_latency_ms = inner.average_latency_ms();
    let mut issues = Vec::new();
    let mut status = HealthStatus::Healthy;

    if inner.totals.attempts > 0 {
        if success_rate < UNHEALTHY_SUCCESS_RATE {
            status = HealthStatus::Unhealthy;
            issues.push(format!("success rate {:.1}% below 90%", success_rate * 100.0));
        } else if success_rate < DEGRADED_SUCCESS_RATE {
            status = HealthStatus::Degraded;
            issues.push(format!("success rate {:.1}% below 95%", success_rate * 100.0));
        }

        if average_latency_ms > UNHEALTHY_LATENCY_MS {
            status = HealthStatus::Unhealthy;
            issues.push(format!("average latency {average_latency_ms:.0}ms above 5000ms"));
        } else if average_latency_ms > DEGRADED_LATENCY_MS {
            if status == HealthStatus::Healthy {
                status = HealthStatus::Degraded;
            }
            issues.push(format!("average latency {average_latency_ms:.0}ms above 2500ms"));
        }
    }

    HealthReport {
        status,
        success_rate,
        average_latency_ms,
        total_attempts: inner.totals.attempts,
        issues,
    }
}

/// Spawn a task that logs a metrics summary every `interval` until shutdown.
pub fn spawn_metrics_reporter(
    metrics: Arc<MetricsRecorder>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            metrics.log_summary();
        }
    })
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
