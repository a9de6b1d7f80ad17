// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::circuit::BreakerConfig;
use crate::credential::validator::ValidatorConfig;
use crate::provider::Provider;
use crate::refresh::EngineConfig;

/// Configuration for the OAuth token lifecycle service.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "mcp-oauth", version, about = "OAuth token lifecycle service for MCP adapters")]
pub struct OAuthConfig {
    /// Host to bind on.
    #[arg(long, default_value = "127.0.0.1", env = "MCP_OAUTH_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9810, env = "MCP_OAUTH_PORT")]
    pub port: u16,

    /// Bearer token for admin API auth. If unset, auth is disabled.
    #[arg(long, env = "MCP_OAUTH_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Directory for persisted credentials. In-memory only if unset.
    #[arg(long, env = "MCP_OAUTH_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// JSON file of instance credentials to register at startup.
    #[arg(long, env = "MCP_OAUTH_INSTANCES")]
    pub instances: Option<PathBuf>,

    /// JSON file overriding provider token/probe URLs.
    #[arg(long, env = "MCP_OAUTH_PROVIDER_CONFIG")]
    pub provider_config: Option<PathBuf>,

    /// Base URL of the centralized OAuth broker. Direct refresh only if unset.
    #[arg(long, env = "MCP_OAUTH_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Providers that always bypass the broker (comma-separated).
    #[arg(long, value_delimiter = ',', env = "MCP_OAUTH_BROKER_DISABLED")]
    pub broker_disabled: Vec<Provider>,

    /// Refresh this many seconds before expiry. Per-provider default if unset.
    #[arg(long, env = "MCP_OAUTH_REFRESH_BUFFER_SECS")]
    pub refresh_buffer_secs: Option<u64>,

    /// Attempts per refresh before giving up on temporary errors.
    #[arg(long, default_value_t = 3, env = "MCP_OAUTH_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Timeout for each outbound token or probe request.
    #[arg(long, default_value_t = 15_000, env = "MCP_OAUTH_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,

    /// Consecutive failures that open an endpoint's circuit.
    #[arg(long, default_value_t = 5, env = "MCP_OAUTH_BREAKER_THRESHOLD")]
    pub breaker_threshold: u32,

    /// How long an open circuit waits before a trial call.
    #[arg(long, default_value_t = 60_000, env = "MCP_OAUTH_BREAKER_RESET_MS")]
    pub breaker_reset_ms: u64,

    /// Upper bound on a single retry delay.
    #[arg(long, default_value_t = 30_000, env = "MCP_OAUTH_BACKOFF_MAX_MS")]
    pub backoff_max_ms: u64,

    /// Lifetime of a cached validation result.
    #[arg(long, default_value_t = 300, env = "MCP_OAUTH_VALIDATION_TTL_SECS")]
    pub validation_ttl_secs: u64,

    /// Skip the provider API probe during validation.
    #[arg(long, env = "MCP_OAUTH_NO_VALIDATION_PROBE")]
    pub no_validation_probe: bool,

    /// Interval for the periodic metrics summary log. 0 disables it.
    #[arg(long, default_value_t = 300, env = "MCP_OAUTH_METRICS_LOG_SECS")]
    pub metrics_log_secs: u64,

    /// Log format (json or text).
    #[arg(long, default_value = "text", env = "MCP_OAUTH_LOG_FORMAT")]
    pub log_format: String,

    /// Log level filter, used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "MCP_OAUTH_LOG_LEVEL")]
    pub log_level: String,
}

impl OAuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn metrics_log_interval(&self) -> Option<Duration> {
        (self.metrics_log_secs > 0).then(|| Duration::from_secs(self.metrics_log_secs))
    }

    /// Path of the persisted credential file, if a state dir is configured.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join("credentials.json"))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_threshold.max(1),
            reset_timeout: Duration::from_millis(self.breaker_reset_ms),
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig { max_delay: Duration::from_millis(self.backoff_max_ms), ..BackoffConfig::default() }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            refresh_buffer: self.refresh_buffer_secs.map(Duration::from_secs),
            max_attempts: self.max_attempts.max(1),
            request_timeout: self.request_timeout(),
            broker_url: self.broker_url.as_ref().map(|url| url.trim_end_matches('/').to_owned()),
            broker_disabled: self.broker_disabled.clone(),
            backoff: self.backoff_config(),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            ttl: Duration::from_secs(self.validation_ttl_secs),
            probe: !self.no_validation_probe,
            request_timeout: self.request_timeout(),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
