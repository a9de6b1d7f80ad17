// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token refresh engine: expiry check, broker/direct strategy, retries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::exchange::{ExchangeError, TokenExchange};
use super::flight::FlightGroup;
use crate::backoff::{duration_ms, BackoffConfig, BackoffScheduler};
use crate::circuit::{CircuitError, CircuitRegistry};
use crate::classify::{classify, ErrorType, RawError};
use crate::credential::{CredentialStore, InstanceCredentials, StatusUpdate, TokenRecord};
use crate::error::AuthError;
use crate::metrics::{MetricsRecorder, RefreshAttempt, RefreshMethod};
use crate::provider::{ClientCredentials, Grant, Provider, ProviderRegistry, TokenResponse};
use crate::state::epoch_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Overrides every provider's default refresh buffer when set.
    pub refresh_buffer: Option<Duration>,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub broker_url: Option<String>,
    /// Providers that always go direct.
    pub broker_disabled: Vec<Provider>,
    pub backoff: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_buffer: None,
            max_attempts: 3,
            request_timeout: Duration::from_secs(15),
            broker_url: None,
            broker_disabled: Vec::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Whether `record` is expired or inside the refresh buffer. Inclusive at
/// the boundary; a record without an expiry always needs a refresh.
pub fn needs_refresh(record: &TokenRecord, now_ms: u64, buffer: Duration) -> bool {
    match record.expires_at {
        None => true,
        Some(at) => {
            now_ms >= at.saturating_sub(duration_ms(buffer))
        }
    }
}

/// Convert a token response into a stored record, keeping the previous
/// refresh token and scope when the provider omits them.
pub fn normalize(resp: &TokenResponse, prior: &TokenRecord, now_ms: u64) -> TokenRecord {
    TokenRecord {
        access_token: Some(resp.access_token.clone()),
        refresh_token: resp.refresh_token.clone().or_else(|| prior.refresh_token.clone()),
        expires_at: resp.expires_in.map(|secs| now_ms.saturating_add(secs.saturating_mul(1000))),
        token_type: resp.token_type.clone().unwrap_or_else(|| prior.token_type.clone()),
        scope: resp.scope.clone().or_else(|| prior.scope.clone()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Refresh,
    Exchange,
}

/// Outcome of one pass over the strategy list.
enum AttemptError {
    /// Ends the operation without classification or store writes.
    Terminal(AuthError),
    /// Classify and decide between retry and failure.
    Failed(RawError),
}

pub struct TokenRefreshEngine {
    config: EngineConfig,
    store: Arc<dyn CredentialStore>,
    exchange: TokenExchange,
    circuits: Arc<CircuitRegistry>,
    metrics: Arc<MetricsRecorder>,
    backoff: BackoffScheduler,
    flights: FlightGroup<Result<TokenRecord, AuthError>>,
}

impl TokenRefreshEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CredentialStore>,
        providers: Arc<ProviderRegistry>,
        circuits: Arc<CircuitRegistry>,
        metrics: Arc<MetricsRecorder>,
        client: reqwest::Client,
    ) -> Self {
        let exchange =
            TokenExchange::new(client, providers, config.broker_url.clone(), config.request_timeout);
        let backoff = BackoffScheduler::new(config.backoff);
        Self { config, store, exchange, circuits, metrics, backoff, flights: FlightGroup::new() }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn refresh_buffer(&self, provider: Provider) -> Duration {
        self.config.refresh_buffer.unwrap_or_else(|| provider.default_refresh_buffer())
    }

    /// Number of refreshes or exchanges currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Return a usable token for `instance_id`, refreshing it if needed.
    pub async fn ensure_valid_token(
        self: &Arc<Self>,
        instance_id: &str,
    ) -> Result<TokenRecord, AuthError> {
        self.ensure_valid_token_with(instance_id, CancellationToken::new()).await
    }

    /// [`ensure_valid_token`](Self::ensure_valid_token) with a caller-owned
    /// cancellation token. Cancelling aborts in-progress requests and skips
    /// every store write.
    pub async fn ensure_valid_token_with(
        self: &Arc<Self>,
        instance_id: &str,
        cancel: CancellationToken,
    ) -> Result<TokenRecord, AuthError> {
        let creds = self.load(instance_id).await?;
        if !needs_refresh(&creds.token, epoch_ms(), self.refresh_buffer(creds.provider)) {
            return Ok(creds.token);
        }
        self.coalesced(instance_id, Operation::Refresh, cancel).await
    }

    /// Obtain a first token from the instance's client credentials.
    pub async fn exchange_credentials(
        self: &Arc<Self>,
        instance_id: &str,
        cancel: CancellationToken,
    ) -> Result<TokenRecord, AuthError> {
        self.coalesced(instance_id, Operation::Exchange, cancel).await
    }

    /// Run `op` under the instance's single-flight key. The leader's token
    /// governs the shared work; a follower's token only ends its own wait.
    /// A follower whose leader was cancelled starts or joins a new flight.
    async fn coalesced(
        self: &Arc<Self>,
        instance_id: &str,
        op: Operation,
        cancel: CancellationToken,
    ) -> Result<TokenRecord, AuthError> {
        loop {
            let engine = Arc::clone(self);
            let owned = instance_id.to_owned();
            let leader_cancel = cancel.clone();
            let (flight, leader) = self.flights.join_or_start(instance_id, move || async move {
                engine.run(&owned, op, leader_cancel).await
            });

            if leader {
                return flight.await.unwrap_or_else(|e| Err(AuthError::Internal(e.to_string())));
            }
            tracing::debug!(instance = %instance_id, "joining in-flight token operation");
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                res = flight => res.unwrap_or_else(|e| Err(AuthError::Internal(e.to_string()))),
            };
            if matches!(res, Err(AuthError::Cancelled)) && !cancel.is_cancelled() {
                tracing::debug!(instance = %instance_id, "in-flight operation cancelled by its leader, retrying");
                continue;
            }
            return res;
        }
    }

    async fn load(&self, instance_id: &str) -> Result<InstanceCredentials, AuthError> {
        self.store
            .get(instance_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AuthError::UnknownInstance(instance_id.to_owned()))
    }

    async fn run(
        &self,
        instance_id: &str,
        op: Operation,
        cancel: CancellationToken,
    ) -> Result<TokenRecord, AuthError> {
        let creds = self.load(instance_id).await?;
        let provider = creds.provider;

        let grant = match op {
            Operation::Refresh => {
                // A flight that finished between the caller's check and ours.
                if !needs_refresh(&creds.token, epoch_ms(), self.refresh_buffer(provider)) {
                    return Ok(creds.token);
                }
                match creds.token.refresh_token.as_deref() {
                    Some(token) if !token.is_empty() => Grant::RefreshToken(token.to_owned()),
                    _ => {
                        tracing::warn!(
                            instance = %instance_id,
                            provider = %provider,
                            "no refresh token stored, re-authorization required"
                        );
                        let error_type = ErrorType::InvalidRefreshToken;
                        return Err(AuthError::ReauthRequired {
                            instance: instance_id.to_owned(),
                            error_type,
                            message: error_type.user_message().to_owned(),
                        });
                    }
                }
            }
            Operation::Exchange => {
                if creds.client_id.is_empty() || creds.client_secret.is_empty() {
                    return Err(AuthError::Validation {
                        errors: vec!["client_id and client_secret are required".to_owned()],
                    });
                }
                Grant::ClientCredentials
            }
        };

        let paths = self.paths(provider, &grant);
        if paths.is_empty() {
            return Err(AuthError::Validation {
                errors: vec![format!("{provider} does not support the client_credentials grant")],
            });
        }
        let client = creds.client();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let raw = match self
                .attempt(instance_id, provider, &grant, &client, &paths, &cancel)
                .await
            {
                Ok(resp) => {
                    let record = normalize(&resp, &creds.token, epoch_ms());
                    self.store
                        .update(instance_id, StatusUpdate::active(record.clone()))
                        .await
                        .map_err(store_err)?;
                    tracing::info!(
                        instance = %instance_id,
                        provider = %provider,
                        grant = grant.grant_type(),
                        attempt,
                        expires_at = ?record.expires_at,
                        "token refreshed"
                    );
                    return Ok(record);
                }
                Err(AttemptError::Terminal(e)) => {
                    tracing::warn!(instance = %instance_id, provider = %provider, attempt, err = %e, "token refresh aborted");
                    return Err(e);
                }
                Err(AttemptError::Failed(raw)) => raw,
            };

            let classified = classify(&raw);
            let error_type = classified.error_type;
            let stored_error = format!("{error_type}: {}", classified.user_message);

            if classified.requires_reauth {
                tracing::warn!(
                    instance = %instance_id,
                    provider = %provider,
                    error_type = %error_type,
                    attempt,
                    err = %raw,
                    "token refresh requires re-authorization"
                );
                self.store
                    .update(instance_id, StatusUpdate::reauth(stored_error))
                    .await
                    .map_err(store_err)?;
                return Err(AuthError::ReauthRequired {
                    instance: instance_id.to_owned(),
                    error_type,
                    message: classified.user_message.to_owned(),
                });
            }

            if classified.is_temporary && attempt < self.config.max_attempts {
                let delay = self.backoff.delay(attempt, &classified);
                tracing::info!(
                    instance = %instance_id,
                    provider = %provider,
                    error_type = %error_type,
                    attempt,
                    delay_ms = duration_ms(delay),
                    "retrying token refresh"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            tracing::error!(
                instance = %instance_id,
                provider = %provider,
                error_type = %error_type,
                attempt,
                err = %raw,
                "token refresh failed"
            );
            self.store
                .update(instance_id, StatusUpdate::failed(stored_error))
                .await
                .map_err(store_err)?;
            return Err(AuthError::RefreshFailed {
                instance: instance_id.to_owned(),
                error_type,
                attempts: attempt,
                message: classified.user_message.to_owned(),
            });
        }
    }

    /// Ordered strategy list for `provider` and `grant`.
    fn paths(&self, provider: Provider, grant: &Grant) -> Vec<RefreshMethod> {
        let mut paths = Vec::with_capacity(2);
        if self.exchange.has_broker() && !self.config.broker_disabled.contains(&provider) {
            paths.push(RefreshMethod::Broker);
        }
        let direct = match grant {
            Grant::RefreshToken(_) => true,
            Grant::ClientCredentials => provider.supports_client_credentials(),
        };
        if direct {
            paths.push(RefreshMethod::Direct);
        }
        paths
    }

    /// Try each path in order. Falls through to the next path only when the
    /// broker is unavailable or its circuit is open.
    async fn attempt(
        &self,
        instance_id: &str,
        provider: Provider,
        grant: &Grant,
        client: &ClientCredentials,
        paths: &[RefreshMethod],
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, AttemptError> {
        let mut last = None;
        for (idx, &method) in paths.iter().enumerate() {
            let has_fallback = idx + 1 < paths.len();
            let breaker = self.circuits.get(&format!("{}:{provider}", method.as_str()));
            let start_ms = epoch_ms();
            let call = breaker.call_classified(
                || self.exchange_via(method, provider, grant, client),
                ExchangeError::trips_breaker,
            );
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Terminal(AuthError::Cancelled)),
                res = call => res,
            };
            let end_ms = epoch_ms();

            match outcome {
                Ok(resp) => {
                    self.record(instance_id, method, start_ms, end_ms, None);
                    return Ok(resp);
                }
                Err(CircuitError::Open { key, retry_after }) => {
                    if has_fallback {
                        tracing::info!(instance = %instance_id, breaker = %key, "circuit open, trying next path");
                        continue;
                    }
                    return Err(AttemptError::Terminal(AuthError::CircuitOpen {
                        key,
                        next_attempt_at_ms: epoch_ms().saturating_add(duration_ms(retry_after)),
                    }));
                }
                Err(CircuitError::Inner(ExchangeError::BrokerUnavailable(raw))) => {
                    self.record(instance_id, method, start_ms, end_ms, Some(&raw));
                    tracing::warn!(
                        instance = %instance_id,
                        provider = %provider,
                        err = %raw,
                        "broker unavailable, falling back to direct"
                    );
                    last = Some(raw);
                }
                Err(CircuitError::Inner(ExchangeError::Provider(raw))) => {
                    self.record(instance_id, method, start_ms, end_ms, Some(&raw));
                    return Err(AttemptError::Failed(raw));
                }
            }
        }
        Err(AttemptError::Failed(
            last.unwrap_or_else(|| RawError::Other("service unavailable: no token path".to_owned())),
        ))
    }

    async fn exchange_via(
        &self,
        method: RefreshMethod,
        provider: Provider,
        grant: &Grant,
        client: &ClientCredentials,
    ) -> Result<TokenResponse, ExchangeError> {
        match method {
            RefreshMethod::Broker => self.exchange.broker(provider, grant, client).await,
            RefreshMethod::Direct => self.exchange.direct(provider, grant, client).await,
        }
    }

    fn record(
        &self,
        instance_id: &str,
        method: RefreshMethod,
        start_ms: u64,
        end_ms: u64,
        failure: Option<&RawError>,
    ) {
        self.metrics.record(RefreshAttempt {
            instance_id: instance_id.to_owned(),
            method,
            start_ms,
            end_ms,
            success: failure.is_none(),
            error_type: failure.map(|raw| classify(raw).error_type),
            error_message: failure.map(ToString::to_string),
        });
    }
}

fn store_err(e: anyhow::Error) -> AuthError {
    AuthError::Store(format!("{e:#}"))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
