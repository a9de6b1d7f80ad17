// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP exchanges against provider token endpoints and the broker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::classify::{classify, NetworkFailure, RawError};
use crate::provider::{
    build_token_request, oauth_error, parse_token_response, ClientCredentials, Grant, Provider,
    ProviderRegistry, TokenResponse,
};

/// Build the shared outbound HTTP client.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    // reqwest is built without a bundled crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(reqwest::Client::builder().build()?)
}

/// Failure of one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The broker could not be reached or answered with its own outage.
    /// The direct path should be tried.
    BrokerUnavailable(RawError),
    /// The token endpoint (directly or relayed by the broker) refused.
    Provider(RawError),
}

impl ExchangeError {
    pub fn raw(&self) -> &RawError {
        match self {
            Self::BrokerUnavailable(raw) | Self::Provider(raw) => raw,
        }
    }

    /// Whether this outcome counts against the endpoint's circuit. A
    /// definitive refusal (bad grant, bad client) proves the endpoint works.
    pub fn trips_breaker(&self) -> bool {
        match self {
            Self::BrokerUnavailable(_) => true,
            Self::Provider(raw) => classify(raw).is_temporary,
        }
    }
}

#[derive(Serialize)]
struct BrokerRequest<'a> {
    provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    client_id: &'a str,
    client_secret: &'a str,
}

/// Performs token exchanges with a per-request timeout.
#[derive(Clone)]
pub struct TokenExchange {
    client: reqwest::Client,
    providers: Arc<ProviderRegistry>,
    broker_url: Option<String>,
    timeout: Duration,
}

impl TokenExchange {
    pub fn new(
        client: reqwest::Client,
        providers: Arc<ProviderRegistry>,
        broker_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self { client, providers, broker_url, timeout }
    }

    pub fn has_broker(&self) -> bool {
        self.broker_url.is_some()
    }

    /// Call the provider's token endpoint.
    pub async fn direct(
        &self,
        provider: Provider,
        grant: &Grant,
        creds: &ClientCredentials,
    ) -> Result<TokenResponse, ExchangeError> {
        let url = self.providers.endpoints(provider).token_url;
        let resp = build_token_request(&self.client, provider, &url, grant, creds)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ExchangeError::Provider(network(&e)))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ExchangeError::Provider(network(&e)))?;
        parse_token_response(status, &body).map_err(ExchangeError::Provider)
    }

    /// Call the broker, which relays to the provider and answers
    /// `{"tokens": {...}}`.
    pub async fn broker(
        &self,
        provider: Provider,
        grant: &Grant,
        creds: &ClientCredentials,
    ) -> Result<TokenResponse, ExchangeError> {
        let Some(base) = &self.broker_url else {
            return Err(ExchangeError::BrokerUnavailable(RawError::Other(
                "broker not configured".to_owned(),
            )));
        };
        let (path, refresh_token) = match grant {
            Grant::RefreshToken(token) => ("/exchange-refresh-token", Some(token.as_str())),
            Grant::ClientCredentials => ("/exchange-credentials", None),
        };
        let body = BrokerRequest {
            provider,
            refresh_token,
            client_id: &creds.client_id,
            client_secret: &creds.client_secret,
        };

        let resp = self
            .client
            .post(format!("{base}{path}"))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ExchangeError::BrokerUnavailable(network(&e)))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| ExchangeError::BrokerUnavailable(network(&e)))?;
        parse_broker_response(status, &text)
    }
}

fn network(err: &reqwest::Error) -> RawError {
    RawError::Network(NetworkFailure::from_reqwest(err))
}

/// Interpret a broker reply. 5xx and 404 mean the broker itself is down or
/// missing. Other OAuth error bodies are the provider's verdict.
fn parse_broker_response(status: u16, text: &str) -> Result<TokenResponse, ExchangeError> {
    let unavailable =
        || ExchangeError::BrokerUnavailable(RawError::Http { status, body: text.chars().take(256).collect() });
    if status >= 500 || status == 404 {
        return Err(unavailable());
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Err(unavailable());
    };

    if let Some(raw) = oauth_error(status, &value) {
        return Err(ExchangeError::Provider(raw));
    }
    match value.get("tokens") {
        Some(tokens) if (200..300).contains(&status) => {
            parse_token_response(status, &tokens.to_string()).map_err(ExchangeError::Provider)
        }
        _ => Err(unavailable()),
    }
}

#[cfg(test)]
#[path = "exchange_tests.rs"]
mod tests;
