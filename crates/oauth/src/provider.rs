// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-provider token endpoint adapters.
//!
//! Everything that differs between Reddit, Slack and Airtable lives here:
//! endpoint URLs, how client credentials are presented, response envelopes,
//! and token formats. The refresh engine is generic over [`Provider`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::RawError;

/// `User-Agent` sent to Reddit, which rejects generic agents.
pub const REDDIT_USER_AGENT: &str = concat!("mcp-oauth/", env!("CARGO_PKG_VERSION"));

/// Longest provider body kept in a [`RawError`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Reddit,
    Slack,
    Airtable,
}

/// How client credentials accompany a token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// HTTP Basic `client_id:client_secret`.
    Basic,
    /// `client_id` and `client_secret` form fields.
    FormBody,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Reddit, Provider::Slack, Provider::Airtable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reddit => "reddit",
            Self::Slack => "slack",
            Self::Airtable => "airtable",
        }
    }

    pub fn default_token_url(&self) -> &'static str {
        match self {
            Self::Reddit => "https://www.reddit.com/api/v1/access_token",
            Self::Slack => "https://slack.com/api/oauth.v2.access",
            Self::Airtable => "https://airtable.com/oauth2/v1/token",
        }
    }

    pub fn default_probe_url(&self) -> &'static str {
        match self {
            Self::Reddit => "https://oauth.reddit.com/api/v1/me",
            Self::Slack => "https://slack.com/api/auth.test",
            Self::Airtable => "https://api.airtable.com/v0/meta/whoami",
        }
    }

    /// How long before expiry a token is refreshed.
    pub fn default_refresh_buffer(&self) -> Duration {
        match self {
            Self::Slack => Duration::from_secs(10 * 60),
            Self::Reddit | Self::Airtable => Duration::from_secs(5 * 60),
        }
    }

    pub fn client_auth(&self) -> ClientAuth {
        match self {
            Self::Slack => ClientAuth::FormBody,
            Self::Reddit | Self::Airtable => ClientAuth::Basic,
        }
    }

    /// Whether the provider issues app-only tokens via `client_credentials`.
    pub fn supports_client_credentials(&self) -> bool {
        matches!(self, Self::Reddit)
    }

    /// Regex an access token must match.
    pub fn token_pattern(&self) -> &'static str {
        match self {
            Self::Reddit => r"^[A-Za-z0-9._\-]{10,}$",
            Self::Slack => r"^xox[abposer]-[A-Za-z0-9\-]+$",
            Self::Airtable => r"^(pat[A-Za-z0-9]{14}\.[a-f0-9]{64}|[A-Za-z0-9._\-]{20,})$",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reddit" => Ok(Self::Reddit),
            "slack" => Ok(Self::Slack),
            "airtable" => Ok(Self::Airtable),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}

/// Resolved URLs for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderEndpoints {
    pub token_url: String,
    pub probe_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointOverride {
    #[serde(default)]
    token_url: Option<String>,
    #[serde(default)]
    probe_url: Option<String>,
}

/// Endpoint table for every provider, with optional overrides.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    endpoints: HashMap<Provider, ProviderEndpoints>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let endpoints = Provider::ALL
            .into_iter()
            .map(|p| {
                let urls = ProviderEndpoints {
                    token_url: p.default_token_url().to_owned(),
                    probe_url: p.default_probe_url().to_owned(),
                };
                (p, urls)
            })
            .collect();
        Self { endpoints }
    }
}

impl ProviderRegistry {
    /// Load overrides from a JSON object keyed by provider name:
    /// `{"slack": {"token_url": "...", "probe_url": "..."}}`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let overrides: HashMap<Provider, EndpointOverride> = serde_json::from_str(json)?;
        let mut registry = Self::default();
        for (provider, o) in overrides {
            let entry = registry.endpoint_mut(provider);
            if let Some(url) = o.token_url {
                entry.token_url = url;
            }
            if let Some(url) = o.probe_url {
                entry.probe_url = url;
            }
        }
        Ok(registry)
    }

    pub fn with_endpoints(mut self, provider: Provider, endpoints: ProviderEndpoints) -> Self {
        self.endpoints.insert(provider, endpoints);
        self
    }

    pub fn endpoints(&self, provider: Provider) -> ProviderEndpoints {
        self.endpoints.get(&provider).cloned().unwrap_or_else(|| ProviderEndpoints {
            token_url: provider.default_token_url().to_owned(),
            probe_url: provider.default_probe_url().to_owned(),
        })
    }

    fn endpoint_mut(&mut self, provider: Provider) -> &mut ProviderEndpoints {
        self.endpoints.entry(provider).or_insert_with(|| ProviderEndpoints {
            token_url: provider.default_token_url().to_owned(),
            probe_url: provider.default_probe_url().to_owned(),
        })
    }
}

/// OAuth client identity.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .finish()
    }
}

/// Grant presented to a token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum Grant {
    RefreshToken(String),
    ClientCredentials,
}

impl Grant {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::RefreshToken(_) => "refresh_token",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.grant_type())
    }
}

/// Standard OAuth2 token response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Build a token request for `grant` against `token_url`.
pub fn build_token_request(
    client: &reqwest::Client,
    provider: Provider,
    token_url: &str,
    grant: &Grant,
    creds: &ClientCredentials,
) -> reqwest::RequestBuilder {
    let mut form: Vec<(&str, &str)> = vec![("grant_type", grant.grant_type())];
    if let Grant::RefreshToken(token) = grant {
        form.push(("refresh_token", token.as_str()));
    }

    let mut req = client.post(token_url).header(reqwest::header::ACCEPT, "application/json");
    match provider.client_auth() {
        ClientAuth::Basic => {
            req = req.basic_auth(&creds.client_id, Some(&creds.client_secret));
        }
        ClientAuth::FormBody => {
            form.push(("client_id", creds.client_id.as_str()));
            form.push(("client_secret", creds.client_secret.as_str()));
        }
    }
    if provider == Provider::Reddit {
        req = req.header(reqwest::header::USER_AGENT, REDDIT_USER_AGENT);
    }
    req.form(&form)
}

/// Parse a token endpoint response body.
///
/// OAuth error bodies are recognized regardless of status, since Slack
/// reports failures as `{"ok": false, "error": ...}` with HTTP 200.
pub fn parse_token_response(status: u16, body: &str) -> Result<TokenResponse, RawError> {
    let success = (200..300).contains(&status);
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if success => {
            return Err(RawError::Other("malformed token response: body is not JSON".to_owned()));
        }
        Err(_) => return Err(RawError::Http { status, body: truncate(body) }),
    };

    if let Some(raw) = oauth_error(status, &value) {
        return Err(raw);
    }
    if !success {
        return Err(RawError::Http { status, body: truncate(body) });
    }

    let tokens: TokenResponse = serde_json::from_value(value).map_err(|e| {
        RawError::Other(format!("malformed token response: {e}"))
    })?;
    if tokens.access_token.is_empty() {
        return Err(RawError::Other("malformed token response: empty access_token".to_owned()));
    }
    Ok(tokens)
}

/// Extract an OAuth error from a JSON body, if it carries one.
pub(crate) fn oauth_error(status: u16, value: &serde_json::Value) -> Option<RawError> {
    let description = value
        .get("error_description")
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let code = match value.get("error") {
        Some(serde_json::Value::String(code)) => Some(code.clone()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    match code {
        Some(code) => Some(RawError::OAuth { status: Some(status), code, description }),
        None if value.get("ok") == Some(&serde_json::Value::Bool(false)) => {
            Some(RawError::OAuth { status: Some(status), code: "unknown".to_owned(), description })
        }
        None => None,
    }
}

/// Verdict from a provider identity probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The provider accepted the token.
    Accepted { identity: Option<String> },
    /// The provider rejected the token as invalid.
    Rejected { reason: String },
}

/// Build an identity probe request authorized with `access_token`.
pub fn probe_request(
    client: &reqwest::Client,
    provider: Provider,
    probe_url: &str,
    access_token: &str,
) -> reqwest::RequestBuilder {
    let req = match provider {
        // auth.test is documented as POST.
        Provider::Slack => client.post(probe_url),
        Provider::Reddit | Provider::Airtable => client.get(probe_url),
    };
    let req = req.bearer_auth(access_token);
    if provider == Provider::Reddit {
        req.header(reqwest::header::USER_AGENT, REDDIT_USER_AGENT)
    } else {
        req
    }
}

/// Slack error codes meaning the token itself is bad.
const SLACK_REJECTIONS: &[&str] =
    &["invalid_auth", "not_authed", "token_revoked", "token_expired", "account_inactive"];

/// Interpret an identity probe response. `Err` means no verdict was reached.
pub fn parse_probe(provider: Provider, status: u16, body: &str) -> Result<ProbeOutcome, RawError> {
    if status == 401 || status == 403 {
        return Ok(ProbeOutcome::Rejected { reason: format!("HTTP {status}") });
    }
    if !(200..300).contains(&status) {
        return Err(RawError::Http { status, body: truncate(body) });
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|_| RawError::Other("malformed probe response".to_owned()))?;

    if provider == Provider::Slack && value.get("ok") != Some(&serde_json::Value::Bool(true)) {
        let code = value.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
        if SLACK_REJECTIONS.contains(&code) {
            return Ok(ProbeOutcome::Rejected { reason: code.to_owned() });
        }
        return Err(RawError::OAuth { status: Some(status), code: code.to_owned(), description: None });
    }

    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_owned);
    let identity = match provider {
        Provider::Reddit => field("name"),
        Provider::Slack => field("user").or_else(|| field("team")),
        Provider::Airtable => field("email").or_else(|| field("id")),
    };
    Ok(ProbeOutcome::Accepted { identity })
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => body[..idx].to_owned(),
        None => body.to_owned(),
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
