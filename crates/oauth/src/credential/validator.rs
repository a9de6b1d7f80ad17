// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential validation: structure, token format, and an optional provider
//! probe, with a TTL cache in front of the probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::classify::{classify, NetworkFailure, RawError};
use crate::error::AuthError;
use crate::provider::{parse_probe, probe_request, ProbeOutcome, Provider, ProviderRegistry};
use crate::state::epoch_ms;

/// Characters of the access token used in cache keys.
const CACHE_KEY_PREFIX: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub ttl: Duration,
    /// Confirm tokens against the provider API after local checks.
    pub probe: bool,
    pub request_timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(300), probe: true, request_timeout: Duration::from_secs(15) }
    }
}

/// Result of [`validate_structure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Account name reported by the provider probe.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub probed: bool,
    pub validated_at_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateOptions {
    pub use_cache: bool,
    /// Run the provider probe (ignored when disabled in config).
    pub probe: bool,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self { use_cache: true, probe: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_ms: Option<u64>,
}

struct CacheEntry {
    result: ValidationResult,
    stored_at: Instant,
    timestamp_ms: u64,
}

/// Check required fields and their types. Pure; never touches the network.
pub fn validate_structure(creds: &Value) -> StructureReport {
    let mut errors = Vec::new();
    let Some(obj) = creds.as_object() else {
        return StructureReport { valid: false, errors: vec!["credentials must be a JSON object".to_owned()] };
    };

    match obj.get("provider") {
        None | Some(Value::Null) => errors.push("provider is required".to_owned()),
        Some(Value::String(p)) => {
            if p.parse::<Provider>().is_err() {
                errors.push(format!("provider {p:?} is not supported"));
            }
        }
        Some(_) => errors.push("provider must be a string".to_owned()),
    }

    match obj.get("access_token") {
        None | Some(Value::Null) => errors.push("access_token is required".to_owned()),
        Some(Value::String(t)) if t.trim().is_empty() => {
            errors.push("access_token must not be empty".to_owned());
        }
        Some(Value::String(_)) => {}
        Some(_) => errors.push("access_token must be a string".to_owned()),
    }

    for field in ["refresh_token", "client_id", "client_secret", "instance_id"] {
        match obj.get(field) {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(_) => errors.push(format!("{field} must be a string")),
        }
    }

    let has = |field: &str| obj.get(field).is_some_and(|v| v.is_string());
    if has("client_id") != has("client_secret") {
        errors.push("client_id and client_secret must be provided together".to_owned());
    }

    match obj.get("expires_at") {
        None | Some(Value::Null) => {}
        Some(v) if v.as_u64().is_some() => {}
        Some(_) => errors.push("expires_at must be a non-negative integer".to_owned()),
    }

    StructureReport { valid: errors.is_empty(), errors }
}

/// Validates credentials and caches successful results.
pub struct CredentialValidator {
    config: ValidatorConfig,
    providers: Arc<ProviderRegistry>,
    client: reqwest::Client,
    formats: HashMap<Provider, Regex>,
    refresh_token_format: Regex,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CredentialValidator {
    pub fn new(
        config: ValidatorConfig,
        providers: Arc<ProviderRegistry>,
        client: reqwest::Client,
    ) -> anyhow::Result<Self> {
        let mut formats = HashMap::new();
        for provider in Provider::ALL {
            formats.insert(provider, Regex::new(provider.token_pattern())?);
        }
        Ok(Self {
            config,
            providers,
            client,
            formats,
            refresh_token_format: Regex::new(r"^\S+$")?,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Structure, then format, then probe. A fresh cache hit skips all three.
    pub async fn validate_and_test(
        &self,
        creds: &Value,
        opts: ValidateOptions,
    ) -> Result<ValidationResult, AuthError> {
        let report = validate_structure(creds);
        if !report.valid {
            return Err(AuthError::Validation { errors: report.errors });
        }
        let fields = Fields::from_value(creds)?;
        let key = cache_key(&fields.access_token, fields.instance_id.as_deref());

        let probe = opts.probe && self.config.probe;

        if opts.use_cache {
            if let Some(hit) = self.cached(&key, fields.provider, probe) {
                tracing::debug!(provider = %fields.provider, "validation cache hit");
                return Ok(hit);
            }
        }

        self.check_format(&fields)?;

        let mut result = ValidationResult {
            valid: true,
            provider: fields.provider,
            instance_id: fields.instance_id.clone(),
            identity: None,
            probed: false,
            validated_at_ms: 0,
            cached: false,
        };
        if probe {
            result.identity = self.probe(fields.provider, &fields.access_token).await?;
            result.probed = true;
        }
        result.validated_at_ms = epoch_ms();

        self.store(key, &result);
        Ok(result)
    }

    /// Evict any cached result for these credentials, then validate again.
    pub async fn refresh(&self, creds: &Value) -> Result<ValidationResult, AuthError> {
        if let Ok(fields) = Fields::from_value(creds) {
            let key = cache_key(&fields.access_token, fields.instance_id.as_deref());
            self.cache.lock().remove(&key);
        }
        self.validate_and_test(creds, ValidateOptions::default()).await
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        let mut keys: Vec<_> = cache.keys().cloned().collect();
        keys.sort();
        CacheStats {
            size: cache.len(),
            keys,
            oldest_ms: cache.values().map(|e| e.timestamp_ms).min(),
            newest_ms: cache.values().map(|e| e.timestamp_ms).max(),
        }
    }

    pub fn clear(&self) -> usize {
        let mut cache = self.cache.lock();
        let n = cache.len();
        cache.clear();
        n
    }

    /// Drop entries older than the TTL, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - cache.len()
    }

    /// Fresh entry for `key` that answers this request: same provider, and
    /// probed when a probe is required.
    fn cached(&self, key: &str, provider: Provider, probe: bool) -> Option<ValidationResult> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.stored_at.elapsed() >= self.config.ttl {
            cache.remove(key);
            return None;
        }
        if entry.result.provider != provider || (probe && !entry.result.probed) {
            return None;
        }
        let mut result = entry.result.clone();
        result.cached = true;
        Some(result)
    }

    /// Insert `result`, sweeping expired entries first.
    fn store(&self, key: String, result: &ValidationResult) {
        let ttl = self.config.ttl;
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, e| e.stored_at.elapsed() < ttl);
        let swept = before - cache.len();
        if swept > 0 {
            tracing::debug!(swept, "expired validation results evicted");
        }
        cache.insert(
            key,
            CacheEntry { result: result.clone(), stored_at: Instant::now(), timestamp_ms: result.validated_at_ms },
        );
    }

    fn check_format(&self, fields: &Fields) -> Result<(), AuthError> {
        let mut errors = Vec::new();
        let matches = self.formats.get(&fields.provider).is_some_and(|re| re.is_match(&fields.access_token));
        if !matches {
            errors.push(format!("access_token is not a valid {} token", fields.provider));
        }
        if let Some(rt) = &fields.refresh_token {
            if !self.refresh_token_format.is_match(rt) {
                errors.push("refresh_token must not contain whitespace".to_owned());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AuthError::Validation { errors })
        }
    }

    async fn probe(&self, provider: Provider, access_token: &str) -> Result<Option<String>, AuthError> {
        let url = self.providers.endpoints(provider).probe_url;
        let outcome = async {
            let resp = probe_request(&self.client, provider, &url, access_token)
                .timeout(self.config.request_timeout)
                .send()
                .await
                .map_err(|e| RawError::Network(NetworkFailure::from_reqwest(&e)))?;
            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(|e| RawError::Network(NetworkFailure::from_reqwest(&e)))?;
            parse_probe(provider, status, &body)
        }
        .await;

        match outcome {
            Ok(ProbeOutcome::Accepted { identity }) => Ok(identity),
            Ok(ProbeOutcome::Rejected { reason }) => {
                tracing::info!(provider = %provider, reason = %reason, "provider rejected credentials");
                Err(AuthError::Authentication {
                    provider: provider.to_string(),
                    message: "the provider rejected the access token".to_owned(),
                })
            }
            Err(raw) => {
                let classified = classify(&raw);
                tracing::warn!(
                    provider = %provider,
                    error_type = %classified.error_type,
                    err = %raw,
                    "validation probe failed"
                );
                Err(AuthError::ProbeFailed {
                    provider: provider.to_string(),
                    error_type: classified.error_type,
                    message: classified.user_message.to_owned(),
                })
            }
        }
    }
}

/// Typed view of already structure-checked credentials.
struct Fields {
    provider: Provider,
    access_token: String,
    refresh_token: Option<String>,
    instance_id: Option<String>,
}

impl Fields {
    fn from_value(creds: &Value) -> Result<Self, AuthError> {
        let text = |field: &str| creds.get(field).and_then(Value::as_str).map(str::to_owned);
        let provider = text("provider")
            .and_then(|p| p.parse::<Provider>().ok())
            .ok_or_else(|| AuthError::Validation { errors: vec!["provider is required".to_owned()] })?;
        let access_token = text("access_token")
            .ok_or_else(|| AuthError::Validation { errors: vec!["access_token is required".to_owned()] })?;
        Ok(Self {
            provider,
            access_token,
            refresh_token: text("refresh_token"),
            instance_id: text("instance_id"),
        })
    }
}

/// Token prefix plus instance id. The full token never becomes a key.
pub fn cache_key(access_token: &str, instance_id: Option<&str>) -> String {
    let prefix: String = access_token.chars().take(CACHE_KEY_PREFIX).collect();
    format!("{prefix}:{}", instance_id.unwrap_or("default"))
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
