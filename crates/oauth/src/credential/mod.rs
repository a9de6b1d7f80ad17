// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stored OAuth credentials and the store abstraction the refresh engine
//! reads and writes.

pub mod store;
pub mod validator;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::{ClientCredentials, Provider};

fn default_token_type() -> String {
    "Bearer".to_owned()
}

/// Token material for one instance. `expires_at` is epoch millis.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl Default for TokenRecord {
    fn default() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            expires_at: None,
            token_type: default_token_type(),
            scope: None,
        }
    }
}

impl TokenRecord {
    /// Drop both tokens and the expiry, keeping type and scope.
    pub fn cleared(&self) -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            expires_at: None,
            token_type: self.token_type.clone(),
            scope: self.scope.clone(),
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |t: &Option<String>| t.as_ref().map(|_| "[redacted]");
        f.debug_struct("TokenRecord")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Failed,
    /// Registered but never refreshed or exchanged.
    #[default]
    Pending,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Pending => "pending",
        }
    }
}

/// Everything stored for one instance.
#[derive(Clone, Serialize, Deserialize)]
pub struct InstanceCredentials {
    pub instance_id: String,
    pub provider: Provider,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub token: TokenRecord,
    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at: u64,
}

impl InstanceCredentials {
    pub fn new(instance_id: impl Into<String>, provider: Provider, client: ClientCredentials) -> Self {
        Self {
            instance_id: instance_id.into(),
            provider,
            client_id: client.client_id,
            client_secret: client.client_secret,
            token: TokenRecord::default(),
            status: CredentialStatus::Pending,
            error: None,
            updated_at: 0,
        }
    }

    pub fn client(&self) -> ClientCredentials {
        ClientCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        }
    }

    pub fn apply(&mut self, update: StatusUpdate, now_ms: u64) {
        self.status = update.status;
        self.error = update.error;
        match update.tokens {
            TokenPatch::Keep => {}
            TokenPatch::Replace(record) => self.token = record,
            TokenPatch::Clear => self.token = self.token.cleared(),
        }
        self.updated_at = now_ms;
    }
}

impl fmt::Debug for InstanceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCredentials")
            .field("instance_id", &self.instance_id)
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("token", &self.token)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// What an update does to the stored token fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPatch {
    Keep,
    Replace(TokenRecord),
    Clear,
}

/// Partial status write issued by the refresh engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: CredentialStatus,
    pub tokens: TokenPatch,
    pub error: Option<String>,
}

impl StatusUpdate {
    /// Successful refresh or exchange.
    pub fn active(record: TokenRecord) -> Self {
        Self { status: CredentialStatus::Active, tokens: TokenPatch::Replace(record), error: None }
    }

    /// Terminal failure with tokens left in place.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: CredentialStatus::Failed, tokens: TokenPatch::Keep, error: Some(error.into()) }
    }

    /// Terminal failure that requires re-authorization.
    pub fn reauth(error: impl Into<String>) -> Self {
        Self { status: CredentialStatus::Failed, tokens: TokenPatch::Clear, error: Some(error.into()) }
    }
}

/// Source of truth for instance credentials.
///
/// Reads may run concurrently. Writes for one instance are serialized by the
/// refresh engine, so implementations only need per-call atomicity.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<InstanceCredentials>>;

    /// Apply `update` to an existing instance. Fails if the instance is unknown.
    async fn update(&self, instance_id: &str, update: StatusUpdate) -> anyhow::Result<()>;

    /// Insert or replace an instance.
    async fn insert(&self, creds: InstanceCredentials) -> anyhow::Result<()>;

    /// Remove an instance, returning whether it existed.
    async fn remove(&self, instance_id: &str) -> anyhow::Result<bool>;

    /// All instances, sorted by id.
    async fn list(&self) -> anyhow::Result<Vec<InstanceCredentials>>;
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
