// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for instance credentials and token issuance.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::credential::{CredentialStatus, InstanceCredentials, TokenRecord};
use crate::error::ErrorCode;
use crate::provider::{ClientCredentials, Provider};
use crate::state::{epoch_ms, OAuthState};

// -- Request/Response types ---------------------------------------------------

/// Instance as shown by the admin API. Secrets and tokens are omitted.
#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub provider: Provider,
    pub client_id: String,
    pub status: CredentialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub updated_at: u64,
}

impl From<&InstanceCredentials> for InstanceView {
    fn from(creds: &InstanceCredentials) -> Self {
        Self {
            instance_id: creds.instance_id.clone(),
            provider: creds.provider,
            client_id: creds.client_id.clone(),
            status: creds.status,
            error: creds.error.clone(),
            has_access_token: creds.token.access_token.is_some(),
            has_refresh_token: creds.token.refresh_token.is_some(),
            expires_at: creds.token.expires_at,
            updated_at: creds.updated_at,
        }
    }
}

/// Request body for `PUT /api/v1/instances/{id}`.
#[derive(Debug, Deserialize)]
pub struct PutInstanceRequest {
    pub provider: Provider,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub instance_id: String,
    pub removed: bool,
}

/// Token handed to adapter callers.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl From<TokenRecord> for TokenResponse {
    fn from(record: TokenRecord) -> Self {
        Self {
            access_token: record.access_token,
            token_type: record.token_type,
            expires_at: record.expires_at,
            scope: record.scope,
        }
    }
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/instances`
pub async fn list_instances(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    match s.store.list().await {
        Ok(list) => Json(list.iter().map(InstanceView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e:#}")).into_response(),
    }
}

/// `PUT /api/v1/instances/{id}`: register or replace an instance.
pub async fn put_instance(
    State(s): State<Arc<OAuthState>>,
    Path(id): Path<String>,
    Json(req): Json<PutInstanceRequest>,
) -> impl IntoResponse {
    if id.trim().is_empty() {
        return ErrorCode::BadRequest.to_http_response("instance id is empty").into_response();
    }
    let mut creds = InstanceCredentials::new(
        id.as_str(),
        req.provider,
        ClientCredentials { client_id: req.client_id, client_secret: req.client_secret },
    );
    let now = epoch_ms();
    creds.token = TokenRecord {
        access_token: req.access_token,
        refresh_token: req.refresh_token,
        expires_at: req.expires_in.map(|secs| now.saturating_add(secs.saturating_mul(1000))),
        scope: req.scope,
        ..TokenRecord::default()
    };
    creds.updated_at = now;

    let view = InstanceView::from(&creds);
    match s.store.insert(creds).await {
        Ok(()) => {
            tracing::info!(instance = %id, provider = %req.provider, "instance registered");
            Json(view).into_response()
        }
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e:#}")).into_response(),
    }
}

/// `DELETE /api/v1/instances/{id}`
pub async fn delete_instance(
    State(s): State<Arc<OAuthState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.store.remove(&id).await {
        Ok(true) => {
            tracing::info!(instance = %id, "instance removed");
            Json(DeleteResponse { instance_id: id, removed: true }).into_response()
        }
        Ok(false) => ErrorCode::NotFound.to_http_response(format!("unknown instance: {id}")).into_response(),
        Err(e) => ErrorCode::Internal.to_http_response(format!("{e:#}")).into_response(),
    }
}

/// `POST /api/v1/instances/{id}/token`: return a valid access token,
/// refreshing first when needed.
pub async fn instance_token(
    State(s): State<Arc<OAuthState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.engine.ensure_valid_token_with(&id, s.shutdown.child_token()).await {
        Ok(record) => Json(TokenResponse::from(record)).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `POST /api/v1/instances/{id}/exchange`: obtain a token from the
/// instance's client credentials.
pub async fn instance_exchange(
    State(s): State<Arc<OAuthState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match s.engine.exchange_credentials(&id, s.shutdown.child_token()).await {
        Ok(record) => Json(TokenResponse::from(record)).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}
