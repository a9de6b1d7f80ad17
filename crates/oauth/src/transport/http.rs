// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for health, metrics, breakers and validation.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitState;
use crate::credential::validator::ValidateOptions;
use crate::metrics::HealthReport;
use crate::state::OAuthState;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub health: HealthReport,
    pub instance_count: usize,
    pub open_circuits: usize,
    pub in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub reset: bool,
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub removed: usize,
}

fn yes() -> bool {
    true
}

/// Query for `POST /api/v1/validate`.
#[derive(Debug, Deserialize)]
pub struct ValidateParams {
    #[serde(default = "yes")]
    pub cache: bool,
    #[serde(default = "yes")]
    pub probe: bool,
    /// Drop any cached result first.
    #[serde(default)]
    pub refresh: bool,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    let instance_count = match s.store.list().await {
        Ok(list) => list.len(),
        Err(e) => {
            tracing::warn!(err = %e, "listing instances for health failed");
            0
        }
    };
    let open_circuits =
        s.circuits.snapshots().iter().filter(|c| c.state != CircuitState::Closed).count();
    Json(HealthResponse {
        health: s.metrics.health_assessment(),
        instance_count,
        open_circuits,
        in_flight: s.engine.in_flight(),
    })
}

/// `GET /api/v1/metrics`
pub async fn metrics(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    Json(s.metrics.export())
}

/// `POST /api/v1/metrics/reset`
pub async fn metrics_reset(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    s.metrics.reset();
    tracing::info!("metrics reset");
    Json(ResetResponse { reset: true })
}

/// `GET /api/v1/circuits`
pub async fn circuits(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    Json(s.circuits.snapshots())
}

/// `POST /api/v1/circuits/reset`: close every breaker.
pub async fn circuits_reset(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    s.circuits.reset_all();
    tracing::info!("all circuits reset");
    Json(ResetResponse { reset: true })
}

/// `POST /api/v1/validate`: structure, format and probe checks on a
/// credential object.
pub async fn validate(
    State(s): State<Arc<OAuthState>>,
    Query(params): Query<ValidateParams>,
    Json(creds): Json<serde_json::Value>,
) -> impl IntoResponse {
    let result = if params.refresh {
        s.validator.refresh(&creds).await
    } else {
        let opts = ValidateOptions { use_cache: params.cache, probe: params.probe };
        s.validator.validate_and_test(&creds, opts).await
    };
    match result {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /api/v1/validation/cache`
pub async fn validation_cache(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    Json(s.validator.cache_stats())
}

/// `DELETE /api/v1/validation/cache`
pub async fn validation_cache_clear(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    Json(CacheClearResponse { removed: s.validator.clear() })
}

/// `POST /api/v1/validation/cache/evict`: drop expired entries only.
pub async fn validation_cache_evict(State(s): State<Arc<OAuthState>>) -> impl IntoResponse {
    Json(CacheClearResponse { removed: s.validator.evict_expired() })
}
