// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admin HTTP surface: instances, tokens, validation, metrics, breakers.

pub mod auth;
pub mod http;
pub mod http_instance;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::OAuthState;

/// Build the axum `Router` with all admin routes.
pub fn build_router(state: Arc<OAuthState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Metrics and breakers
        .route("/api/v1/metrics", get(http::metrics))
        .route("/api/v1/metrics/reset", post(http::metrics_reset))
        .route("/api/v1/circuits", get(http::circuits))
        .route("/api/v1/circuits/reset", post(http::circuits_reset))
        // Instance credentials
        .route("/api/v1/instances", get(http_instance::list_instances))
        .route(
            "/api/v1/instances/{id}",
            put(http_instance::put_instance).delete(http_instance::delete_instance),
        )
        .route("/api/v1/instances/{id}/token", post(http_instance::instance_token))
        .route("/api/v1/instances/{id}/exchange", post(http_instance::instance_exchange))
        // Validation
        .route("/api/v1/validate", post(http::validate))
        .route(
            "/api/v1/validation/cache",
            get(http::validation_cache).delete(http::validation_cache_clear),
        )
        .route("/api/v1/validation/cache/evict", post(http::validation_cache_evict))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
