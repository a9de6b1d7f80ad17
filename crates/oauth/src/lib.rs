// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! mcp-oauth: OAuth token lifecycle for MCP adapter instances.

pub mod backoff;
pub mod circuit;
pub mod classify;
pub mod config;
pub mod credential;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod refresh;
pub mod state;
pub mod test_support;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::OAuthConfig;
use crate::credential::store::{seed_from_file, JsonFileStore, MemoryStore};
use crate::credential::CredentialStore;
use crate::metrics::spawn_metrics_reporter;
use crate::provider::ProviderRegistry;
use crate::state::OAuthState;
use crate::transport::build_router;

/// Open the configured credential store.
pub fn open_store(config: &OAuthConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
    match config.credentials_path() {
        Some(path) => {
            let store = JsonFileStore::open(&path)?;
            tracing::info!(path = %path.display(), "using file credential store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("using in-memory credential store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Run the admin server until shutdown.
pub async fn run(config: OAuthConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let store = open_store(&config)?;
    if let Some(ref path) = config.instances {
        let added = seed_from_file(store.as_ref(), path).await?;
        tracing::info!(path = %path.display(), added, "seeded instances");
    }

    let providers = match config.provider_config {
        Some(ref path) => ProviderRegistry::from_file(path)?,
        None => ProviderRegistry::default(),
    };

    let state = Arc::new(OAuthState::new(config.clone(), store, providers, shutdown.clone())?);

    if let Some(interval) = config.metrics_log_interval() {
        spawn_metrics_reporter(Arc::clone(&state.metrics), interval, shutdown.clone());
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    match config.broker_url {
        Some(ref broker) => tracing::info!("mcp-oauth listening on {addr} (broker {broker})"),
        None => tracing::info!("mcp-oauth listening on {addr}"),
    }
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
