// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backoff::duration_ms;
use crate::circuit::CircuitRegistry;
use crate::config::OAuthConfig;
use crate::credential::validator::CredentialValidator;
use crate::credential::CredentialStore;
use crate::metrics::MetricsRecorder;
use crate::provider::ProviderRegistry;
use crate::refresh::{http_client, TokenRefreshEngine};

/// Process context shared by the admin router and background tasks.
pub struct OAuthState {
    pub config: OAuthConfig,
    pub store: Arc<dyn CredentialStore>,
    pub providers: Arc<ProviderRegistry>,
    pub circuits: Arc<CircuitRegistry>,
    pub metrics: Arc<MetricsRecorder>,
    pub engine: Arc<TokenRefreshEngine>,
    pub validator: CredentialValidator,
    pub shutdown: CancellationToken,
}

impl OAuthState {
    /// Wire the engine, validator, breakers and metrics around `store`.
    pub fn new(
        config: OAuthConfig,
        store: Arc<dyn CredentialStore>,
        providers: ProviderRegistry,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let client = http_client()?;
        let providers = Arc::new(providers);
        let circuits = Arc::new(CircuitRegistry::new(config.breaker_config()));
        let metrics = Arc::new(MetricsRecorder::new());
        let engine = Arc::new(TokenRefreshEngine::new(
            config.engine_config(),
            Arc::clone(&store),
            Arc::clone(&providers),
            Arc::clone(&circuits),
            Arc::clone(&metrics),
            client.clone(),
        ));
        let validator =
            CredentialValidator::new(config.validator_config(), Arc::clone(&providers), client)?;

        Ok(Self { config, store, providers, circuits, metrics, engine, validator, shutdown })
    }
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    duration_ms(
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default(),
    )
}
