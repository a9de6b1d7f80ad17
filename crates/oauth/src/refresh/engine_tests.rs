// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::circuit::{BreakerConfig, CircuitState};
use crate::credential::store::MemoryStore;
use crate::credential::CredentialStatus;
use crate::refresh::http_client;
use crate::test_support::{instance, registry_for, store_with, MockEndpoint, Reply};

const HOUR_MS: u64 = 3_600_000;

struct Harness {
    engine: Arc<TokenRefreshEngine>,
    store: Arc<MemoryStore>,
    metrics: Arc<MetricsRecorder>,
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        network_base: Duration::from_millis(1),
        server_base: Duration::from_millis(1),
        rate_limit_base: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

async fn harness(
    instances: Vec<InstanceCredentials>,
    token: &MockEndpoint,
    config: EngineConfig,
) -> anyhow::Result<Harness> {
    harness_with_breaker(instances, token, config, BreakerConfig::default()).await
}

async fn harness_with_breaker(
    instances: Vec<InstanceCredentials>,
    token: &MockEndpoint,
    config: EngineConfig,
    breaker: BreakerConfig,
) -> anyhow::Result<Harness> {
    let store = store_with(instances).await?;
    let metrics = Arc::new(MetricsRecorder::new());
    let providers = Arc::new(registry_for(Provider::Reddit, &token.url(), "http://unused/me"));
    let engine = TokenRefreshEngine::new(
        EngineConfig { backoff: fast_backoff(), ..config },
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        providers,
        Arc::new(CircuitRegistry::new(breaker)),
        Arc::clone(&metrics),
        http_client()?,
    );
    Ok(Harness { engine: Arc::new(engine), store, metrics })
}

fn expired() -> Option<u64> {
    Some(epoch_ms().saturating_sub(1000))
}

async fn stored(store: &MemoryStore, id: &str) -> anyhow::Result<InstanceCredentials> {
    store.get(id).await?.ok_or_else(|| anyhow::anyhow!("{id} missing"))
}

#[yare::parameterized(
    no_expiry = { None, 300, true },
    already_expired = { Some(1_000), 300, true },
    exactly_at_buffer = { Some(1_000 + 300_000), 300, true },
    just_outside_buffer = { Some(1_000 + 300_001), 300, false },
    far_future = { Some(1_000 + HOUR_MS), 300, false },
    zero_buffer_at_expiry = { Some(1_000), 0, true },
    zero_buffer_before_expiry = { Some(1_001), 0, false },
)]
fn refresh_boundary(expires_at: Option<u64>, buffer_secs: u64, expected: bool) {
    let record = TokenRecord { expires_at, ..TokenRecord::default() };
    assert_eq!(needs_refresh(&record, 1_000, Duration::from_secs(buffer_secs)), expected);
}

#[test]
fn normalize_keeps_prior_refresh_token_and_scope() {
    let prior = TokenRecord {
        access_token: Some("old".to_owned()),
        refresh_token: Some("keep-me".to_owned()),
        expires_at: Some(1),
        token_type: "Bearer".to_owned(),
        scope: Some("read".to_owned()),
    };
    let resp = TokenResponse {
        access_token: "new".to_owned(),
        refresh_token: None,
        expires_in: Some(60),
        token_type: None,
        scope: None,
    };
    let record = normalize(&resp, &prior, 10_000);
    assert_eq!(record.access_token.as_deref(), Some("new"));
    assert_eq!(record.refresh_token.as_deref(), Some("keep-me"));
    assert_eq!(record.expires_at, Some(70_000));
    assert_eq!(record.token_type, "Bearer");
    assert_eq!(record.scope.as_deref(), Some("read"));
}

#[test]
fn normalize_without_expiry_leaves_expiry_unset() {
    let resp = TokenResponse {
        access_token: "new".to_owned(),
        refresh_token: Some("rotated".to_owned()),
        expires_in: None,
        token_type: Some("bearer".to_owned()),
        scope: None,
    };
    let record = normalize(&resp, &TokenRecord::default(), 10_000);
    assert_eq!(record.expires_at, None);
    assert_eq!(record.refresh_token.as_deref(), Some("rotated"));
    assert!(needs_refresh(&record, 10_000, Duration::ZERO));
}

#[tokio::test]
async fn fresh_token_skips_network() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("new", None, 3600)]).await?;
    let far = Some(epoch_ms() + HOUR_MS);
    let h = harness(vec![instance("a", Provider::Reddit, far)], &token, EngineConfig::default()).await?;

    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("old-access"));
    assert_eq!(token.calls(), 0);
    assert!(h.metrics.instance_stats("a").is_none());
    Ok(())
}

#[tokio::test]
async fn missing_refresh_token_requires_reauth_without_network() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("new", None, 3600)]).await?;
    let mut creds = instance("a", Provider::Reddit, expired());
    creds.token.refresh_token = None;
    let h = harness(vec![creds], &token, EngineConfig::default()).await?;

    let err = h.engine.ensure_valid_token("a").await;
    assert!(matches!(
        err,
        Err(AuthError::ReauthRequired { error_type: ErrorType::InvalidRefreshToken, .. })
    ));
    assert_eq!(token.calls(), 0);
    let after = stored(&h.store, "a").await?;
    assert_eq!(after.status, CredentialStatus::Pending);
    assert_eq!(after.token.access_token.as_deref(), Some("old-access"));
    Ok(())
}

#[tokio::test]
async fn expired_token_is_refreshed_and_persisted() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("new-access", None, 3600)]).await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let before = epoch_ms();
    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("new-access"));
    assert_eq!(record.refresh_token.as_deref(), Some("old-refresh"));
    assert!(record.expires_at.is_some_and(|at| at >= before + HOUR_MS));

    let after = stored(&h.store, "a").await?;
    assert_eq!(after.status, CredentialStatus::Active);
    assert_eq!(after.token, record);
    assert_eq!(after.error, None);
    assert!(token.bodies()[0].contains("refresh_token=old-refresh"));
    Ok(())
}

#[tokio::test]
async fn transient_server_error_is_retried() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![Reply::text(500, "boom"), Reply::tokens("second", Some("rt2"), 3600)],
    )
    .await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("second"));
    assert_eq!(record.refresh_token.as_deref(), Some("rt2"));
    assert_eq!(token.calls(), 2);

    let stats = h.metrics.instance_stats("a").ok_or_else(|| anyhow::anyhow!("no stats"))?;
    assert_eq!((stats.attempts, stats.successes, stats.failures), (2, 1, 1));
    Ok(())
}

#[tokio::test]
async fn timed_out_attempt_is_retried() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![
            Reply::tokens("too-late", None, 3600).delayed(Duration::from_millis(500)),
            Reply::tokens("on-time", None, 3600),
        ],
    )
    .await?;
    let config = EngineConfig { request_timeout: Duration::from_millis(100), ..EngineConfig::default() };
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, config).await?;

    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("on-time"));

    let stats = h.metrics.instance_stats("a").ok_or_else(|| anyhow::anyhow!("no stats"))?;
    assert_eq!((stats.attempts, stats.successes, stats.failures), (2, 1, 1));
    assert_eq!(h.metrics.top_errors(1)[0].error_type, ErrorType::NetworkError);
    Ok(())
}

#[tokio::test]
async fn invalid_grant_requires_reauth_after_one_call() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::oauth_error(400, "invalid_grant")]).await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let err = h.engine.ensure_valid_token("a").await;
    match err {
        Err(AuthError::ReauthRequired { instance, error_type, .. }) => {
            assert_eq!(instance, "a");
            assert_eq!(error_type, ErrorType::InvalidRefreshToken);
        }
        other => anyhow::bail!("expected reauth, got {other:?}"),
    }
    assert_eq!(token.calls(), 1);

    let after = stored(&h.store, "a").await?;
    assert_eq!(after.status, CredentialStatus::Failed);
    assert_eq!(after.token.access_token, None);
    assert_eq!(after.token.refresh_token, None);
    assert!(after.error.is_some_and(|e| e.starts_with("INVALID_REFRESH_TOKEN")));
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_mark_failed_and_keep_tokens() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::text(503, "down")]).await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let err = h.engine.ensure_valid_token("a").await;
    match err {
        Err(AuthError::RefreshFailed { attempts, error_type, .. }) => {
            assert_eq!(attempts, 3);
            assert_eq!(error_type, ErrorType::ServiceUnavailable);
        }
        other => anyhow::bail!("expected refresh failure, got {other:?}"),
    }
    assert_eq!(token.calls(), 3);

    let after = stored(&h.store, "a").await?;
    assert_eq!(after.status, CredentialStatus::Failed);
    assert_eq!(after.token.refresh_token.as_deref(), Some("old-refresh"));
    Ok(())
}

#[tokio::test]
async fn permanent_unknown_error_is_not_retried() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::text(418, "teapot")]).await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let err = h.engine.ensure_valid_token("a").await;
    assert!(matches!(err, Err(AuthError::RefreshFailed { attempts: 1, .. })), "{err:?}");
    assert_eq!(token.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::text(500, "boom")]).await?;
    let config = EngineConfig { max_attempts: 1, ..EngineConfig::default() };
    let h = harness(
        vec![instance("a", Provider::Reddit, expired()), instance("b", Provider::Reddit, expired())],
        &token,
        config,
    )
    .await?;

    for _ in 0..5 {
        let err = h.engine.ensure_valid_token("a").await;
        assert!(matches!(err, Err(AuthError::RefreshFailed { .. })), "{err:?}");
    }
    assert_eq!(token.calls(), 5);

    // The breaker is per provider endpoint, so other instances are rejected too.
    let err = h.engine.ensure_valid_token("b").await;
    match err {
        Err(AuthError::CircuitOpen { key, next_attempt_at_ms }) => {
            assert_eq!(key, "direct:reddit");
            assert!(next_attempt_at_ms > epoch_ms());
        }
        other => anyhow::bail!("expected open circuit, got {other:?}"),
    }
    assert_eq!(token.calls(), 5);
    assert_eq!(stored(&h.store, "b").await?.status, CredentialStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![Reply::tokens("shared", None, 3600).delayed(Duration::from_millis(100))],
    )
    .await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let calls = (0..10).map(|_| h.engine.ensure_valid_token("a"));
    let results = futures_util::future::join_all(calls).await;
    for res in results {
        assert_eq!(res?.access_token.as_deref(), Some("shared"));
    }
    assert_eq!(token.calls(), 1);
    assert_eq!(h.engine.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn unavailable_broker_falls_back_to_direct() -> anyhow::Result<()> {
    let broker = MockEndpoint::start("/exchange-refresh-token", vec![Reply::text(503, "down")]).await?;
    let token = MockEndpoint::start("/token", vec![Reply::tokens("direct", None, 3600)]).await?;
    let config = EngineConfig { broker_url: Some(broker.base_url()), ..EngineConfig::default() };
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, config).await?;

    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("direct"));
    assert_eq!((broker.calls(), token.calls()), (1, 1));

    let export = h.metrics.export();
    assert_eq!(export.performance.by_method.len(), 2);
    Ok(())
}

#[tokio::test]
async fn broker_success_skips_direct() -> anyhow::Result<()> {
    let broker = MockEndpoint::start(
        "/exchange-refresh-token",
        vec![Reply::json(200, json!({"tokens": {"access_token": "brokered", "expires_in": 3600}}))],
    )
    .await?;
    let token = MockEndpoint::start("/token", vec![Reply::tokens("direct", None, 3600)]).await?;
    let config = EngineConfig { broker_url: Some(broker.base_url()), ..EngineConfig::default() };
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, config).await?;

    let record = h.engine.ensure_valid_token("a").await?;
    assert_eq!(record.access_token.as_deref(), Some("brokered"));
    assert_eq!(token.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn broker_disabled_provider_goes_direct() -> anyhow::Result<()> {
    let broker = MockEndpoint::start("/exchange-refresh-token", vec![Reply::text(500, "unused")]).await?;
    let token = MockEndpoint::start("/token", vec![Reply::tokens("direct", None, 3600)]).await?;
    let config = EngineConfig {
        broker_url: Some(broker.base_url()),
        broker_disabled: vec![Provider::Reddit],
        ..EngineConfig::default()
    };
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, config).await?;

    h.engine.ensure_valid_token("a").await?;
    assert_eq!((broker.calls(), token.calls()), (0, 1));
    Ok(())
}

#[tokio::test]
async fn broker_relayed_rejection_does_not_fall_back() -> anyhow::Result<()> {
    let broker = MockEndpoint::start(
        "/exchange-refresh-token",
        vec![Reply::oauth_error(400, "invalid_grant")],
    )
    .await?;
    let token = MockEndpoint::start("/token", vec![Reply::tokens("direct", None, 3600)]).await?;
    let config = EngineConfig { broker_url: Some(broker.base_url()), ..EngineConfig::default() };
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, config).await?;

    let err = h.engine.ensure_valid_token("a").await;
    assert!(matches!(err, Err(AuthError::ReauthRequired { .. })), "{err:?}");
    assert_eq!(token.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn cancellation_skips_store_write() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![Reply::tokens("late", None, 3600).delayed(Duration::from_secs(2))],
    )
    .await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = h.engine.ensure_valid_token_with("a", cancel).await;
    assert_eq!(err, Err(AuthError::Cancelled));

    let after = stored(&h.store, "a").await?;
    assert_eq!(after.status, CredentialStatus::Pending);
    assert_eq!(after.token.access_token.as_deref(), Some("old-access"));
    assert_eq!(h.engine.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn follower_cancellation_leaves_leader_running() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![Reply::tokens("leader", None, 3600).delayed(Duration::from_millis(200))],
    )
    .await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let leader = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.ensure_valid_token("a").await })
    };
    while h.engine.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let follower = h.engine.ensure_valid_token_with("a", cancel).await;
    assert_eq!(follower, Err(AuthError::Cancelled));

    let record = leader.await??;
    assert_eq!(record.access_token.as_deref(), Some("leader"));
    assert_eq!(token.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn leader_cancellation_restarts_for_waiting_follower() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![
            Reply::tokens("abandoned", None, 3600).delayed(Duration::from_millis(300)),
            Reply::tokens("fresh", None, 3600),
        ],
    )
    .await?;
    let h = harness(vec![instance("a", Provider::Reddit, expired())], &token, EngineConfig::default()).await?;

    let leader_cancel = CancellationToken::new();
    let leader = {
        let engine = Arc::clone(&h.engine);
        let cancel = leader_cancel.clone();
        tokio::spawn(async move { engine.ensure_valid_token_with("a", cancel).await })
    };
    while h.engine.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    let follower = {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.ensure_valid_token("a").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader_cancel.cancel();

    assert_eq!(leader.await?, Err(AuthError::Cancelled));
    let record = follower.await??;
    assert_eq!(record.access_token.as_deref(), Some("fresh"));
    assert_eq!(token.calls(), 2);
    assert_eq!(stored(&h.store, "a").await?.token.access_token.as_deref(), Some("fresh"));
    Ok(())
}

#[tokio::test]
async fn dropped_caller_still_settles_half_open_trial() -> anyhow::Result<()> {
    let token = MockEndpoint::start(
        "/token",
        vec![
            Reply::text(500, "boom"),
            Reply::tokens("trial", None, 3600).delayed(Duration::from_millis(150)),
            Reply::tokens("after", None, 3600),
        ],
    )
    .await?;
    let breaker = BreakerConfig { failure_threshold: 1, reset_timeout: Duration::from_millis(50) };
    let config = EngineConfig { max_attempts: 1, ..EngineConfig::default() };
    let h = harness_with_breaker(
        vec![instance("a", Provider::Reddit, expired()), instance("b", Provider::Reddit, expired())],
        &token,
        config,
        breaker,
    )
    .await?;

    let err = h.engine.ensure_valid_token("a").await;
    assert!(matches!(err, Err(AuthError::RefreshFailed { .. })), "{err:?}");
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The trial call is admitted, then its only waiter goes away.
    let dropped = tokio::time::timeout(Duration::from_millis(50), h.engine.ensure_valid_token("a")).await;
    assert!(dropped.is_err());

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.engine.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(h.engine.circuits.get("direct:reddit").state(), CircuitState::Closed);
    assert_eq!(stored(&h.store, "a").await?.token.access_token.as_deref(), Some("trial"));

    let record = h.engine.ensure_valid_token("b").await?;
    assert_eq!(record.access_token.as_deref(), Some("after"));
    assert_eq!(token.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn exchange_credentials_uses_client_credentials_grant() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("app-token", None, 3600)]).await?;
    let mut creds = instance("a", Provider::Reddit, None);
    creds.token = TokenRecord::default();
    let h = harness(vec![creds], &token, EngineConfig::default()).await?;

    let record = h.engine.exchange_credentials("a", CancellationToken::new()).await?;
    assert_eq!(record.access_token.as_deref(), Some("app-token"));
    assert!(token.bodies()[0].contains("grant_type=client_credentials"));
    assert_eq!(stored(&h.store, "a").await?.status, CredentialStatus::Active);
    Ok(())
}

#[tokio::test]
async fn exchange_without_usable_path_is_rejected() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("unused", None, 3600)]).await?;
    let h = harness(vec![instance("s", Provider::Slack, None)], &token, EngineConfig::default()).await?;

    let err = h.engine.exchange_credentials("s", CancellationToken::new()).await;
    assert!(matches!(err, Err(AuthError::Validation { .. })), "{err:?}");
    assert_eq!(token.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn exchange_requires_client_secret() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("unused", None, 3600)]).await?;
    let mut creds = instance("a", Provider::Reddit, None);
    creds.client_secret.clear();
    let h = harness(vec![creds], &token, EngineConfig::default()).await?;

    let err = h.engine.exchange_credentials("a", CancellationToken::new()).await;
    assert!(matches!(err, Err(AuthError::Validation { .. })), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn unknown_instance_is_reported() -> anyhow::Result<()> {
    let token = MockEndpoint::start("/token", vec![Reply::tokens("unused", None, 3600)]).await?;
    let h = harness(Vec::new(), &token, EngineConfig::default()).await?;

    let err = h.engine.ensure_valid_token("ghost").await;
    assert_eq!(err, Err(AuthError::UnknownInstance("ghost".to_owned())));
    Ok(())
}

#[test]
fn provider_buffer_applies_unless_overridden() -> anyhow::Result<()> {
    let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
    let build = |config: EngineConfig| -> anyhow::Result<TokenRefreshEngine> {
        Ok(TokenRefreshEngine::new(
            config,
            Arc::clone(&store),
            Arc::new(ProviderRegistry::default()),
            Arc::new(CircuitRegistry::new(BreakerConfig::default())),
            Arc::new(MetricsRecorder::new()),
            http_client()?,
        ))
    };

    let defaults = build(EngineConfig::default())?;
    assert_eq!(defaults.refresh_buffer(Provider::Slack), Duration::from_secs(600));
    assert_eq!(defaults.refresh_buffer(Provider::Reddit), Duration::from_secs(300));

    let fixed = build(EngineConfig {
        refresh_buffer: Some(Duration::from_secs(30)),
        ..EngineConfig::default()
    })?;
    assert_eq!(fixed.refresh_buffer(Provider::Slack), Duration::from_secs(30));
    Ok(())
}
