// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: scripted token/probe/broker endpoints and
//! state builders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::credential::store::MemoryStore;
use crate::credential::{InstanceCredentials, TokenRecord};
use crate::provider::{ClientCredentials, Provider, ProviderEndpoints, ProviderRegistry};

/// One scripted HTTP reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self { status, body: body.to_string(), delay: Duration::ZERO }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into(), delay: Duration::ZERO }
    }

    /// Standard successful token response.
    pub fn tokens(access: &str, refresh: Option<&str>, expires_in: u64) -> Self {
        let mut body = serde_json::json!({
            "access_token": access,
            "token_type": "bearer",
            "expires_in": expires_in,
        });
        if let Some(refresh) = refresh {
            body["refresh_token"] = serde_json::Value::String(refresh.to_owned());
        }
        Self::json(200, body)
    }

    pub fn oauth_error(status: u16, code: &str) -> Self {
        Self::json(status, serde_json::json!({ "error": code }))
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Axum server on `127.0.0.1:0` that answers every request on `path` with
/// the next scripted reply, repeating the last one when the script runs out.
pub struct MockEndpoint {
    addr: SocketAddr,
    path: String,
    calls: Arc<AtomicU32>,
    bodies: Arc<Mutex<Vec<String>>>,
}

impl MockEndpoint {
    pub async fn start(path: &str, replies: Vec<Reply>) -> anyhow::Result<Self> {
        let calls = Arc::new(AtomicU32::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(replies);

        let handler = {
            let calls = Arc::clone(&calls);
            let bodies = Arc::clone(&bodies);
            move |body: String| {
                let calls = Arc::clone(&calls);
                let bodies = Arc::clone(&bodies);
                let replies = Arc::clone(&replies);
                async move {
                    let idx = calls.fetch_add(1, Ordering::SeqCst) as usize;
                    bodies.lock().push(body);
                    let reply = replies
                        .get(idx)
                        .or_else(|| replies.last())
                        .cloned()
                        .unwrap_or_else(|| Reply::text(500, "{}"));
                    if !reply.delay.is_zero() {
                        tokio::time::sleep(reply.delay).await;
                    }
                    (
                        axum::http::StatusCode::from_u16(reply.status)
                            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        reply.body,
                    )
                }
            }
        };
        let app = Router::new().route(path, any(handler));

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, path: path.to_owned(), calls, bodies })
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.path)
    }

    /// Base URL without the path, for services that append their own.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }
}

/// Registry pointing `provider` at mock token and probe URLs.
pub fn registry_for(provider: Provider, token_url: &str, probe_url: &str) -> ProviderRegistry {
    ProviderRegistry::default().with_endpoints(
        provider,
        ProviderEndpoints { token_url: token_url.to_owned(), probe_url: probe_url.to_owned() },
    )
}

/// Instance with a refresh token and the given expiry.
pub fn instance(id: &str, provider: Provider, expires_at: Option<u64>) -> InstanceCredentials {
    let mut creds = InstanceCredentials::new(
        id,
        provider,
        ClientCredentials { client_id: "client-id".to_owned(), client_secret: "client-secret".to_owned() },
    );
    creds.token = TokenRecord {
        access_token: Some("old-access".to_owned()),
        refresh_token: Some("old-refresh".to_owned()),
        expires_at,
        ..TokenRecord::default()
    };
    creds
}

/// Memory store pre-populated with `instances`.
pub async fn store_with(instances: Vec<InstanceCredentials>) -> anyhow::Result<Arc<MemoryStore>> {
    use crate::credential::CredentialStore;

    let store = Arc::new(MemoryStore::new());
    for creds in instances {
        store.insert(creds).await?;
    }
    Ok(store)
}
