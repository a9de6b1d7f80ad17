// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::credential::{CredentialStatus, TokenRecord};
use crate::provider::{ClientCredentials, Provider};

fn instance(id: &str) -> InstanceCredentials {
    let mut creds = InstanceCredentials::new(
        id,
        Provider::Reddit,
        ClientCredentials { client_id: "cid".to_owned(), client_secret: "cs".to_owned() },
    );
    creds.token = TokenRecord {
        access_token: Some("at".to_owned()),
        refresh_token: Some("rt".to_owned()),
        expires_at: Some(1_000),
        ..TokenRecord::default()
    };
    creds
}

#[tokio::test]
async fn memory_store_applies_updates() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert(instance("b")).await?;
    store.insert(instance("a")).await?;

    store.update("a", StatusUpdate::reauth("revoked")).await?;
    let a = store.get("a").await?.ok_or_else(|| anyhow::anyhow!("missing a"))?;
    assert_eq!(a.status, CredentialStatus::Failed);
    assert_eq!(a.token.access_token, None);
    assert_eq!(a.token.refresh_token, None);
    assert_eq!(a.token.expires_at, None);
    assert_eq!(a.error.as_deref(), Some("revoked"));
    assert!(a.updated_at > 0);

    let ids: Vec<_> = store.list().await?.into_iter().map(|c| c.instance_id).collect();
    assert_eq!(ids, ["a", "b"]);
    Ok(())
}

#[tokio::test]
async fn failed_update_keeps_tokens() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert(instance("a")).await?;
    store.update("a", StatusUpdate::failed("server error")).await?;
    let a = store.get("a").await?.ok_or_else(|| anyhow::anyhow!("missing a"))?;
    assert_eq!(a.status, CredentialStatus::Failed);
    assert_eq!(a.token.refresh_token.as_deref(), Some("rt"));
    Ok(())
}

#[tokio::test]
async fn update_unknown_instance_fails() {
    let store = MemoryStore::new();
    assert!(store.update("ghost", StatusUpdate::failed("x")).await.is_err());
}

#[tokio::test]
async fn json_store_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("credentials.json");
    {
        let store = JsonFileStore::open(&path)?;
        store.insert(instance("a")).await?;
        store.insert(instance("b")).await?;
        let record = TokenRecord {
            access_token: Some("fresh".to_owned()),
            refresh_token: Some("rt2".to_owned()),
            expires_at: Some(9_999),
            ..TokenRecord::default()
        };
        store.update("a", StatusUpdate::active(record)).await?;
        assert!(store.remove("b").await?);
        assert!(!store.remove("b").await?);
    }

    let reopened = JsonFileStore::open(&path)?;
    let all = reopened.list().await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, CredentialStatus::Active);
    assert_eq!(all[0].token.access_token.as_deref(), Some("fresh"));
    assert_eq!(all[0].client_secret, "cs");

    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap_or(dir.path()))?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test]
async fn json_store_failed_save_keeps_memory_and_disk_in_step() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("credentials.json");
    let store = JsonFileStore::open(&path)?;
    store.insert(instance("a")).await?;

    // A directory in place of the file makes the final rename fail.
    std::fs::remove_file(&path)?;
    std::fs::create_dir(&path)?;

    assert!(store.update("a", StatusUpdate::reauth("revoked")).await.is_err());
    let a = store.get("a").await?.ok_or_else(|| anyhow::anyhow!("missing a"))?;
    assert_eq!(a.status, CredentialStatus::Pending);
    assert_eq!(a.token.refresh_token.as_deref(), Some("rt"));

    assert!(store.insert(instance("b")).await.is_err());
    assert!(store.get("b").await?.is_none());

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[tokio::test]
async fn seed_skips_known_instances() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let seed_path = dir.path().join("instances.json");
    std::fs::write(
        &seed_path,
        r#"[
            {"instance_id": "a", "provider": "slack", "client_id": "x", "client_secret": "y"},
            {"instance_id": "c", "provider": "airtable",
             "token": {"access_token": "at", "refresh_token": "rt", "expires_at": 5}}
        ]"#,
    )?;

    let store = MemoryStore::new();
    store.insert(instance("a")).await?;
    assert_eq!(seed_from_file(&store, &seed_path).await?, 1);

    let a = store.get("a").await?.ok_or_else(|| anyhow::anyhow!("missing a"))?;
    assert_eq!(a.provider, Provider::Reddit);
    let c = store.get("c").await?.ok_or_else(|| anyhow::anyhow!("missing c"))?;
    assert_eq!(c.status, CredentialStatus::Pending);
    assert_eq!(c.token.token_type, "Bearer");
    assert_eq!(c.token.refresh_token.as_deref(), Some("rt"));
    Ok(())
}
