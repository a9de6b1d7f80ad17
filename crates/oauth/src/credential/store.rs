// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory and JSON-file credential stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{CredentialStore, InstanceCredentials, StatusUpdate};
use crate::state::epoch_ms;

type Entries = HashMap<String, InstanceCredentials>;

fn sorted(entries: &Entries) -> Vec<InstanceCredentials> {
    let mut out: Vec<_> = entries.values().cloned().collect();
    out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    out
}

fn apply(entries: &mut Entries, instance_id: &str, update: StatusUpdate) -> anyhow::Result<()> {
    let Some(entry) = entries.get_mut(instance_id) else {
        anyhow::bail!("unknown instance: {instance_id}");
    };
    entry.apply(update, epoch_ms());
    Ok(())
}

/// Process-local store. Lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<InstanceCredentials>> {
        Ok(self.entries.read().await.get(instance_id).cloned())
    }

    async fn update(&self, instance_id: &str, update: StatusUpdate) -> anyhow::Result<()> {
        apply(&mut *self.entries.write().await, instance_id, update)
    }

    async fn insert(&self, creds: InstanceCredentials) -> anyhow::Result<()> {
        self.entries.write().await.insert(creds.instance_id.clone(), creds);
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> anyhow::Result<bool> {
        Ok(self.entries.write().await.remove(instance_id).is_some())
    }

    async fn list(&self) -> anyhow::Result<Vec<InstanceCredentials>> {
        Ok(sorted(&*self.entries.read().await))
    }
}

/// On-disk layout of the credentials file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCredentials {
    #[serde(default)]
    instances: Entries,
}

/// Store persisted to a JSON file, rewritten atomically after every change.
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing contents if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() { load(&path)?.instances } else { Entries::new() };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!(path = %path.display(), instances = entries.len(), "opened credential store");
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the entries and persist it. Memory is only
    /// replaced once the file is written.
    async fn commit<R>(
        &self,
        change: impl FnOnce(&mut Entries) -> anyhow::Result<R> + Send,
    ) -> anyhow::Result<R> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        let out = change(&mut next)?;
        save(&self.path, &next)?;
        *entries = next;
        Ok(out)
    }
}

#[async_trait]
impl CredentialStore for JsonFileStore {
    async fn get(&self, instance_id: &str) -> anyhow::Result<Option<InstanceCredentials>> {
        Ok(self.entries.read().await.get(instance_id).cloned())
    }

    async fn update(&self, instance_id: &str, update: StatusUpdate) -> anyhow::Result<()> {
        self.commit(|entries| apply(entries, instance_id, update)).await
    }

    async fn insert(&self, creds: InstanceCredentials) -> anyhow::Result<()> {
        self.commit(|entries| {
            entries.insert(creds.instance_id.clone(), creds);
            Ok(())
        })
        .await
    }

    async fn remove(&self, instance_id: &str) -> anyhow::Result<bool> {
        if !self.entries.read().await.contains_key(instance_id) {
            return Ok(false);
        }
        self.commit(|entries| Ok(entries.remove(instance_id).is_some())).await
    }

    async fn list(&self) -> anyhow::Result<Vec<InstanceCredentials>> {
        Ok(sorted(&*self.entries.read().await))
    }
}

fn load(path: &Path) -> anyhow::Result<PersistedCredentials> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write tmp + rename. The tmp name is unique per process and call so racing
/// saves never share a partially written file.
fn save(path: &Path, entries: &Entries) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    #[derive(Serialize)]
    struct View<'a> {
        instances: &'a Entries,
    }

    let json = serde_json::to_string_pretty(&View { instances: entries })?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    let written = std::fs::write(&tmp_path, json).and_then(|()| std::fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

/// Load instance definitions from a seed file (a JSON array) and insert the
/// ones the store does not already know.
pub async fn seed_from_file(store: &dyn CredentialStore, path: &Path) -> anyhow::Result<usize> {
    let contents = std::fs::read_to_string(path)?;
    let seeds: Vec<InstanceCredentials> = serde_json::from_str(&contents)?;
    let mut added = 0;
    for seed in seeds {
        if store.get(&seed.instance_id).await?.is_none() {
            store.insert(seed).await?;
            added += 1;
        }
    }
    Ok(added)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
