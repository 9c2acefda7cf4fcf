// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Durable state storage.
//!
//! The agent persists exactly two documents in a key-value store:
//!
//! - **credentials** — CA cert/key, leaf cert/key, the invite token, the
//!   self IP the leaf was issued for, and the confirmed peer list.
//! - **state** — submitted apps, settings, and the approval queue.
//!
//! The store itself is abstract ([`KeyValueStore`]); the default
//! implementation writes one JSON file per key with owner-only permissions
//! and an atomic tmp+rename. Writes are funnelled through a single
//! [`Persister`] task so they stay ordered; a failed write is retried a few
//! times, logged, and never blocks the operation that triggered it. The one
//! exception is invite-token rotation, which the peering code writes
//! synchronously before replying.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use porpulsion_model::{AgentSettings, Peer, PendingApproval, RemoteApp};

/// Key of the credentials document.
pub const CREDENTIALS_KEY: &str = "credentials";
/// Key of the mutable state document.
pub const STATE_KEY: &str = "state";

/// Abstract durable key-value storage in the agent's namespace.
///
/// In a cluster this is backed by a Secret/ConfigMap pair via the platform
/// adapter; the built-in [`FileStore`] keeps the same two-document layout on
/// local disk.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
}

// ── Persisted document shapes ─────────────────────────────────────────────────

/// The credentials document. Field names mirror the cluster Secret keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsDoc {
    #[serde(rename = "ca.crt", default)]
    pub ca_crt: String,
    #[serde(rename = "ca.key", default)]
    pub ca_key: String,
    #[serde(rename = "tls.crt", default)]
    pub tls_crt: String,
    #[serde(rename = "tls.key", default)]
    pub tls_key: String,
    #[serde(rename = "invite-token", default)]
    pub invite_token: String,
    #[serde(rename = "self-ip", default)]
    pub self_ip: String,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

/// The mutable state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDoc {
    #[serde(default)]
    pub local_apps: Vec<RemoteApp>,
    #[serde(default)]
    pub settings: AgentSettings,
    #[serde(default)]
    pub pending_approval: Vec<PendingApproval>,
}

// ── File-backed store ─────────────────────────────────────────────────────────

/// One JSON file per key under a data directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create) the data directory.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        write_secret_file(&tmp, value)?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Background persistence writer ─────────────────────────────────────────────

/// Handle for enqueueing durable writes from anywhere in the agent.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
}

impl Persister {
    /// Spawn the writer task over a store. One consumer keeps writes ordered.
    pub fn spawn(store: std::sync::Arc<dyn KeyValueStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<u8>)>();
        tokio::spawn(async move {
            while let Some((key, value)) = rx.recv().await {
                let mut last_err = None;
                for delay_ms in [0u64, 250, 1000] {
                    if delay_ms > 0 {
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    }
                    match store.write(&key, &value).await {
                        Ok(()) => {
                            debug!(key = %key, bytes = value.len(), "persisted");
                            last_err = None;
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                if let Some(e) = last_err {
                    // The in-memory value stays authoritative; the next
                    // mutation re-enqueues a full snapshot.
                    warn!(key = %key, "could not persist state: {e:#}");
                }
            }
        });
        Self { tx }
    }

    /// Queue a write. Never blocks; ordering per the single consumer.
    pub fn enqueue(&self, key: &str, value: Vec<u8>) {
        let _ = self.tx.send((key.to_string(), value));
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn missing_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.read("credentials").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("state", b"{\"local_apps\":[]}").await.unwrap();
        let back = store.read("state").await.unwrap().unwrap();
        assert_eq!(back, b"{\"local_apps\":[]}");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn store_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("credentials", b"secret").await.unwrap();
        let meta = std::fs::metadata(dir.path().join("credentials.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn credentials_doc_round_trips_with_dotted_keys() {
        let doc = CredentialsDoc {
            ca_crt: "CERT".into(),
            invite_token: "deadbeef".into(),
            ..Default::default()
        };
        let json = serde_json::to_vec(&doc).unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"ca.crt\""));
        assert!(text.contains("\"invite-token\""));
        let back: CredentialsDoc = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.invite_token, "deadbeef");
    }

    #[tokio::test]
    async fn persister_eventually_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let persister = Persister::spawn(store.clone());
        persister.enqueue("state", b"{}".to_vec());
        // Writes are async; poll briefly.
        for _ in 0..50 {
            if store.read("state").await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("persister never wrote the document");
    }
}
