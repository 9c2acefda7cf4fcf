// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The process-wide agent state.
//!
//! Everything mutable lives on [`AgentCore`], built once at startup and
//! passed as an `Arc` to every component — no module-level globals. Each map
//! sits behind its own coarse lock; cardinalities are small (peers, apps) so
//! O(n) scans under a lock are fine. Every mutation is followed by enqueueing
//! a persistence snapshot; guards are never held across awaits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use porpulsion_model::{
    AgentSettings, Peer, PendingApproval, PendingInbound, PendingOutbound, RemoteApp,
};

use crate::channel::PeerChannel;
use crate::config::AgentConfig;
use crate::executor::ExecutorBackend;
use crate::identity::{self, AgentIdentity};
use crate::notify::{self, Level, Notification};
use crate::store::{CredentialsDoc, KeyValueStore, Persister, StateDoc, CREDENTIALS_KEY, STATE_KEY};

pub type Agent = Arc<AgentCore>;

pub struct AgentCore {
    pub config: AgentConfig,
    pub identity: AgentIdentity,
    /// Short build identifier exchanged via `version/announce`.
    pub version_hash: String,

    /// Single-use peering secret. Rotation is a read → generate → persist →
    /// install sequence under this lock.
    pub invite_token: RwLock<String>,

    /// Confirmed peers. An entry exists iff both sides completed the
    /// handshake.
    pub peers: RwLock<HashMap<String, Peer>>,
    /// Outbound handshakes in flight, keyed by peer URL.
    pub pending_outbound: RwLock<HashMap<String, PendingOutbound>>,
    /// Inbound invites awaiting operator review, keyed by request id.
    pub pending_inbound: RwLock<HashMap<String, PendingInbound>>,

    /// Apps we submitted, tracked by status callbacks.
    pub local_apps: RwLock<HashMap<String, RemoteApp>>,
    /// Apps received from peers, executing on this cluster.
    pub remote_apps: RwLock<HashMap<String, RemoteApp>>,
    /// Admission-passing submissions parked for operator approval.
    pub pending_approval: RwLock<HashMap<String, PendingApproval>>,

    pub settings: RwLock<AgentSettings>,
    pub notifications: Mutex<VecDeque<Notification>>,

    /// peer name → live channel. At most one per peer.
    pub channels: RwLock<HashMap<String, Arc<PeerChannel>>>,
    /// Peers that already have a maintenance loop running, so re-peering
    /// never spawns a second competing reconnector.
    pub maintained: std::sync::Mutex<std::collections::HashSet<String>>,
    /// app id → stop flag of its readiness watcher.
    pub watchers: Mutex<HashMap<String, CancellationToken>>,

    pub store: Arc<dyn KeyValueStore>,
    pub persister: Persister,
    pub backend: Arc<dyn ExecutorBackend>,

    /// Client for the tunnel's inner requests: buffered bodies, 30 s
    /// deadline, no redirect following.
    pub http: reqwest::Client,
}

impl AgentCore {
    /// Load durable state and assemble the core. Called once at startup,
    /// before any listener or channel comes up.
    pub async fn bootstrap(
        config: AgentConfig,
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn ExecutorBackend>,
    ) -> anyhow::Result<Agent> {
        let credentials: CredentialsDoc = match store.read(CREDENTIALS_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("credentials document is corrupt, regenerating identity: {e}");
                CredentialsDoc::default()
            }),
            Ok(None) => CredentialsDoc::default(),
            Err(e) => {
                warn!("durable storage unavailable, running with in-memory identity: {e:#}");
                CredentialsDoc::default()
            }
        };

        let mut credentials_dirty = false;
        let identity = if !credentials.ca_crt.is_empty() && !credentials.ca_key.is_empty() {
            let fingerprint = identity::fingerprint(&credentials.ca_crt)?;
            // Rotate the leaf when the IP SAN no longer matches SELF_URL.
            let (cert_pem, key_pem) = if credentials.tls_crt.is_empty()
                || credentials.self_ip != config.self_ip
            {
                info!(ip = %config.self_ip, "issuing new leaf certificate");
                credentials_dirty = true;
                identity::issue_leaf(
                    &credentials.ca_crt,
                    &credentials.ca_key,
                    &config.name,
                    &config.self_ip,
                )?
            } else {
                (credentials.tls_crt.clone(), credentials.tls_key.clone())
            };
            AgentIdentity {
                ca_cert_pem: credentials.ca_crt.clone(),
                ca_key_pem: credentials.ca_key.clone(),
                cert_pem,
                key_pem,
                fingerprint,
            }
        } else {
            info!(agent = %config.name, "generating new agent CA");
            credentials_dirty = true;
            identity::generate(&config.name, &config.self_ip)?
        };

        let invite_token = if credentials.invite_token.is_empty() {
            credentials_dirty = true;
            identity::generate_invite_token()
        } else {
            credentials.invite_token.clone()
        };

        let peers: HashMap<String, Peer> = credentials
            .peers
            .iter()
            .cloned()
            .map(|p| (p.name.clone(), p))
            .collect();

        let state: StateDoc = match store.read(STATE_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Ok(None) => StateDoc::default(),
            Err(e) => {
                warn!("could not load state document: {e:#}");
                StateDoc::default()
            }
        };

        info!(
            peers = peers.len(),
            local_apps = state.local_apps.len(),
            pending_approval = state.pending_approval.len(),
            "restored durable state"
        );

        let persister = Persister::spawn(store.clone());

        let core = Arc::new(AgentCore {
            config,
            identity,
            version_hash: version_hash(),
            invite_token: RwLock::new(invite_token),
            peers: RwLock::new(peers),
            pending_outbound: RwLock::new(HashMap::new()),
            pending_inbound: RwLock::new(HashMap::new()),
            local_apps: RwLock::new(
                state
                    .local_apps
                    .into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect(),
            ),
            remote_apps: RwLock::new(HashMap::new()),
            pending_approval: RwLock::new(
                state
                    .pending_approval
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect(),
            ),
            settings: RwLock::new(state.settings),
            notifications: Mutex::new(VecDeque::new()),
            channels: RwLock::new(HashMap::new()),
            maintained: std::sync::Mutex::new(std::collections::HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            store,
            persister,
            backend,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        });

        if credentials_dirty {
            core.persist_credentials().await;
        }

        Ok(core)
    }

    /// Raise a notification (newest first, capped ring).
    pub async fn notify(&self, level: Level, title: impl Into<String>, message: impl Into<String>) {
        let n = Notification::new(level, title, message);
        notify::push(&mut *self.notifications.lock().await, n);
    }

    /// Snapshot the credentials document as JSON bytes.
    pub async fn credentials_doc(&self) -> Vec<u8> {
        let doc = CredentialsDoc {
            ca_crt: self.identity.ca_cert_pem.clone(),
            ca_key: self.identity.ca_key_pem.clone(),
            tls_crt: self.identity.cert_pem.clone(),
            tls_key: self.identity.key_pem.clone(),
            invite_token: self.invite_token.read().await.clone(),
            self_ip: self.config.self_ip.clone(),
            peers: self.peers.read().await.values().cloned().collect(),
        };
        serde_json::to_vec(&doc).unwrap_or_default()
    }

    /// Queue a durable write of the credentials document.
    pub async fn persist_credentials(&self) {
        let doc = self.credentials_doc().await;
        self.persister.enqueue(CREDENTIALS_KEY, doc);
    }

    /// Queue a durable write of the state document.
    pub async fn persist_state(&self) {
        let doc = StateDoc {
            local_apps: self.local_apps.read().await.values().cloned().collect(),
            settings: self.settings.read().await.clone(),
            pending_approval: self
                .pending_approval
                .read()
                .await
                .values()
                .cloned()
                .collect(),
        };
        self.persister
            .enqueue(STATE_KEY, serde_json::to_vec(&doc).unwrap_or_default());
    }
}

/// Short build identifier pushed in `version/announce` right after a channel
/// comes up. Peers with a different hash keep working, but a notification is
/// raised so operators know a rolling upgrade is half-done.
pub fn version_hash() -> String {
    let digest = Sha256::digest(env!("CARGO_PKG_VERSION").as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
