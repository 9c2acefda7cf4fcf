// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The two-step peering handshake with pinned trust.
//!
//! ```text
//! A (initiator)                                   B (acceptor)
//!    │  POST /peer {name,url,ca}  X-Invite-Token     │
//!    │────────────────────────────────────────────►  │  token checked (constant time),
//!    │                                               │  rotated + persisted, inbound queued
//!    │  ◄──────────── {name, status:"pending", ca}   │
//!    │  fingerprint(ca) == pinned?  (hard abort)     │
//!    │                                               │  operator accepts
//!    │  ◄──────────────── POST /peer {name,url,ca}   │  (no token — body-only is the
//!    │  match pending by CA fingerprint,             │   confirmation signal)
//!    │  promote to registry                          │
//!    │  {status:"peered", ca} ────────────────────►  │  promote to registry
//! ```
//!
//! # Bootstrap TLS
//!
//! The invite request cannot authenticate the server — no CA is known yet —
//! so [`bootstrap_client`] skips certificate verification. Security rests on
//! (a) the invite token's secrecy and single use and (b) the out-of-band
//! fingerprint pin checked on the reply. This is deliberate: verifying
//! against a default trust store would mask the actual trust model, which
//! never depends on public PKI. No keying material that outlives the
//! handshake travels over this weakened connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use porpulsion_model::{AppStatus, Peer, PendingInbound, PendingOutbound, PendingOutboundStatus};

use crate::channel;
use crate::error::AgentError;
use crate::identity;
use crate::notify::Level;
use crate::state::Agent;
use crate::store::{CredentialsDoc, CREDENTIALS_KEY};

/// Give up delivering an invite after this many attempts.
const INVITE_MAX_RETRIES: u32 = 30;

/// Per-attempt request deadline.
const INVITE_TIMEOUT: Duration = Duration::from_secs(3);

/// The handshake body both directions: who is calling and their CA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHello {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub ca: String,
}

/// Reply to a handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReply {
    pub name: String,
    pub status: String,
    pub ca: String,
}

/// HTTP client for handshake requests. Certificate verification is off —
/// see the module docs for why that is the intended trust model here.
pub fn bootstrap_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(INVITE_TIMEOUT)
        .build()
        .unwrap_or_default()
}

// ── Outbound (initiator) side ─────────────────────────────────────────────────

/// Begin peering towards `url`: record a pending entry and start the invite
/// delivery loop in the background.
pub async fn start_outbound(agent: &Agent, url: &str, invite_token: &str, ca_fingerprint: &str) {
    let url = url.trim_end_matches('/').to_string();
    let pinned = normalize_fingerprint(ca_fingerprint);
    agent
        .pending_outbound
        .write()
        .await
        .insert(url.clone(), PendingOutbound::new(url.clone(), pinned.clone()));

    let agent = agent.clone();
    let token = invite_token.to_string();
    tokio::spawn(async move {
        deliver_invite(&agent, &url, &token, &pinned).await;
    });
}

/// Cancel a pending outbound handshake. The delivery loop observes the
/// removed entry within 200 ms.
pub async fn cancel_outbound(agent: &Agent, url: &str) -> bool {
    agent
        .pending_outbound
        .write()
        .await
        .remove(url.trim_end_matches('/'))
        .is_some()
}

async fn deliver_invite(agent: &Agent, url: &str, token: &str, pinned_fp: &str) {
    let client = bootstrap_client();
    let hello = PeerHello {
        name: agent.config.name.clone(),
        url: agent.config.self_url.clone(),
        ca: agent.identity.ca_cert_pem.clone(),
    };

    for attempt in 1..=INVITE_MAX_RETRIES {
        {
            let mut pending = agent.pending_outbound.write().await;
            match pending.get_mut(url) {
                None => {
                    info!(peer = %url, "peering cancelled");
                    return;
                }
                Some(entry) => entry.attempts = attempt,
            }
        }

        match client
            .post(format!("{url}/peer"))
            .header("X-Invite-Token", token)
            .json(&hello)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let reply: PeerReply = match resp.json().await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(peer = %url, "unparseable invite reply: {e}");
                        fail_outbound(agent, url, "peer returned an unparseable reply").await;
                        return;
                    }
                };
                handle_invite_reply(agent, url, pinned_fp, reply).await;
                return;
            }
            Ok(resp) if resp.status() == reqwest::StatusCode::FORBIDDEN => {
                // A definite rejection (bad token) — retrying cannot help.
                warn!(peer = %url, "peer rejected our invite token");
                fail_outbound(agent, url, "peer rejected the invite token").await;
                return;
            }
            Ok(resp) => {
                warn!(peer = %url, status = %resp.status(), "peer rejected our invite");
            }
            Err(e) => {
                debug!(peer = %url, "peer not up yet (attempt {attempt}/{INVITE_MAX_RETRIES}): {e}");
            }
        }

        // Sleep in 200 ms slices so a cancel is picked up promptly.
        for _ in 0..5 {
            if !agent.pending_outbound.read().await.contains_key(url) {
                info!(peer = %url, "peering cancelled during wait");
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    error!(peer = %url, "failed to reach peer after {INVITE_MAX_RETRIES} attempts");
    fail_outbound(agent, url, "could not reach peer").await;
}

async fn handle_invite_reply(agent: &Agent, url: &str, pinned_fp: &str, reply: PeerReply) {
    if reply.ca.is_empty() {
        fail_outbound(agent, url, "peer returned no CA certificate").await;
        return;
    }

    // Pin check: abort hard on mismatch — possible MITM. Not retried.
    let actual = match identity::fingerprint(&reply.ca) {
        Ok(fp) => fp,
        Err(e) => {
            warn!(peer = %url, "could not fingerprint peer CA: {e}");
            fail_outbound(agent, url, "peer CA could not be parsed").await;
            return;
        }
    };
    if actual != pinned_fp {
        error!(
            peer = %url,
            expected = %&pinned_fp[..16.min(pinned_fp.len())],
            got = %&actual[..16],
            "CA fingerprint mismatch — possible MITM, aborting peering"
        );
        fail_outbound(agent, url, "CA fingerprint mismatch — possible MITM").await;
        return;
    }

    let mut pending = agent.pending_outbound.write().await;
    if let Some(entry) = pending.get_mut(url) {
        entry.status = PendingOutboundStatus::AwaitingConfirmation;
        entry.peer_name = Some(reply.name.clone());
        entry.peer_ca = Some(reply.ca);
        info!(
            peer = %reply.name,
            "invite delivered — waiting for their operator to accept"
        );
    }
}

async fn fail_outbound(agent: &Agent, url: &str, error: &str) {
    let mut pending = agent.pending_outbound.write().await;
    if let Some(entry) = pending.get_mut(url) {
        entry.status = PendingOutboundStatus::Failed;
        entry.error = Some(error.to_string());
    }
}

// ── `/peer` endpoint (acceptor + confirmation) ────────────────────────────────

/// Handle a `POST /peer`. Two forms share the endpoint:
///
/// - **invite**: the `X-Invite-Token` header is present — validate, rotate
///   the token, queue a pending inbound request for the operator.
/// - **confirmation**: body-only with a CA — the remote operator accepted
///   our earlier invite; match it against our awaiting outbound entry by CA
///   fingerprint and promote it to the registry.
pub async fn handle_peer_post(
    agent: &Agent,
    invite_token: Option<&str>,
    hello: PeerHello,
) -> Result<PeerReply, AgentError> {
    let has_token = invite_token.map(|t| !t.is_empty()).unwrap_or(false);
    if !has_token && !hello.ca.is_empty() {
        return confirm_outbound(agent, hello).await;
    }
    accept_invite(agent, invite_token.unwrap_or(""), hello).await
}

async fn accept_invite(
    agent: &Agent,
    presented: &str,
    hello: PeerHello,
) -> Result<PeerReply, AgentError> {
    // Constant-time compare via hashing, so length differences leak nothing.
    {
        let current = agent.invite_token.read().await;
        let presented_hash = Sha256::digest(presented.as_bytes());
        let current_hash = Sha256::digest(current.as_bytes());
        if presented.is_empty() || !bool::from(presented_hash.ct_eq(&current_hash)) {
            warn!(peer = %hello.name, "bad or missing invite token");
            return Err(AgentError::InvalidToken);
        }
    }

    // Rotate: generate → persist → install, holding the token lock for the
    // whole sequence so two concurrent invites cannot both consume it.
    // Persistence must complete before the invitee sees success, otherwise a
    // crash in between would let the consumed token be replayed.
    {
        let mut token = agent.invite_token.write().await;
        let new_token = identity::generate_invite_token();
        let doc = credentials_with_token(agent, &new_token).await;
        if let Err(e) = agent.store.write(CREDENTIALS_KEY, &doc).await {
            // Keep the rotated token in memory and retry in the background.
            warn!("could not persist rotated invite token: {e:#}");
            agent.persister.enqueue(CREDENTIALS_KEY, doc);
        }
        *token = new_token;
    }
    info!(peer = %hello.name, "invite token consumed — queuing inbound request");

    let request_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    agent.pending_inbound.write().await.insert(
        request_id.clone(),
        PendingInbound {
            id: request_id,
            peer_name: hello.name.clone(),
            peer_url: hello.url.clone(),
            ca_pem: hello.ca.clone(),
            received_at: chrono::Utc::now(),
        },
    );

    Ok(PeerReply {
        name: agent.config.name.clone(),
        status: "pending".to_string(),
        ca: agent.identity.ca_cert_pem.clone(),
    })
}

async fn confirm_outbound(agent: &Agent, hello: PeerHello) -> Result<PeerReply, AgentError> {
    let presented_fp = identity::fingerprint(&hello.ca)
        .map_err(|e| AgentError::Invalid(format!("unparseable CA: {e}")))?;

    // The presented CA must match the one stored (and already pin-checked)
    // during the invite, whichever entry it belongs to. The URL key is only
    // a shortcut — the confirmation may arrive from a different address than
    // we dialed, and a matching URL never excuses a CA mismatch.
    let is_match = |entry: &PendingOutbound| {
        entry.status == PendingOutboundStatus::AwaitingConfirmation
            && entry
                .peer_ca
                .as_deref()
                .and_then(|ca| identity::fingerprint(ca).ok())
                .map(|fp| fp == presented_fp)
                .unwrap_or(false)
    };

    let mut pending = agent.pending_outbound.write().await;
    let key = if pending.get(&hello.url).map(is_match).unwrap_or(false) {
        Some(hello.url.clone())
    } else {
        pending
            .iter()
            .find(|(_, entry)| is_match(entry))
            .map(|(url, _)| url.clone())
    };

    let Some(key) = key else {
        warn!(peer = %hello.name, "unexpected confirmation with no matching pending entry");
        return Err(AgentError::NoPendingOutbound);
    };
    let entry = pending.remove(&key).unwrap_or_else(|| unreachable!());
    drop(pending);

    agent.peers.write().await.insert(
        hello.name.clone(),
        Peer {
            name: hello.name.clone(),
            url: entry.url.clone(),
            ca_pem: hello.ca.clone(),
            connected_at: chrono::Utc::now(),
        },
    );
    agent.persist_credentials().await;
    channel::spawn_maintain(agent, &hello.name);
    info!(peer = %hello.name, "peering confirmed — fully connected");

    Ok(PeerReply {
        name: agent.config.name.clone(),
        status: "peered".to_string(),
        ca: agent.identity.ca_cert_pem.clone(),
    })
}

// ── Operator decisions on inbound requests ────────────────────────────────────

/// Operator accepted an inbound request: perform the confirmation round-trip
/// to the initiator and promote the peer on success.
pub async fn accept_inbound(agent: &Agent, request_id: &str) -> Result<String, AgentError> {
    let info = agent
        .pending_inbound
        .write()
        .await
        .remove(request_id)
        .ok_or(AgentError::RequestNotFound)?;

    let client = bootstrap_client();
    let hello = PeerHello {
        name: agent.config.name.clone(),
        url: agent.config.self_url.clone(),
        ca: agent.identity.ca_cert_pem.clone(),
    };

    let outcome = client
        .post(format!("{}/peer", info.peer_url.trim_end_matches('/')))
        .json(&hello)
        .send()
        .await;

    match outcome {
        Ok(resp) if resp.status().is_success() => {
            let reply: PeerReply = resp.json().await.unwrap_or(PeerReply {
                name: info.peer_name.clone(),
                status: "peered".to_string(),
                ca: String::new(),
            });
            let their_ca = if reply.ca.is_empty() {
                info.ca_pem.clone()
            } else {
                reply.ca
            };
            agent.peers.write().await.insert(
                info.peer_name.clone(),
                Peer {
                    name: info.peer_name.clone(),
                    url: info.peer_url.clone(),
                    ca_pem: their_ca,
                    connected_at: chrono::Utc::now(),
                },
            );
            agent.persist_credentials().await;
            channel::spawn_maintain(agent, &info.peer_name);
            info!(peer = %info.peer_name, "accepted and confirmed peering");
            Ok(info.peer_name)
        }
        Ok(resp) => {
            let status = resp.status();
            warn!(peer = %info.peer_name, %status, "initiator rejected our confirmation");
            // Put the request back so the operator can retry.
            agent
                .pending_inbound
                .write()
                .await
                .insert(info.id.clone(), info);
            Err(AgentError::Peer(format!("initiator returned {status}")))
        }
        Err(e) => {
            warn!(peer = %info.peer_name, "could not reach initiator: {e}");
            agent
                .pending_inbound
                .write()
                .await
                .insert(info.id.clone(), info);
            Err(AgentError::Transport(e.to_string()))
        }
    }
}

/// Operator rejected an inbound request — just drop it.
pub async fn reject_inbound(agent: &Agent, request_id: &str) -> Result<(), AgentError> {
    let info = agent
        .pending_inbound
        .write()
        .await
        .remove(request_id)
        .ok_or(AgentError::RequestNotFound)?;
    info!(peer = %info.peer_name, "rejected inbound peering request");
    Ok(())
}

// ── Peer removal ──────────────────────────────────────────────────────────────

/// Remove a peer: close the channel (announcing the disconnect first), fail
/// the workloads we had running there, and persist.
pub async fn remove_peer(agent: &Agent, name: &str) -> Result<(), AgentError> {
    agent
        .peers
        .write()
        .await
        .remove(name)
        .ok_or(AgentError::PeerNotFound)?;
    info!(peer = %name, "removed peer");

    channel::close_peer_channel(agent, name).await;
    let affected = mark_target_apps_failed(agent, name).await;
    if !affected.is_empty() {
        info!(peer = %name, count = affected.len(), "marked workloads failed after peer removal");
    }
    agent.persist_credentials().await;
    agent.persist_state().await;
    Ok(())
}

/// Channel push handler: the peer told us it is disconnecting cleanly.
///
/// Only the authenticated channel peer may remove itself — a payload naming
/// someone else is ignored.
pub async fn on_peer_disconnect(agent: &Agent, peer_name: &str, payload: serde_json::Value) {
    let claimed = payload["name"].as_str().unwrap_or(peer_name);
    if claimed != peer_name {
        warn!(peer = %peer_name, claimed = %claimed, "peer/disconnect name mismatch — ignored");
        return;
    }
    if agent.peers.write().await.remove(peer_name).is_none() {
        return;
    }
    if let Some(ch) = agent.channels.write().await.remove(peer_name) {
        ch.close("peer disconnected");
    }
    let affected = mark_target_apps_failed(agent, peer_name).await;
    agent.persist_credentials().await;
    agent.persist_state().await;
    info!(peer = %peer_name, "peer disconnected");

    let mut message = format!("Peer '{peer_name}' disconnected.");
    if !affected.is_empty() {
        message.push_str(&format!(" {} workload(s) marked Failed.", affected.len()));
    }
    agent
        .notify(Level::Warn, format!("Peer disconnected: {peer_name}"), message)
        .await;
}

async fn mark_target_apps_failed(agent: &Agent, peer_name: &str) -> Vec<String> {
    let mut affected = Vec::new();
    let mut apps = agent.local_apps.write().await;
    for app in apps.values_mut() {
        if app.target_peer == peer_name && app.status.is_active() {
            app.set_status(AppStatus::Failed("peer disconnected".to_string()));
            affected.push(app.name.clone());
        }
    }
    affected
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Credentials snapshot with a not-yet-installed invite token.
async fn credentials_with_token(agent: &Agent, token: &str) -> Vec<u8> {
    let doc = CredentialsDoc {
        ca_crt: agent.identity.ca_cert_pem.clone(),
        ca_key: agent.identity.ca_key_pem.clone(),
        tls_crt: agent.identity.cert_pem.clone(),
        tls_key: agent.identity.key_pem.clone(),
        invite_token: token.to_string(),
        self_ip: agent.config.self_ip.clone(),
        peers: agent.peers.read().await.values().cloned().collect(),
    };
    serde_json::to_vec(&doc).unwrap_or_default()
}

/// Operators paste fingerprints in whatever case and with or without colons.
fn normalize_fingerprint(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalization() {
        assert_eq!(
            normalize_fingerprint("AB:CD:0f "),
            "abcd0f".to_string()
        );
        assert_eq!(normalize_fingerprint("deadbeef"), "deadbeef");
    }

    #[test]
    fn hello_round_trip_matches_wire_names() {
        let hello = PeerHello {
            name: "us-east".into(),
            url: "https://10.0.0.1:8443".into(),
            ca: "PEM".into(),
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["name"], "us-east");
        assert_eq!(json["ca"], "PEM");
        let back: PeerHello = serde_json::from_value(json).unwrap();
        assert_eq!(back.url, hello.url);
    }

    #[test]
    fn missing_hello_fields_default_to_empty() {
        let hello: PeerHello = serde_json::from_str("{}").unwrap();
        assert!(hello.name.is_empty());
        assert!(hello.ca.is_empty());
    }
}
