// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Peer records and the transient tables used during the peering handshake.
//!
//! A [`Peer`] is in the registry iff both sides confirmed the handshake.
//! [`PendingOutbound`] tracks an invite we sent (keyed by the peer's URL);
//! [`PendingInbound`] tracks an invite we received and queued for operator
//! review (keyed by a fresh request id). Neither pending table is persisted —
//! a restart mid-handshake simply drops the attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::WorkloadSpec;

/// A fully confirmed remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub url: String,
    /// PEM of the peer's CA, exchanged during the handshake. Trust anchor for
    /// the channel; never exposed through the operator API.
    #[serde(default)]
    pub ca_pem: String,
    #[serde(default = "Utc::now")]
    pub connected_at: DateTime<Utc>,
}

impl Peer {
    /// Operator-facing view with the CA redacted.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "url": self.url,
            "connected_at": self.connected_at,
        })
    }
}

/// State of an outbound handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOutboundStatus {
    /// Still trying to deliver the invite.
    Connecting,
    /// Invite delivered; the remote operator has not accepted yet.
    AwaitingConfirmation,
    /// Gave up, was rejected, or failed the fingerprint pin.
    Failed,
}

/// An outbound handshake in flight, keyed by the peer's URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOutbound {
    pub url: String,
    pub status: PendingOutboundStatus,
    pub attempts: u32,
    /// Peer name, learned from the invite reply.
    #[serde(default)]
    pub peer_name: Option<String>,
    /// SHA-256 CA fingerprint the operator supplied out-of-band.
    pub pinned_fingerprint: String,
    /// Peer CA PEM, learned from the invite reply.
    #[serde(default)]
    pub peer_ca: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub since: DateTime<Utc>,
}

impl PendingOutbound {
    pub fn new(url: impl Into<String>, pinned_fingerprint: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: PendingOutboundStatus::Connecting,
            attempts: 0,
            peer_name: None,
            pinned_fingerprint: pinned_fingerprint.into(),
            peer_ca: None,
            error: None,
            since: Utc::now(),
        }
    }
}

/// An inbound invite waiting for the local operator to accept or reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInbound {
    /// Fresh request id handed back to the operator UI.
    pub id: String,
    pub peer_name: String,
    pub peer_url: String,
    /// CA presented with the invite; promoted into the registry on accept.
    pub ca_pem: String,
    pub received_at: DateTime<Utc>,
}

impl PendingInbound {
    /// Operator-facing view with the CA redacted.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.peer_name,
            "url": self.peer_url,
            "received_at": self.received_at,
        })
    }
}

/// An admission-passing submission parked until the operator decides.
///
/// Mutually exclusive with a `remote_apps` entry of the same id: the app is
/// either queued here or executing, never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub name: String,
    pub spec: WorkloadSpec,
    pub source_peer: String,
    pub since: DateTime<Utc>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_summary_redacts_ca() {
        let peer = Peer {
            name: "eu-west".into(),
            url: "https://10.0.0.2:8443".into(),
            ca_pem: "-----BEGIN CERTIFICATE-----\n…".into(),
            connected_at: Utc::now(),
        };
        let summary = peer.summary();
        assert!(summary.get("ca_pem").is_none());
        assert_eq!(summary["name"], "eu-west");
    }

    #[test]
    fn inbound_summary_redacts_ca() {
        let pending = PendingInbound {
            id: "abc123".into(),
            peer_name: "us-east".into(),
            peer_url: "https://10.0.0.1:8443".into(),
            ca_pem: "secret".into(),
            received_at: Utc::now(),
        };
        let summary = pending.summary();
        assert!(summary.get("ca_pem").is_none());
    }

    #[test]
    fn outbound_status_serializes_snake_case() {
        let s = serde_json::to_string(&PendingOutboundStatus::AwaitingConfirmation).unwrap();
        assert_eq!(s, "\"awaiting_confirmation\"");
    }
}
