// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The peer-facing surface: handshake and channel upgrade.
//!
//! `GET /ws` authenticates with the `X-Agent-Ca` header (base64 PEM of the
//! calling agent's CA) rather than a TLS client cert — the upgrade usually
//! traverses an ingress that terminates TLS, so no client cert would survive
//! the hop. The CA's fingerprint must match a registry peer; anything else
//! is closed with reason "unauthorized".

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::warn;

use crate::channel;
use crate::http::ApiError;
use crate::identity;
use crate::peering::{self, PeerHello, PeerReply};
use crate::state::Agent;

pub fn router(agent: Agent) -> Router {
    let limit = agent.config.max_frame_bytes;
    Router::new()
        .route("/peer", post(peer_post))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(limit))
        .with_state(agent)
}

/// `POST /peer` — invite (with `X-Invite-Token`) or confirmation
/// (body-only). Shared with the operator router.
pub async fn peer_post(
    State(agent): State<Agent>,
    headers: HeaderMap,
    Json(hello): Json<PeerHello>,
) -> Result<Json<PeerReply>, ApiError> {
    let token = headers
        .get("X-Invite-Token")
        .and_then(|v| v.to_str().ok());
    let reply = peering::handle_peer_post(&agent, token, hello).await?;
    Ok(Json(reply))
}

/// `GET /ws` — upgrade to the persistent channel.
async fn ws_handler(
    State(agent): State<Agent>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ca_pem = headers
        .get("X-Agent-Ca")
        .and_then(|v| v.to_str().ok())
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default();
    let claimed_name = headers
        .get("X-Agent-Name")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("?")
        .to_string();

    let peer_name = identify_peer_by_ca(&agent, &ca_pem).await;

    ws.on_upgrade(move |mut socket| async move {
        match peer_name {
            Some(name) => channel::accept_inbound(agent, name, socket).await,
            None => {
                warn!(claimed = %claimed_name, "rejecting channel: unrecognised CA");
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "unauthorized".into(),
                    })))
                    .await;
            }
        }
    })
}

/// The peer whose stored CA fingerprint matches the presented CA, if any.
async fn identify_peer_by_ca(agent: &Agent, ca_pem: &str) -> Option<String> {
    if ca_pem.is_empty() {
        return None;
    }
    let incoming = identity::fingerprint(ca_pem).ok()?;
    let peers = agent.peers.read().await;
    for peer in peers.values() {
        if peer.ca_pem.is_empty() {
            continue;
        }
        match identity::fingerprint(&peer.ca_pem) {
            Ok(stored) if stored == incoming => return Some(peer.name.clone()),
            _ => continue,
        }
    }
    None
}
