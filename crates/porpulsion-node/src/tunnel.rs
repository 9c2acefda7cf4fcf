// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP tunnelling between peers, framed over the channel.
//!
//! The submitter turns an operator HTTP request into a `proxy/request` frame
//! (body base64-encoded, one buffered blob — large-body streaming is out of
//! scope); the executor resolves the app's Service by label and performs the
//! inner request inside its own cluster:
//!
//! ```text
//! operator ── /remoteapp/<id>/proxy/<port>/<path> ──►  submitter
//!   submitter ── proxy/request {app_id, port, method, path, headers, body} ──► executor
//!     executor ── http://<service>.<ns>.svc.cluster.local:<port>/<path> ──► pod
//! ```
//!
//! The Service indirection matters: a raw pod IP breaks on replicas and
//! restarts. Hop-by-hop headers are stripped in both directions on both
//! sides.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use porpulsion_model::settings::csv_tokens;

use crate::channel::{self, CHANNEL_WAIT};
use crate::error::AgentError;
use crate::state::Agent;

/// Headers that apply to a single transport hop and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Inner request deadline on the executor side. The submitter waits a little
/// longer so the executor's timeout error wins over a bare channel timeout.
const PROXY_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(35);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub app_id: String,
    pub port: u16,
    pub method: String,
    /// Path with the query string already appended.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded body.
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded body.
    #[serde(default)]
    pub body: String,
}

pub fn is_hop_by_hop(header: &str) -> bool {
    let lower = header.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str())
}

/// Apply the tunnel allowlist: tokens are either a bare peer name (the whole
/// peer is allowed) or `peer/app_id` (one app). An empty allowlist denies
/// everything even when inbound tunnels are enabled.
pub fn tunnel_allowed(allowlist: &str, peer_name: &str, app_id: &str) -> Result<(), AgentError> {
    let tokens = csv_tokens(allowlist);
    if tokens.is_empty() {
        return Err(AgentError::Admission(
            "no tunnel peers are permitted on this agent".to_string(),
        ));
    }

    let mut peer_has_entries = false;
    for token in tokens {
        match token.split_once('/') {
            None => {
                if token == peer_name {
                    return Ok(());
                }
            }
            Some((peer, app)) => {
                if peer == peer_name {
                    peer_has_entries = true;
                    if app == app_id {
                        return Ok(());
                    }
                }
            }
        }
    }

    if peer_has_entries {
        Err(AgentError::Admission(format!(
            "app '{app_id}' is not permitted for peer '{peer_name}'"
        )))
    } else {
        Err(AgentError::Admission(format!(
            "tunnel from peer '{peer_name}' is not permitted"
        )))
    }
}

// ── Executor side ─────────────────────────────────────────────────────────────

/// `proxy/request`: policy gates, Service resolution, the inner request.
pub async fn handle_proxy_request(
    agent: &Agent,
    peer_name: &str,
    payload: Value,
) -> Result<Value, AgentError> {
    let req: ProxyRequest = serde_json::from_value(payload).map_err(AgentError::payload)?;

    let (allow_inbound, allowlist) = {
        let settings = agent.settings.read().await;
        (
            settings.allow_inbound_tunnels,
            settings.allowed_tunnel_peers.clone(),
        )
    };
    if !allow_inbound {
        return Err(AgentError::Admission(
            "inbound tunnels are disabled on this agent".to_string(),
        ));
    }
    tunnel_allowed(&allowlist, peer_name, &req.app_id)?;

    if !agent.remote_apps.read().await.contains_key(&req.app_id) {
        return Err(AgentError::AppNotFound);
    }

    let service = agent
        .backend
        .resolve_service(&req.app_id, &agent.config.namespace)
        .await?;
    let url = format!(
        "http://{service}.{namespace}.svc.cluster.local:{port}/{path}",
        namespace = agent.config.namespace,
        port = req.port,
        path = req.path.trim_start_matches('/'),
    );

    let method: reqwest::Method = req
        .method
        .parse()
        .map_err(|_| AgentError::Invalid(format!("bad method '{}'", req.method)))?;
    let body = base64::engine::general_purpose::STANDARD
        .decode(&req.body)
        .map_err(|e| AgentError::Payload(format!("bad body encoding: {e}")))?;

    let mut inner = agent.http.request(method, &url);
    for (name, value) in &req.headers {
        if !is_hop_by_hop(name) {
            inner = inner.header(name, value);
        }
    }

    debug!(app = %req.app_id, url = %url, "proxying request");
    let response = inner
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(app = %req.app_id, port = req.port, "proxy error: {e}");
            AgentError::Transport(format!("proxy error: {e}"))
        })?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| AgentError::Transport(format!("proxy body error: {e}")))?;

    serde_json::to_value(ProxyResponse {
        status,
        headers,
        body: base64::engine::general_purpose::STANDARD.encode(&body),
    })
    .map_err(AgentError::payload)
}

// ── Submitter side ────────────────────────────────────────────────────────────

/// Convert an operator HTTP request into a `proxy/request` call and
/// rehydrate the reply.
pub async fn forward_local(
    agent: &Agent,
    app_id: &str,
    port: u16,
    method: &str,
    path_and_query: &str,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
) -> Result<ProxyResponse, AgentError> {
    let target_peer = agent
        .local_apps
        .read()
        .await
        .get(app_id)
        .map(|a| a.target_peer.clone())
        .ok_or(AgentError::AppNotFound)?;

    let filtered: BTreeMap<String, String> = headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect();

    let request = ProxyRequest {
        app_id: app_id.to_string(),
        port,
        method: method.to_string(),
        path: path_and_query.to_string(),
        headers: filtered,
        body: base64::engine::general_purpose::STANDARD.encode(&body),
    };

    let ch = channel::channel_to(agent, &target_peer, CHANNEL_WAIT).await?;
    let reply = ch
        .call(
            "proxy/request",
            serde_json::to_value(&request).map_err(AgentError::payload)?,
            PROXY_CALL_TIMEOUT,
        )
        .await?;

    let mut response: ProxyResponse =
        serde_json::from_value(reply).map_err(AgentError::payload)?;
    response.headers.retain(|name, _| !is_hop_by_hop(name));
    Ok(response)
}

/// Decode the base64 body of a rehydrated proxy response.
pub fn decode_body(response: &ProxyResponse) -> Result<Vec<u8>, AgentError> {
    base64::engine::general_purpose::STANDARD
        .decode(&response.body)
        .map_err(|e| AgentError::Payload(format!("bad body encoding: {e}")))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_denies_everything() {
        let err = tunnel_allowed("", "alice", "app1").unwrap_err();
        assert!(err.to_string().contains("no tunnel peers"));
        assert!(tunnel_allowed("   ", "alice", "app1").is_err());
    }

    #[test]
    fn bare_peer_token_allows_all_apps() {
        let allowlist = "alice,bob/app-xyz";
        assert!(tunnel_allowed(allowlist, "alice", "anything").is_ok());
        assert!(tunnel_allowed(allowlist, "alice", "app-xyz").is_ok());
    }

    #[test]
    fn scoped_token_allows_only_that_app() {
        let allowlist = "alice,bob/app-xyz";
        assert!(tunnel_allowed(allowlist, "bob", "app-xyz").is_ok());
        let err = tunnel_allowed(allowlist, "bob", "other").unwrap_err();
        assert!(err.to_string().contains("app 'other'"));
    }

    #[test]
    fn unlisted_peer_is_rejected() {
        let err = tunnel_allowed("alice,bob/app-xyz", "mallory", "app1").unwrap_err();
        assert!(err.to_string().contains("peer 'mallory'"));
    }

    #[test]
    fn hop_by_hop_headers_are_recognised_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }

    #[test]
    fn proxy_response_strips_hop_by_hop_on_rehydration() {
        let mut headers = BTreeMap::new();
        headers.insert("Connection".to_string(), "close".to_string());
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        let mut response = ProxyResponse {
            status: 200,
            headers,
            body: String::new(),
        };
        response.headers.retain(|name, _| !is_hop_by_hop(name));
        assert!(response.headers.contains_key("Content-Type"));
        assert!(!response.headers.contains_key("Connection"));
        assert!(!response.headers.contains_key("Transfer-Encoding"));
    }

    #[test]
    fn proxy_request_round_trips_body_as_base64() {
        let body = b"\x00\x01binary\xff";
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let request: ProxyRequest = serde_json::from_value(serde_json::json!({
            "app_id": "abc", "port": 8080, "method": "POST",
            "path": "hello?x=1", "body": encoded,
        }))
        .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&request.body)
            .unwrap();
        assert_eq!(decoded, body);
    }
}
