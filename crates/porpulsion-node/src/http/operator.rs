// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The operator-facing management API.
//!
//! Handlers are thin: parse, call into the owning module, map the result
//! through [`ApiError`]. The one route with real logic of its own is the
//! tunnel endpoint, which converts a raw HTTP request into a
//! `proxy/request` frame and back.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;

use porpulsion_model::{AgentSettings, WorkloadSpec};

use crate::error::AgentError;
use crate::http::{peer, ApiError};
use crate::state::Agent;
use crate::{executor, peering, tunnel, workload};

pub fn router(agent: Agent) -> Router {
    let limit = agent.config.max_frame_bytes;
    Router::new()
        .route("/status", get(status))
        .route("/peers", get(list_peers))
        .route("/peers/connect", post(connect_peer))
        .route("/peers/retry", post(retry_peer))
        .route("/peers/connecting", delete(cancel_connecting))
        .route("/peers/inbound", get(list_inbound))
        .route("/peers/inbound/:req_id/accept", post(accept_inbound))
        .route("/peers/inbound/:req_id", delete(reject_inbound))
        .route("/peers/:name", delete(remove_peer))
        .route("/peer", post(peer::peer_post))
        .route("/token", get(token))
        .route("/remoteapp", post(submit_remoteapp))
        .route("/remoteapps", get(list_remoteapps))
        .route("/remoteapp/pending-approval", get(list_pending_approval))
        .route("/remoteapp/:id/approve", post(approve_remoteapp))
        .route("/remoteapp/:id/reject", post(reject_remoteapp))
        .route("/remoteapp/:id/detail", get(remoteapp_detail))
        .route("/remoteapp/:id/spec", put(update_remoteapp_spec))
        .route("/remoteapp/:id/scale", post(scale_remoteapp))
        .route("/remoteapp/:id/logs", get(remoteapp_logs))
        .route("/remoteapp/:id", delete(delete_remoteapp))
        .route("/remoteapp/:id/proxy/:port", any(proxy_root))
        .route("/remoteapp/:id/proxy/:port/*path", any(proxy_subpath))
        .route("/settings", get(get_settings).post(update_settings))
        .route("/notifications", get(list_notifications))
        .route("/notifications/:id/ack", post(ack_notification))
        .layer(RequestBodyLimitLayer::new(limit))
        .with_state(agent)
}

// ── Status and peers ──────────────────────────────────────────────────────────

async fn status(State(agent): State<Agent>) -> Json<Value> {
    let peers: Vec<Value> = agent
        .peers
        .read()
        .await
        .values()
        .map(|p| p.summary())
        .collect();
    Json(json!({
        "agent": agent.config.name,
        "peers": peers,
        "local_apps": agent.local_apps.read().await.len(),
        "remote_apps": agent.remote_apps.read().await.len(),
    }))
}

async fn list_peers(State(agent): State<Agent>) -> Json<Value> {
    let mut result: Vec<Value> = Vec::new();
    for peer in agent.peers.read().await.values() {
        let mut entry = peer.summary();
        entry["status"] = json!("connected");
        result.push(entry);
    }
    for (url, pending) in agent.pending_outbound.read().await.iter() {
        let mut entry = json!({
            "name": pending.peer_name.clone().unwrap_or_else(|| url.clone()),
            "url": url,
            "status": pending.status,
            "attempts": pending.attempts,
            "connected_at": pending.since,
        });
        if let Some(error) = &pending.error {
            entry["error"] = json!(error);
        }
        result.push(entry);
    }
    Json(Value::Array(result))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    invite_token: String,
    #[serde(default)]
    ca_fingerprint: String,
}

async fn connect_peer(
    State(agent): State<Agent>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    if req.invite_token.is_empty() {
        return Err(ApiError::bad_request("invite_token is required"));
    }
    if req.ca_fingerprint.is_empty() {
        return Err(ApiError::bad_request("ca_fingerprint is required"));
    }
    peering::start_outbound(&agent, &req.url, &req.invite_token, &req.ca_fingerprint).await;
    Ok(Json(
        json!({"ok": true, "message": format!("Peering initiated with {}", req.url)}),
    ))
}

async fn retry_peer(
    State(agent): State<Agent>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    if req.invite_token.is_empty() {
        return Err(ApiError::bad_request("invite_token is required to retry"));
    }
    if req.ca_fingerprint.is_empty() {
        return Err(ApiError::bad_request("ca_fingerprint is required to retry"));
    }
    peering::start_outbound(&agent, &req.url, &req.invite_token, &req.ca_fingerprint).await;
    Ok(Json(
        json!({"ok": true, "message": format!("Retrying connection to {}", req.url)}),
    ))
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    #[serde(default)]
    url: String,
}

async fn cancel_connecting(
    State(agent): State<Agent>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.url.is_empty() {
        return Err(ApiError::bad_request("url query parameter required"));
    }
    if peering::cancel_outbound(&agent, &query.url).await {
        Ok(Json(json!({"ok": true, "cancelled": query.url})))
    } else {
        Err(ApiError(
            StatusCode::NOT_FOUND,
            "no pending connection to that URL".to_string(),
        ))
    }
}

async fn list_inbound(State(agent): State<Agent>) -> Json<Value> {
    let entries: Vec<Value> = agent
        .pending_inbound
        .read()
        .await
        .values()
        .map(|p| p.summary())
        .collect();
    Json(Value::Array(entries))
}

async fn accept_inbound(
    State(agent): State<Agent>,
    Path(req_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let peer = peering::accept_inbound(&agent, &req_id).await?;
    Ok(Json(json!({"ok": true, "peer": peer})))
}

async fn reject_inbound(
    State(agent): State<Agent>,
    Path(req_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    peering::reject_inbound(&agent, &req_id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn remove_peer(
    State(agent): State<Agent>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    peering::remove_peer(&agent, &name).await?;
    Ok(Json(json!({"ok": true, "removed": name})))
}

async fn token(State(agent): State<Agent>) -> Json<Value> {
    Json(json!({
        "agent": agent.config.name,
        "invite_token": *agent.invite_token.read().await,
        "self_url": agent.config.self_url,
        "cert_fingerprint": agent.identity.fingerprint,
        "ca_pem": agent.identity.ca_cert_pem,
    }))
}

// ── Workloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    name: String,
    #[serde(default)]
    spec: Option<WorkloadSpec>,
    /// The executing peer — required; there is no implicit default peer.
    #[serde(default)]
    target_peer: String,
}

async fn submit_remoteapp(
    State(agent): State<Agent>,
    Json(req): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let Some(spec) = req.spec else {
        return Err(ApiError::bad_request("spec is required"));
    };
    if req.target_peer.is_empty() {
        return Err(ApiError::bad_request("target_peer is required"));
    }
    match workload::submit(&agent, &req.name, spec, &req.target_peer).await {
        Ok(app) => Ok((StatusCode::CREATED, Json(serde_json::to_value(app).unwrap_or_default()))
            .into_response()),
        // An error reply from the executor is an admission/policy rejection.
        Err(AgentError::Peer(msg)) => Err(ApiError(StatusCode::TOO_MANY_REQUESTS, msg)),
        Err(e) => Err(e.into()),
    }
}

async fn list_remoteapps(State(agent): State<Agent>) -> Json<Value> {
    let submitted: Vec<Value> = agent
        .local_apps
        .read()
        .await
        .values()
        .map(|a| serde_json::to_value(a).unwrap_or_default())
        .collect();
    let executing: Vec<Value> = agent
        .remote_apps
        .read()
        .await
        .values()
        .map(|a| serde_json::to_value(a).unwrap_or_default())
        .collect();
    Json(json!({"submitted": submitted, "executing": executing}))
}

async fn list_pending_approval(State(agent): State<Agent>) -> Json<Value> {
    let entries: Vec<Value> = agent
        .pending_approval
        .read()
        .await
        .values()
        .map(|p| serde_json::to_value(p).unwrap_or_default())
        .collect();
    Json(Value::Array(entries))
}

async fn approve_remoteapp(
    State(agent): State<Agent>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    executor::approve(&agent, &id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn reject_remoteapp(
    State(agent): State<Agent>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    executor::reject(&agent, &id).await?;
    Ok(Json(json!({"ok": true})))
}

async fn remoteapp_detail(
    State(agent): State<Agent>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(workload::detail(&agent, &id).await?))
}

#[derive(Debug, Deserialize)]
struct SpecUpdateRequest {
    spec: WorkloadSpec,
}

async fn update_remoteapp_spec(
    State(agent): State<Agent>,
    Path(id): Path<String>,
    Json(req): Json<SpecUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let app = workload::update_spec(&agent, &id, req.spec).await?;
    Ok(Json(serde_json::to_value(app).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
struct ScaleRequest {
    replicas: u32,
}

async fn scale_remoteapp(
    State(agent): State<Agent>,
    Path(id): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(workload::scale(&agent, &id, req.replicas).await?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    tail: Option<u32>,
    #[serde(default)]
    pod: Option<String>,
}

async fn remoteapp_logs(
    State(agent): State<Agent>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(
        workload::logs(&agent, &id, query.tail, query.pod).await?,
    ))
}

async fn delete_remoteapp(
    State(agent): State<Agent>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    workload::delete(&agent, &id).await?;
    Ok(Json(json!({"ok": true})))
}

// ── Tunnel ────────────────────────────────────────────────────────────────────

async fn proxy_root(
    State(agent): State<Agent>,
    Path((id, port)): Path<(String, u16)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    proxy_common(agent, id, port, String::new(), method, query, headers, body).await
}

async fn proxy_subpath(
    State(agent): State<Agent>,
    Path((id, port, path)): Path<(String, u16, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    proxy_common(agent, id, port, path, method, query, headers, body).await
}

#[allow(clippy::too_many_arguments)]
async fn proxy_common(
    agent: Agent,
    id: String,
    port: u16,
    path: String,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut path_and_query = path;
    if let Some(query) = query {
        if !query.is_empty() {
            path_and_query.push('?');
            path_and_query.push_str(&query);
        }
    }

    let header_map: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let reply = tunnel::forward_local(
        &agent,
        &id,
        port,
        method.as_str(),
        &path_and_query,
        header_map,
        body.to_vec(),
    )
    .await?;

    let body = tunnel::decode_body(&reply)?;
    let mut response = Response::builder().status(
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY),
    );
    if let Some(headers) = response.headers_mut() {
        for (name, value) in &reply.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }
    response
        .body(axum::body::Body::from(body))
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// ── Settings and notifications ────────────────────────────────────────────────

async fn get_settings(State(agent): State<Agent>) -> Json<AgentSettings> {
    Json(agent.settings.read().await.clone())
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Partial update: unknown fields are rejected by type when they collide
/// with a known field, ignored otherwise — the settings form posts only the
/// fields it changed.
async fn update_settings(
    State(agent): State<Agent>,
    Json(patch): Json<Value>,
) -> Result<Json<AgentSettings>, ApiError> {
    let Value::Object(patch) = patch else {
        return Err(ApiError::bad_request("settings patch must be an object"));
    };

    let merged = {
        let current = agent.settings.read().await.clone();
        let mut value = serde_json::to_value(&current).unwrap_or_default();
        if let Value::Object(map) = &mut value {
            for (key, new_value) in patch {
                map.insert(key, new_value);
            }
        }
        serde_json::from_value::<AgentSettings>(value)
            .map_err(|e| ApiError::bad_request(format!("invalid settings: {e}")))?
    };

    if !LOG_LEVELS.contains(&merged.log_level.to_ascii_lowercase().as_str()) {
        return Err(ApiError::bad_request(format!(
            "log_level must be one of {}",
            LOG_LEVELS.join(", ")
        )));
    }

    *agent.settings.write().await = merged.clone();
    agent.persist_state().await;
    tracing::info!("settings updated");
    Ok(Json(merged))
}

async fn list_notifications(State(agent): State<Agent>) -> Json<Value> {
    let ring = agent.notifications.lock().await;
    Json(serde_json::to_value(ring.iter().collect::<Vec<_>>()).unwrap_or_default())
}

async fn ack_notification(
    State(agent): State<Agent>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut ring = agent.notifications.lock().await;
    match ring.iter_mut().find(|n| n.id == id) {
        Some(notification) => {
            notification.ack = true;
            Ok(Json(json!({"ok": true})))
        }
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            "notification not found".to_string(),
        )),
    }
}
