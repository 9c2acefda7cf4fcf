// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Dispatch tables for inbound channel frames.
//!
//! Peer authentication already happened at the WebSocket upgrade — handlers
//! trust `peer_name` and never the payload's claim of who is calling.
//! Request handlers return the reply payload; push handlers return nothing.

use serde_json::Value;
use tracing::debug;

use crate::error::AgentError;
use crate::state::Agent;
use crate::{executor, peering, tunnel, workload};

/// Handle an inbound request (a frame with an id). The returned payload is
/// wrapped into an `ok=true` reply; an error becomes `ok=false` with the
/// error text.
pub async fn handle_request(
    agent: &Agent,
    peer_name: &str,
    kind: &str,
    payload: Value,
) -> Result<Value, AgentError> {
    match kind {
        "remoteapp/receive" => executor::receive_app(agent, peer_name, payload).await,
        "remoteapp/status" => {
            workload::on_status_report(agent, payload).await;
            Ok(serde_json::json!({"ok": true}))
        }
        "remoteapp/delete" => executor::delete_remote(agent, payload).await,
        "remoteapp/scale" => executor::scale_remote(agent, payload).await,
        "remoteapp/detail" => executor::detail_remote(agent, payload).await,
        "remoteapp/logs" => executor::logs_remote(agent, payload).await,
        "remoteapp/spec-update" => executor::spec_update_remote(agent, peer_name, payload).await,
        "proxy/request" => tunnel::handle_proxy_request(agent, peer_name, payload).await,
        other => Err(AgentError::UnknownType(other.to_string())),
    }
}

/// Handle an inbound push (no id, no reply). `ping` and `version/announce`
/// are consumed by the channel itself before reaching this table.
pub async fn handle_push(agent: &Agent, peer_name: &str, kind: &str, payload: Value) {
    match kind {
        "remoteapp/status" => workload::on_status_report(agent, payload).await,
        "peer/disconnect" => peering::on_peer_disconnect(agent, peer_name, payload).await,
        other => debug!(peer = %peer_name, kind = %other, "ignoring unknown push"),
    }
}
