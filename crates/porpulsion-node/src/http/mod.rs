// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP surfaces.
//!
//! Two listeners keep the trust boundary explicit:
//!
//! - **operator** (plain HTTP, management network): the full management API.
//! - **peer-facing** (TLS with the agent's leaf cert): only `POST /peer`
//!   (handshake) and `GET /ws` (channel upgrade) — everything a remote agent
//!   ever needs to reach.

pub mod operator;
pub mod peer;

use anyhow::Context;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use crate::error::AgentError;
use crate::executor::BackendError;
use crate::state::Agent;

/// Serve both listeners until shutdown.
pub async fn serve(agent: Agent) -> anyhow::Result<()> {
    // axum-server builds its rustls ServerConfig with the process-default
    // crypto provider; install ring if nothing claimed the slot yet.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let tls = axum_server::tls_rustls::RustlsConfig::from_pem(
        agent.identity.cert_pem.clone().into_bytes(),
        agent.identity.key_pem.clone().into_bytes(),
    )
    .await
    .context("building peer-facing TLS config")?;

    info!(
        operator = %agent.config.operator_bind,
        peers = %agent.config.peer_bind,
        "starting HTTP listeners"
    );

    let operator_router = operator::router(agent.clone());
    let peer_router = peer::router(agent.clone());

    let peer_server =
        axum_server::bind_rustls(agent.config.peer_bind, tls).serve(peer_router.into_make_service());
    let operator_server =
        axum_server::bind(agent.config.operator_bind).serve(operator_router.into_make_service());

    tokio::try_join!(peer_server, operator_server).context("HTTP server error")?;
    Ok(())
}

// ── Error mapping ─────────────────────────────────────────────────────────────

/// JSON error body with the HTTP status an [`AgentError`] maps to.
pub struct ApiError(pub StatusCode, pub String);

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError(StatusCode::BAD_REQUEST, msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"error": self.1}))).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        let status = match &e {
            AgentError::InvalidToken | AgentError::NoPendingOutbound => StatusCode::FORBIDDEN,
            AgentError::AppNotFound
            | AgentError::PeerNotFound
            | AgentError::RequestNotFound
            | AgentError::Backend(BackendError::NotFound) => StatusCode::NOT_FOUND,
            AgentError::Admission(_) => StatusCode::TOO_MANY_REQUESTS,
            AgentError::NoChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Transport(_)
            | AgentError::Timeout(_)
            | AgentError::Peer(_)
            | AgentError::Backend(BackendError::Api(_)) => StatusCode::BAD_GATEWAY,
            AgentError::FrameTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::UnknownType(_)
            | AgentError::Payload(_)
            | AgentError::Invalid(_) => StatusCode::BAD_REQUEST,
        };
        ApiError(status, e.to_string())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_429() {
        let api: ApiError = AgentError::Admission("quota".into()).into();
        assert_eq!(api.0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn not_found_family_maps_to_404() {
        for e in [
            AgentError::AppNotFound,
            AgentError::PeerNotFound,
            AgentError::RequestNotFound,
        ] {
            let api: ApiError = e.into();
            assert_eq!(api.0, StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn transport_maps_to_502_and_missing_channel_to_503() {
        let api: ApiError = AgentError::Transport("boom".into()).into();
        assert_eq!(api.0, StatusCode::BAD_GATEWAY);
        let api: ApiError = AgentError::NoChannel("eu".into()).into();
        assert_eq!(api.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn bad_token_maps_to_403() {
        let api: ApiError = AgentError::InvalidToken.into();
        assert_eq!(api.0, StatusCode::FORBIDDEN);
    }
}
