// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::executor::BackendError;

/// Errors surfaced by the agent runtime.
///
/// `Peer` carries an error reply relayed verbatim from the remote agent;
/// `Transport`/`Timeout` mean the channel itself failed and the caller cannot
/// know whether the peer acted on the request.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout waiting for reply to {0}")]
    Timeout(String),

    /// Error reply from the peer, message unchanged.
    #[error("{0}")]
    Peer(String),

    #[error("no live channel to peer '{0}'")]
    NoChannel(String),

    #[error("frame too large ({size} bytes, limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unknown type: {0}")]
    UnknownType(String),

    /// Admission rejection; the message is the operator-facing policy text.
    #[error("{0}")]
    Admission(String),

    #[error("app not found")]
    AppNotFound,

    #[error("peer not found")]
    PeerNotFound,

    #[error("request not found")]
    RequestNotFound,

    #[error("invalid token")]
    InvalidToken,

    #[error("no pending outbound connection for this peer")]
    NoPendingOutbound,

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AgentError {
    pub fn payload(e: serde_json::Error) -> Self {
        AgentError::Payload(e.to_string())
    }
}
