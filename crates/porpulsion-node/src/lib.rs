// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Agent runtime for a porpulsion node.
//!
//! One agent runs inside one cluster, owns its local execution substrate and
//! forms authenticated peer-to-peer links with agents in other clusters.
//! Everything hangs off an [`state::AgentCore`] singleton built once at
//! startup:
//!
//! ```text
//! identity  ──► peering ──► registry ──► channel manager ──► RPC dispatch
//!                                             │
//!               workload controller ◄─────────┴─────────► executor adapter
//!                    (submitter)            frames            (executor)
//!                                             │
//!                                       tunnel engine
//! ```
//!
//! The HTTP surface is split in two: an operator-facing router (management
//! API) and a peer-facing TLS router exposing only `POST /peer` and
//! `GET /ws`.

pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod identity;
pub mod notify;
pub mod peering;
pub mod state;
pub mod store;
pub mod tunnel;
pub mod workload;

pub use error::AgentError;
pub use state::{Agent, AgentCore};
