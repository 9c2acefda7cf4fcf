// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "porpulsion",
    version,
    about = "Federated cluster agent that submits and executes container workloads across peers"
)]
pub struct Cli {
    /// Increase log verbosity (-v: debug, -vv: trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the agent (the default when no subcommand is given).
    Start {
        /// Operator API listener. Default: 0.0.0.0:8000
        #[arg(long)]
        operator_bind: Option<SocketAddr>,

        /// Peer-facing TLS listener. Default: 0.0.0.0:8443
        #[arg(long)]
        peer_bind: Option<SocketAddr>,

        /// Directory for durable agent state.
        /// Default: ~/.config/porpulsion
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the peering material another operator needs: invite token,
    /// CA fingerprint, and this agent's URL.
    Token {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}
