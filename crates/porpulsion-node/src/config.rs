// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Runtime configuration for one agent.
//!
//! Configuration is environment-driven (the agent runs as a pod):
//! `AGENT_NAME`, `PORPULSION_NAMESPACE` and `SELF_URL`, with bind addresses
//! and the data directory settable from the CLI. All defaults are
//! production-safe.
//!
//! When `SELF_URL` is absent the agent probes its own outbound IP and logs a
//! warning — the detected URL is pod-local and peering from outside the
//! cluster will fail until a reachable URL is configured.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::warn;

fn default_operator_bind() -> SocketAddr {
    "0.0.0.0:8000".parse().unwrap_or_else(|_| unreachable!())
}

fn default_peer_bind() -> SocketAddr {
    "0.0.0.0:8443".parse().unwrap_or_else(|_| unreachable!())
}

/// Maximum accepted channel frame / request body size: 4 MiB.
const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This agent's name — its identity towards peers.
    pub name: String,
    /// Namespace the executor backend deploys workloads into.
    pub namespace: String,
    /// Public URL peers use to reach the peer-facing listener.
    pub self_url: String,
    /// IP extracted from `self_url`, used as a leaf-cert SAN.
    pub self_ip: String,
    /// Operator (management) HTTP listener.
    pub operator_bind: SocketAddr,
    /// Peer-facing TLS listener (`/peer`, `/ws`).
    pub peer_bind: SocketAddr,
    /// Directory for the file-backed state store.
    pub data_dir: PathBuf,
    /// Safety rail for channel frames and request bodies.
    pub max_frame_bytes: usize,
}

impl AgentConfig {
    /// Build the config from the environment, with optional CLI overrides.
    pub fn from_env(
        operator_bind: Option<SocketAddr>,
        peer_bind: Option<SocketAddr>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        let name =
            std::env::var("AGENT_NAME").unwrap_or_else(|_| "porpulsion-agent".to_string());
        let namespace =
            std::env::var("PORPULSION_NAMESPACE").unwrap_or_else(|_| "porpulsion".to_string());

        let peer_bind = peer_bind.unwrap_or_else(default_peer_bind);
        let self_url = match std::env::var("SELF_URL") {
            Ok(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => {
                let ip = detect_outbound_ip().unwrap_or_else(|| "127.0.0.1".to_string());
                let url = format!("https://{ip}:{}", peer_bind.port());
                warn!(
                    detected = %url,
                    "SELF_URL is not set — probed the outbound IP; peering from outside this network will fail"
                );
                url
            }
        };
        let self_ip = extract_host_ip(&self_url).unwrap_or_default();

        Self {
            name,
            namespace,
            self_url,
            self_ip,
            operator_bind: operator_bind.unwrap_or_else(default_operator_bind),
            peer_bind,
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/porpulsion")
}

/// Probe the outbound IP by opening a UDP socket towards a public address.
/// No packet is sent — connect() just selects the local interface.
fn detect_outbound_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Pull the host out of a URL like `https://10.0.0.2:8443`, returning it only
/// when it is a literal IPv4 address (the leaf cert's IP SAN).
fn extract_host_ip(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', ':']).next()?;
    host.parse::<std::net::Ipv4Addr>().ok().map(|ip| ip.to_string())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_from_https_url() {
        assert_eq!(
            extract_host_ip("https://10.1.2.3:8443").as_deref(),
            Some("10.1.2.3")
        );
        assert_eq!(
            extract_host_ip("http://192.168.0.7:8443/path").as_deref(),
            Some("192.168.0.7")
        );
    }

    #[test]
    fn hostname_urls_have_no_ip_san() {
        assert!(extract_host_ip("https://agent.example.com:8443").is_none());
        assert!(extract_host_ip("not a url").is_none());
    }

    #[test]
    fn default_binds_cover_both_surfaces() {
        assert_eq!(default_operator_bind().port(), 8000);
        assert_eq!(default_peer_bind().port(), 8443);
    }
}
