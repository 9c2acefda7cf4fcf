// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Operator-controlled policy for an agent.
//!
//! Prefix lists and allowlists are comma-separated strings (what the settings
//! form submits); quantity ceilings are cluster-native strings so operators
//! write `"500m"` / `"2Gi"` the same way they would in a pod spec. An empty
//! string or `0` means "no limit" for every quota field.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Master switch for accepting `remoteapp/receive` from peers.
    #[serde(default = "default_true")]
    pub allow_inbound_remoteapps: bool,

    /// Park admission-passing submissions for operator approval instead of
    /// executing them immediately.
    #[serde(default)]
    pub require_remoteapp_approval: bool,

    /// Comma-separated image prefixes that are always rejected.
    #[serde(default)]
    pub blocked_images: String,

    /// Comma-separated image prefixes; when non-empty, images must match one.
    #[serde(default)]
    pub allowed_images: String,

    /// Comma-separated peer names; when non-empty, only these peers may
    /// submit workloads.
    #[serde(default)]
    pub allowed_source_peers: String,

    /// Master switch for accepting `proxy/request` from peers.
    #[serde(default = "default_true")]
    pub allow_inbound_tunnels: bool,

    /// Comma-separated tunnel allowlist tokens: `peer` (whole peer) or
    /// `peer/app_id` (one app). Empty means deny-all.
    #[serde(default)]
    pub allowed_tunnel_peers: String,

    /// Reject specs without `resources.requests.cpu` + `.memory`.
    #[serde(default)]
    pub require_resource_requests: bool,

    /// Reject specs without `resources.limits.cpu` + `.memory`.
    #[serde(default)]
    pub require_resource_limits: bool,

    // Per-pod ceilings (quantity strings; empty = unlimited)
    #[serde(default)]
    pub max_cpu_request_per_pod: String,
    #[serde(default)]
    pub max_cpu_limit_per_pod: String,
    #[serde(default)]
    pub max_memory_request_per_pod: String,
    #[serde(default)]
    pub max_memory_limit_per_pod: String,

    /// Max replica count of a single app (0 = unlimited).
    #[serde(default)]
    pub max_replicas_per_app: u32,

    // Aggregate ceilings across all active inbound apps
    /// Max concurrent deployments (0 = unlimited).
    #[serde(default)]
    pub max_total_deployments: u32,
    /// Max total pods (0 = unlimited).
    #[serde(default)]
    pub max_total_pods: u32,
    /// Max sum of CPU requests (quantity string; empty = unlimited).
    #[serde(default)]
    pub max_total_cpu_requests: String,
    /// Max sum of memory requests (quantity string; empty = unlimited).
    #[serde(default)]
    pub max_total_memory_requests: String,

    /// Diagnostic log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            allow_inbound_remoteapps: true,
            require_remoteapp_approval: false,
            blocked_images: String::new(),
            allowed_images: String::new(),
            allowed_source_peers: String::new(),
            allow_inbound_tunnels: true,
            allowed_tunnel_peers: String::new(),
            require_resource_requests: false,
            require_resource_limits: false,
            max_cpu_request_per_pod: String::new(),
            max_cpu_limit_per_pod: String::new(),
            max_memory_request_per_pod: String::new(),
            max_memory_limit_per_pod: String::new(),
            max_replicas_per_app: 0,
            max_total_deployments: 0,
            max_total_pods: 0,
            max_total_cpu_requests: String::new(),
            max_total_memory_requests: String::new(),
            log_level: default_log_level(),
        }
    }
}

/// Split a comma-separated settings field into trimmed, non-empty tokens.
pub fn csv_tokens(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_open_but_approval_free() {
        let s = AgentSettings::default();
        assert!(s.allow_inbound_remoteapps);
        assert!(s.allow_inbound_tunnels);
        assert!(!s.require_remoteapp_approval);
        assert_eq!(s.max_replicas_per_app, 0);
    }

    #[test]
    fn csv_tokens_trims_and_drops_empties() {
        assert_eq!(
            csv_tokens(" alice , bob/app-xyz ,, "),
            vec!["alice", "bob/app-xyz"]
        );
        assert!(csv_tokens("").is_empty());
        assert!(csv_tokens("  ,  ").is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: AgentSettings =
            serde_json::from_str(r#"{"max_replicas_per_app": 5, "blocked_images": "docker.io/"}"#)
                .unwrap();
        assert_eq!(s.max_replicas_per_app, 5);
        assert_eq!(s.blocked_images, "docker.io/");
        assert!(s.allow_inbound_remoteapps);
        assert_eq!(s.log_level, "info");
    }
}
