// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Admission checks for inbound workloads, evaluated on the executor side
//! right before a submission reaches the approval queue or the backend.
//!
//! Checks run in a fixed order and stop at the first failure. The error text
//! is the operator-facing message: it travels back to the submitter verbatim
//! and is surfaced as a notification on both sides, so each variant names the
//! offending quantity and the configured limit.

use thiserror::Error;

use crate::app::RemoteApp;
use crate::quantity::parse_quantity;
use crate::settings::{csv_tokens, AgentSettings};
use crate::spec::WorkloadSpec;

#[derive(Debug, Error, PartialEq)]
pub enum AdmissionError {
    #[error("inbound workloads are disabled on this agent")]
    InboundDisabled,

    #[error("peer '{peer}' is not permitted to submit workloads to this cluster")]
    PeerNotAllowed { peer: String },

    #[error("image '{image}' is blocked by this cluster's policy")]
    ImageBlocked { image: String },

    #[error("image '{image}' is not in this cluster's allowed image list ({allowed})")]
    ImageNotAllowed { image: String, allowed: String },

    #[error(
        "this cluster requires resource requests (resources.requests.cpu and resources.requests.memory)"
    )]
    MissingResourceRequests,

    #[error(
        "this cluster requires resource limits (resources.limits.cpu and resources.limits.memory)"
    )]
    MissingResourceLimits,

    #[error("CPU request {requested} exceeds per-pod limit of {limit}")]
    CpuRequestTooLarge { requested: String, limit: String },

    #[error("CPU limit {requested} exceeds per-pod limit of {limit}")]
    CpuLimitTooLarge { requested: String, limit: String },

    #[error("memory request {requested} exceeds per-pod limit of {limit}")]
    MemoryRequestTooLarge { requested: String, limit: String },

    #[error("memory limit {requested} exceeds per-pod limit of {limit}")]
    MemoryLimitTooLarge { requested: String, limit: String },

    #[error("requested {requested} replicas exceeds this cluster's per-app limit of {limit}")]
    TooManyReplicas { requested: u32, limit: u32 },

    #[error("this cluster has reached its deployment limit ({limit} concurrent workloads)")]
    DeploymentLimitReached { limit: u32 },

    #[error(
        "insufficient pod capacity: {requested} requested, {available} available (limit {limit} total pods)"
    )]
    PodCapacityExceeded {
        requested: u32,
        available: u32,
        limit: u32,
    },

    #[error("insufficient CPU capacity: request {requested} would exceed cluster total of {limit}")]
    CpuCapacityExceeded { requested: String, limit: String },

    #[error("insufficient memory: request {requested} would exceed cluster total of {limit}")]
    MemoryCapacityExceeded { requested: String, limit: String },

    #[error("invalid quantity in spec or settings: {0}")]
    BadQuantity(String),
}

impl AdmissionError {
    fn bad_quantity(e: crate::quantity::QuantityError) -> Self {
        AdmissionError::BadQuantity(e.0)
    }
}

/// Evaluate an inbound submission against this agent's policy.
///
/// `active` is the current set of executor-side apps; entries whose status is
/// Failed, Timeout or Deleted do not count against the aggregate quotas.
pub fn check_admission(
    spec: &WorkloadSpec,
    source_peer: &str,
    settings: &AgentSettings,
    active: &[&RemoteApp],
) -> Result<(), AdmissionError> {
    // 1. Inbound master switch.
    if !settings.allow_inbound_remoteapps {
        return Err(AdmissionError::InboundDisabled);
    }

    // 2. Source-peer allowlist.
    let allowed_peers = csv_tokens(&settings.allowed_source_peers);
    if !allowed_peers.is_empty() && !allowed_peers.contains(&source_peer) {
        return Err(AdmissionError::PeerNotAllowed {
            peer: source_peer.to_string(),
        });
    }

    // 3. Image prefix policy: blocked list wins over allowed list.
    for prefix in csv_tokens(&settings.blocked_images) {
        if spec.image.starts_with(prefix) {
            return Err(AdmissionError::ImageBlocked {
                image: spec.image.clone(),
            });
        }
    }
    let allowed_images = csv_tokens(&settings.allowed_images);
    if !allowed_images.is_empty() && !allowed_images.iter().any(|p| spec.image.starts_with(p)) {
        return Err(AdmissionError::ImageNotAllowed {
            image: spec.image.clone(),
            allowed: allowed_images.join(", "),
        });
    }

    // 4. Presence requirements, checked before any numeric limits.
    let requests = &spec.resources.requests;
    let limits = &spec.resources.limits;
    if settings.require_resource_requests && (requests.cpu.is_none() || requests.memory.is_none()) {
        return Err(AdmissionError::MissingResourceRequests);
    }
    if settings.require_resource_limits && (limits.cpu.is_none() || limits.memory.is_none()) {
        return Err(AdmissionError::MissingResourceLimits);
    }

    let cpu_request = parse_quantity(requests.cpu.as_deref().unwrap_or(""))
        .map_err(AdmissionError::bad_quantity)?;
    let cpu_limit = parse_quantity(limits.cpu.as_deref().unwrap_or(""))
        .map_err(AdmissionError::bad_quantity)?;
    let mem_request = parse_quantity(requests.memory.as_deref().unwrap_or(""))
        .map_err(AdmissionError::bad_quantity)?;
    let mem_limit = parse_quantity(limits.memory.as_deref().unwrap_or(""))
        .map_err(AdmissionError::bad_quantity)?;

    // 5. Per-pod quantity ceilings.
    check_per_pod(
        &settings.max_cpu_request_per_pod,
        cpu_request,
        requests.cpu.as_deref(),
        |requested, limit| AdmissionError::CpuRequestTooLarge { requested, limit },
    )?;
    check_per_pod(
        &settings.max_cpu_limit_per_pod,
        cpu_limit,
        limits.cpu.as_deref(),
        |requested, limit| AdmissionError::CpuLimitTooLarge { requested, limit },
    )?;
    check_per_pod(
        &settings.max_memory_request_per_pod,
        mem_request,
        requests.memory.as_deref(),
        |requested, limit| AdmissionError::MemoryRequestTooLarge { requested, limit },
    )?;
    check_per_pod(
        &settings.max_memory_limit_per_pod,
        mem_limit,
        limits.memory.as_deref(),
        |requested, limit| AdmissionError::MemoryLimitTooLarge { requested, limit },
    )?;

    // 6. Per-app replica cap.
    if settings.max_replicas_per_app > 0 && spec.replicas > settings.max_replicas_per_app {
        return Err(AdmissionError::TooManyReplicas {
            requested: spec.replicas,
            limit: settings.max_replicas_per_app,
        });
    }

    let active: Vec<&RemoteApp> = active
        .iter()
        .copied()
        .filter(|a| a.status.is_active())
        .collect();

    // 7. Aggregate deployment count.
    if settings.max_total_deployments > 0 && active.len() as u32 >= settings.max_total_deployments {
        return Err(AdmissionError::DeploymentLimitReached {
            limit: settings.max_total_deployments,
        });
    }

    // 8. Aggregate pod count.
    if settings.max_total_pods > 0 {
        let used: u32 = active.iter().map(|a| a.spec.replicas).sum();
        if used + spec.replicas > settings.max_total_pods {
            return Err(AdmissionError::PodCapacityExceeded {
                requested: spec.replicas,
                available: settings.max_total_pods.saturating_sub(used),
                limit: settings.max_total_pods,
            });
        }
    }

    // 9. Aggregate CPU / memory requests.
    if !settings.max_total_cpu_requests.trim().is_empty() {
        let ceiling = parse_quantity(&settings.max_total_cpu_requests)
            .map_err(AdmissionError::bad_quantity)?;
        let used = sum_requests(&active, |r| r.cpu.as_deref())?;
        if used + cpu_request > ceiling {
            return Err(AdmissionError::CpuCapacityExceeded {
                requested: requests.cpu.clone().unwrap_or_else(|| "0".into()),
                limit: settings.max_total_cpu_requests.clone(),
            });
        }
    }
    if !settings.max_total_memory_requests.trim().is_empty() {
        let ceiling = parse_quantity(&settings.max_total_memory_requests)
            .map_err(AdmissionError::bad_quantity)?;
        let used = sum_requests(&active, |r| r.memory.as_deref())?;
        if used + mem_request > ceiling {
            return Err(AdmissionError::MemoryCapacityExceeded {
                requested: requests.memory.clone().unwrap_or_else(|| "0".into()),
                limit: settings.max_total_memory_requests.clone(),
            });
        }
    }

    Ok(())
}

fn check_per_pod(
    ceiling: &str,
    value: f64,
    requested: Option<&str>,
    err: impl FnOnce(String, String) -> AdmissionError,
) -> Result<(), AdmissionError> {
    if ceiling.trim().is_empty() {
        return Ok(());
    }
    let limit = parse_quantity(ceiling).map_err(AdmissionError::bad_quantity)?;
    if value > limit {
        return Err(err(
            requested.unwrap_or("0").to_string(),
            ceiling.to_string(),
        ));
    }
    Ok(())
}

fn sum_requests<'a>(
    active: &[&'a RemoteApp],
    field: impl Fn(&'a crate::spec::ResourceList) -> Option<&'a str>,
) -> Result<f64, AdmissionError> {
    let mut total = 0.0;
    for app in active {
        total += parse_quantity(field(&app.spec.resources.requests).unwrap_or(""))
            .map_err(AdmissionError::bad_quantity)?;
    }
    Ok(total)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppStatus;
    use crate::spec::{ResourceList, Resources};

    fn spec_with_requests(cpu: &str, memory: &str) -> WorkloadSpec {
        let mut spec = WorkloadSpec::from_image("nginx:1.25");
        spec.resources = Resources {
            requests: ResourceList {
                cpu: Some(cpu.into()),
                memory: Some(memory.into()),
            },
            limits: ResourceList::default(),
        };
        spec
    }

    fn active_app(cpu: &str, memory: &str, replicas: u32) -> RemoteApp {
        let mut spec = spec_with_requests(cpu, memory);
        spec.replicas = replicas;
        let mut app = RemoteApp::new("existing", spec, "alice");
        app.set_status(AppStatus::Running);
        app
    }

    #[test]
    fn inbound_disabled_wins_over_everything() {
        let settings = AgentSettings {
            allow_inbound_remoteapps: false,
            blocked_images: "nginx".into(),
            ..Default::default()
        };
        let err = check_admission(
            &WorkloadSpec::from_image("nginx"),
            "alice",
            &settings,
            &[],
        )
        .unwrap_err();
        assert_eq!(err, AdmissionError::InboundDisabled);
    }

    #[test]
    fn unlisted_source_peer_is_rejected() {
        let settings = AgentSettings {
            allowed_source_peers: "alice, bob".into(),
            ..Default::default()
        };
        let spec = WorkloadSpec::from_image("nginx");
        assert!(check_admission(&spec, "alice", &settings, &[]).is_ok());
        let err = check_admission(&spec, "mallory", &settings, &[]).unwrap_err();
        assert!(err.to_string().contains("mallory"));
    }

    #[test]
    fn blocked_prefix_beats_allowed_prefix() {
        let settings = AgentSettings {
            blocked_images: "docker.io/evil".into(),
            allowed_images: "docker.io/".into(),
            ..Default::default()
        };
        let err = check_admission(
            &WorkloadSpec::from_image("docker.io/evil/miner:latest"),
            "alice",
            &settings,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, AdmissionError::ImageBlocked { .. }));
    }

    #[test]
    fn allowed_list_requires_prefix_match() {
        let settings = AgentSettings {
            allowed_images: "registry.internal/, ghcr.io/acme/".into(),
            ..Default::default()
        };
        assert!(check_admission(
            &WorkloadSpec::from_image("ghcr.io/acme/api:2"),
            "alice",
            &settings,
            &[]
        )
        .is_ok());
        let err = check_admission(
            &WorkloadSpec::from_image("docker.io/library/nginx"),
            "alice",
            &settings,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, AdmissionError::ImageNotAllowed { .. }));
    }

    #[test]
    fn missing_requests_rejected_when_required() {
        let settings = AgentSettings {
            require_resource_requests: true,
            ..Default::default()
        };
        let err = check_admission(&WorkloadSpec::from_image("nginx"), "alice", &settings, &[])
            .unwrap_err();
        assert_eq!(err, AdmissionError::MissingResourceRequests);
        // With requests present the same settings pass.
        let spec = spec_with_requests("100m", "64Mi");
        assert!(check_admission(&spec, "alice", &settings, &[]).is_ok());
    }

    #[test]
    fn per_pod_cpu_ceiling_names_both_quantities() {
        let settings = AgentSettings {
            max_cpu_request_per_pod: "500m".into(),
            ..Default::default()
        };
        let err = check_admission(&spec_with_requests("1", "64Mi"), "alice", &settings, &[])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains('1'), "message must name the request: {msg}");
        assert!(msg.contains("500m"), "message must name the limit: {msg}");
    }

    #[test]
    fn per_pod_memory_ceiling_enforced() {
        let settings = AgentSettings {
            max_memory_request_per_pod: "256Mi".into(),
            ..Default::default()
        };
        assert!(check_admission(&spec_with_requests("1", "128Mi"), "alice", &settings, &[]).is_ok());
        let err = check_admission(&spec_with_requests("1", "1Gi"), "alice", &settings, &[])
            .unwrap_err();
        assert!(matches!(err, AdmissionError::MemoryRequestTooLarge { .. }));
    }

    #[test]
    fn replica_cap_enforced() {
        let settings = AgentSettings {
            max_replicas_per_app: 3,
            ..Default::default()
        };
        let mut spec = WorkloadSpec::from_image("nginx");
        spec.replicas = 4;
        let err = check_admission(&spec, "alice", &settings, &[]).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::TooManyReplicas {
                requested: 4,
                limit: 3
            }
        );
    }

    #[test]
    fn deployment_count_excludes_inactive_apps() {
        let settings = AgentSettings {
            max_total_deployments: 1,
            ..Default::default()
        };
        let mut dead = active_app("", "", 1);
        dead.set_status(AppStatus::Failed("crash".into()));
        // Only inactive apps exist → the slot is free.
        assert!(check_admission(
            &WorkloadSpec::from_image("nginx"),
            "alice",
            &settings,
            &[&dead]
        )
        .is_ok());
        let live = active_app("", "", 1);
        let err = check_admission(
            &WorkloadSpec::from_image("nginx"),
            "alice",
            &settings,
            &[&live],
        )
        .unwrap_err();
        assert_eq!(err, AdmissionError::DeploymentLimitReached { limit: 1 });
    }

    #[test]
    fn pod_capacity_counts_replicas() {
        let settings = AgentSettings {
            max_total_pods: 5,
            ..Default::default()
        };
        let existing = active_app("", "", 3);
        let mut spec = WorkloadSpec::from_image("nginx");
        spec.replicas = 3;
        let err = check_admission(&spec, "alice", &settings, &[&existing]).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::PodCapacityExceeded {
                requested: 3,
                available: 2,
                limit: 5
            }
        );
        spec.replicas = 2;
        assert!(check_admission(&spec, "alice", &settings, &[&existing]).is_ok());
    }

    #[test]
    fn aggregate_cpu_quota_message_names_cpu_and_limit() {
        // Total ceiling 2 cores, 1 core already used: a 1.1-core submission
        // must be rejected with "CPU" and "2" in the message.
        let settings = AgentSettings {
            max_total_cpu_requests: "2".into(),
            max_total_memory_requests: "1Gi".into(),
            ..Default::default()
        };
        let existing = active_app("1", "512Mi", 1);
        let err = check_admission(
            &spec_with_requests("1.1", "128Mi"),
            "alice",
            &settings,
            &[&existing],
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CPU"), "got: {msg}");
        assert!(msg.contains('2'), "got: {msg}");
    }

    #[test]
    fn aggregate_memory_quota_enforced() {
        let settings = AgentSettings {
            max_total_memory_requests: "1Gi".into(),
            ..Default::default()
        };
        let existing = active_app("1", "512Mi", 1);
        assert!(check_admission(
            &spec_with_requests("1", "512Mi"),
            "alice",
            &settings,
            &[&existing]
        )
        .is_ok());
        let err = check_admission(
            &spec_with_requests("1", "768Mi"),
            "alice",
            &settings,
            &[&existing],
        )
        .unwrap_err();
        assert!(matches!(err, AdmissionError::MemoryCapacityExceeded { .. }));
    }

    #[test]
    fn everything_open_by_default() {
        let settings = AgentSettings::default();
        assert!(check_admission(
            &spec_with_requests("8", "32Gi"),
            "anyone",
            &settings,
            &[]
        )
        .is_ok());
    }
}
