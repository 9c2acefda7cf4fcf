// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The workload specification a submitter hands to an executor.
//!
//! Every field except `image` is optional. Unknown JSON fields are ignored on
//! ingress so older agents can receive specs written by newer ones; missing
//! fields take the documented defaults. Resource quantities stay as
//! cluster-native strings (`"500m"`, `"128Mi"`) — parsing happens only where
//! the admission engine needs numbers (see [`crate::quantity`]).

use serde::{Deserialize, Serialize};

fn default_replicas() -> u32 {
    1
}

/// A container workload as submitted over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Container image reference. The only required field.
    pub image: String,

    /// Desired replica count, at least 1.
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Resource requests and limits in cluster-native quantity strings.
    #[serde(default, skip_serializing_if = "Resources::is_empty")]
    pub resources: Resources,

    /// Container ports to expose.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments to the entrypoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables, literal or sourced from cluster objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,

    /// Names of image pull secrets in the executor's namespace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ReadinessProbe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

impl WorkloadSpec {
    /// A minimal spec: just an image, one replica.
    pub fn from_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            replicas: 1,
            resources: Resources::default(),
            ports: Vec::new(),
            command: Vec::new(),
            args: Vec::new(),
            env: Vec::new(),
            image_pull_policy: None,
            image_pull_secrets: Vec::new(),
            readiness_probe: None,
            security_context: None,
        }
    }
}

/// Requests and limits, both optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub requests: ResourceList,
    #[serde(default, skip_serializing_if = "ResourceList::is_empty")]
    pub limits: ResourceList,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// One side of a resource requirement (cpu + memory quantity strings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceList {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }
}

/// A named container port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An environment variable: literal value or a reference into the executor's
/// namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<EnvVarSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configmap_ref: Option<KeyRef>,
}

/// A `{name, key}` reference into a Secret or ConfigMap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Readiness probe: exactly one of `http_get` / `exec` is expected; the
/// executor backend ignores a probe with neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_get: Option<HttpGetAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGetAction {
    pub path: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecAction {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_defaults() {
        let spec: WorkloadSpec = serde_json::from_str(r#"{"image": "nginx:1.25"}"#).unwrap();
        assert_eq!(spec.image, "nginx:1.25");
        assert_eq!(spec.replicas, 1);
        assert!(spec.resources.is_empty());
        assert!(spec.ports.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let spec: WorkloadSpec =
            serde_json::from_str(r#"{"image": "nginx", "gpu_class": "a100"}"#).unwrap();
        assert_eq!(spec.image, "nginx");
    }

    #[test]
    fn resources_parse_as_quantity_strings() {
        let spec: WorkloadSpec = serde_json::from_str(
            r#"{"image": "x", "resources": {"requests": {"cpu": "250m", "memory": "128Mi"}}}"#,
        )
        .unwrap();
        assert_eq!(spec.resources.requests.cpu.as_deref(), Some("250m"));
        assert_eq!(spec.resources.requests.memory.as_deref(), Some("128Mi"));
        assert!(spec.resources.limits.is_empty());
    }

    #[test]
    fn minimal_spec_serializes_without_empty_fields() {
        let json = serde_json::to_value(WorkloadSpec::from_image("nginx")).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("image"));
        assert!(!obj.contains_key("resources"));
        assert!(!obj.contains_key("ports"));
        assert!(!obj.contains_key("readiness_probe"));
    }

    #[test]
    fn env_value_from_round_trip() {
        let spec: WorkloadSpec = serde_json::from_str(
            r#"{"image": "x", "env": [
                {"name": "LITERAL", "value": "1"},
                {"name": "FROM_SECRET",
                 "value_from": {"secret_ref": {"name": "db", "key": "password"}}}
            ]}"#,
        )
        .unwrap();
        let back = serde_json::to_string(&spec).unwrap();
        let again: WorkloadSpec = serde_json::from_str(&back).unwrap();
        assert_eq!(spec, again);
        assert_eq!(
            again.env[1]
                .value_from
                .as_ref()
                .unwrap()
                .secret_ref
                .as_ref()
                .unwrap()
                .key,
            "password"
        );
    }
}
