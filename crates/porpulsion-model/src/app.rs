// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! A `RemoteApp` exists as two projections of the same record: the submitter
//! keeps it in `local_apps` (with `target_peer` set) and follows status
//! callbacks, the executor keeps it in `remote_apps` (where the backing
//! cluster resources live). The 8-hex `id` is chosen by the submitter and
//! carried unchanged between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::spec::WorkloadSpec;

/// Lifecycle status of a workload.
///
/// On the wire and in persisted state this is the plain status string the
/// dashboard shows (`"Ready"`, `"Failed: quota exceeded"`, …), so it
/// serializes through its `Display`/`FromStr` forms rather than as an enum
/// tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppStatus {
    Pending,
    /// Parked in the executor's approval queue.
    PendingApproval,
    Creating,
    Running,
    Ready,
    Timeout,
    Failed(String),
    Rejected,
    Deleted,
    Unknown,
}

impl AppStatus {
    /// Active apps count against the executor's aggregate quotas.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            AppStatus::Failed(_) | AppStatus::Timeout | AppStatus::Deleted
        )
    }

    /// Statuses the submitter surfaces as a notification.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            AppStatus::Failed(_) | AppStatus::Timeout | AppStatus::Rejected
        )
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppStatus::Pending => write!(f, "Pending"),
            AppStatus::PendingApproval => write!(f, "pending_approval"),
            AppStatus::Creating => write!(f, "Creating"),
            AppStatus::Running => write!(f, "Running"),
            AppStatus::Ready => write!(f, "Ready"),
            AppStatus::Timeout => write!(f, "Timeout"),
            AppStatus::Failed(reason) => write!(f, "Failed: {reason}"),
            AppStatus::Rejected => write!(f, "Rejected"),
            AppStatus::Deleted => write!(f, "Deleted"),
            AppStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl std::str::FromStr for AppStatus {
    type Err = std::convert::Infallible;

    /// Never fails: a status string from a newer peer we don't recognise
    /// maps to `Unknown` rather than poisoning the app record.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => AppStatus::Pending,
            "pending_approval" => AppStatus::PendingApproval,
            "Creating" => AppStatus::Creating,
            "Running" => AppStatus::Running,
            "Ready" => AppStatus::Ready,
            "Timeout" => AppStatus::Timeout,
            "Rejected" => AppStatus::Rejected,
            "Deleted" => AppStatus::Deleted,
            s if s == "Failed" => AppStatus::Failed(String::new()),
            s => {
                if let Some(reason) = s.strip_prefix("Failed: ") {
                    AppStatus::Failed(reason.to_string())
                } else if let Some(reason) = s.strip_prefix("Failed:") {
                    AppStatus::Failed(reason.trim_start().to_string())
                } else {
                    AppStatus::Unknown
                }
            }
        })
    }
}

impl Serialize for AppStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AppStatus {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(s.parse().unwrap_or(AppStatus::Unknown))
    }
}

/// A workload submitted by one agent and executed by another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteApp {
    /// 8-hex opaque id, agreed by the submitter.
    pub id: String,
    pub name: String,
    pub spec: WorkloadSpec,
    /// Agent that submitted the workload.
    pub source_peer: String,
    /// Peer executing the workload — set only on the submitting side.
    #[serde(default)]
    pub target_peer: String,
    #[serde(default = "default_status")]
    pub status: AppStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> AppStatus {
    AppStatus::Pending
}

impl RemoteApp {
    pub fn new(name: impl Into<String>, spec: WorkloadSpec, source_peer: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_app_id(),
            name: name.into(),
            spec,
            source_peer: source_peer.into(),
            target_peer: String::new(),
            status: AppStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: AppStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Fresh 8-hex app id.
pub fn new_app_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
