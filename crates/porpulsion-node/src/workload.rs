// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Submitter side of the workload lifecycle.
//!
//! This module owns `local_apps`: create a [`RemoteApp`] with a fresh id,
//! hand it to the chosen peer over the channel, then follow the executor's
//! `remoteapp/status` reports until the app reaches a terminal state.
//! Scale, spec-update, detail, logs and delete are forwarded over the same
//! channel and answered synchronously to the operator.
//!
//! Submission requires an explicit `target_peer` — "first available peer"
//! under map iteration is not a stable choice, so the caller picks.
//!
//! Restart recovery is passive: `local_apps` rehydrates from the store and
//! the operator sees the last persisted status until the executor next
//! reports. In-flight submissions are not retried.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use porpulsion_model::{AppStatus, RemoteApp, WorkloadSpec};

use crate::channel::{self, CALL_TIMEOUT, CHANNEL_WAIT};
use crate::error::AgentError;
use crate::notify::Level;
use crate::state::Agent;
use crate::executor;

/// Submit a workload to `target_peer` for execution.
pub async fn submit(
    agent: &Agent,
    name: &str,
    spec: WorkloadSpec,
    target_peer: &str,
) -> Result<RemoteApp, AgentError> {
    if !agent.peers.read().await.contains_key(target_peer) {
        return Err(AgentError::PeerNotFound);
    }

    let mut app = RemoteApp::new(name, spec, agent.config.name.clone());
    app.target_peer = target_peer.to_string();
    agent
        .local_apps
        .write()
        .await
        .insert(app.id.clone(), app.clone());

    let outcome = async {
        let ch = channel::channel_to(agent, target_peer, CHANNEL_WAIT).await?;
        ch.call(
            "remoteapp/receive",
            serde_json::json!({
                "id": &app.id,
                "name": &app.name,
                "spec": &app.spec,
                "source_peer": &agent.config.name,
            }),
            CALL_TIMEOUT,
        )
        .await
    }
    .await;

    let reply = match outcome {
        Ok(reply) => reply,
        Err(e) => {
            // The peer never accepted the app; forget it locally.
            agent.local_apps.write().await.remove(&app.id);
            warn!(app = %app.id, peer = %target_peer, "submission failed: {e}");
            return Err(e);
        }
    };

    if let Some(status) = reply["status"].as_str() {
        app.set_status(status.parse().unwrap_or(AppStatus::Unknown));
    }
    if let Some(entry) = agent.local_apps.write().await.get_mut(&app.id) {
        entry.status = app.status.clone();
        entry.updated_at = app.updated_at;
    }
    agent.persist_state().await;
    info!(app = %app.id, name = %app.name, peer = %target_peer, "workload submitted");
    Ok(app)
}

/// Inbound `remoteapp/status`: the executor reports a transition.
pub async fn on_status_report(agent: &Agent, payload: Value) {
    let app_id = payload["id"]
        .as_str()
        .or_else(|| payload["app_id"].as_str())
        .unwrap_or("");
    let Some(status_text) = payload["status"].as_str() else {
        return;
    };
    let status: AppStatus = status_text.parse().unwrap_or(AppStatus::Unknown);
    let updated_at = payload["updated_at"]
        .as_str()
        .and_then(|t| t.parse::<DateTime<Utc>>().ok())
        .unwrap_or_else(Utc::now);

    let notified = {
        let mut apps = agent.local_apps.write().await;
        match apps.get_mut(app_id) {
            None => return,
            Some(app) => {
                app.status = status.clone();
                app.updated_at = updated_at;
                info!(app = %app_id, status = %status, "status report");
                status
                    .is_terminal_failure()
                    .then(|| (app.name.clone(), app.target_peer.clone()))
            }
        }
    };
    agent.persist_state().await;

    if let Some((name, target_peer)) = notified {
        agent
            .notify(
                Level::Error,
                format!("Workload failed: {name}"),
                format!("'{name}' on {target_peer}: {status}."),
            )
            .await;
    }
}

/// Delete an app. Two-phase for submitted apps: the executor deletes its
/// deployment first, then we drop the local record. Also covers apps
/// executing locally (operator cleaning up an inbound workload).
pub async fn delete(agent: &Agent, app_id: &str) -> Result<(), AgentError> {
    let local = agent.local_apps.read().await.get(app_id).cloned();
    if let Some(app) = local {
        let ch = channel::channel_to(agent, &app.target_peer, CHANNEL_WAIT).await?;
        ch.call(
            "remoteapp/delete",
            serde_json::json!({"id": app_id}),
            CALL_TIMEOUT,
        )
        .await?;
        if let Some(mut app) = agent.local_apps.write().await.remove(app_id) {
            app.set_status(AppStatus::Deleted);
        }
        agent.persist_state().await;
        info!(app = %app_id, "deleted submitted app");
        return Ok(());
    }

    if agent.remote_apps.read().await.contains_key(app_id) {
        let source_peer = agent
            .remote_apps
            .read()
            .await
            .get(app_id)
            .map(|a| a.source_peer.clone());
        executor::delete_remote(agent, serde_json::json!({"id": app_id})).await?;
        // Tell the submitter their app is gone.
        if let Some(peer) = source_peer {
            if let Ok(ch) = channel::channel_to(agent, &peer, CHANNEL_WAIT).await {
                let _ = ch
                    .call(
                        "remoteapp/status",
                        serde_json::json!({
                            "id": app_id,
                            "status": AppStatus::Deleted.to_string(),
                            "updated_at": Utc::now(),
                        }),
                        CALL_TIMEOUT,
                    )
                    .await;
            }
        }
        return Ok(());
    }

    Err(AgentError::AppNotFound)
}

/// Scale an app, local or executing-here.
pub async fn scale(agent: &Agent, app_id: &str, replicas: u32) -> Result<Value, AgentError> {
    let local = agent.local_apps.read().await.get(app_id).cloned();
    if let Some(app) = local {
        let ch = channel::channel_to(agent, &app.target_peer, CHANNEL_WAIT).await?;
        let reply = ch
            .call(
                "remoteapp/scale",
                serde_json::json!({"id": app_id, "replicas": replicas}),
                CALL_TIMEOUT,
            )
            .await?;
        if let Some(entry) = agent.local_apps.write().await.get_mut(app_id) {
            entry.spec.replicas = replicas;
            entry.updated_at = Utc::now();
        }
        agent.persist_state().await;
        return Ok(reply);
    }

    if agent.remote_apps.read().await.contains_key(app_id) {
        return executor::scale_remote(
            agent,
            serde_json::json!({"id": app_id, "replicas": replicas}),
        )
        .await;
    }

    Err(AgentError::AppNotFound)
}

/// Replace the spec of a submitted app; the executor re-deploys under the
/// same id after re-running admission.
pub async fn update_spec(
    agent: &Agent,
    app_id: &str,
    spec: WorkloadSpec,
) -> Result<RemoteApp, AgentError> {
    let app = agent
        .local_apps
        .read()
        .await
        .get(app_id)
        .cloned()
        .ok_or(AgentError::AppNotFound)?;

    let ch = channel::channel_to(agent, &app.target_peer, CHANNEL_WAIT).await?;
    ch.call(
        "remoteapp/spec-update",
        serde_json::json!({"id": app_id, "spec": &spec}),
        CALL_TIMEOUT,
    )
    .await?;

    let mut updated = app;
    {
        let mut apps = agent.local_apps.write().await;
        if let Some(entry) = apps.get_mut(app_id) {
            entry.spec = spec;
            entry.updated_at = Utc::now();
            updated = entry.clone();
        }
    }
    agent.persist_state().await;
    Ok(updated)
}

/// Operator detail view: the app record plus live cluster state from
/// whichever side executes it. A broken channel degrades to the record with
/// an error note instead of failing the whole request.
pub async fn detail(agent: &Agent, app_id: &str) -> Result<Value, AgentError> {
    let local = agent.local_apps.read().await.get(app_id).cloned();
    if let Some(app) = local {
        let cluster = async {
            let ch = channel::channel_to(agent, &app.target_peer, CHANNEL_WAIT).await?;
            ch.call(
                "remoteapp/detail",
                serde_json::json!({"id": app_id}),
                CALL_TIMEOUT,
            )
            .await
        }
        .await;
        let k8s = match cluster {
            Ok(detail) => detail,
            Err(e) => serde_json::json!({"error": e.to_string()}),
        };
        return Ok(serde_json::json!({"app": app, "k8s": k8s}));
    }

    let remote = agent.remote_apps.read().await.get(app_id).cloned();
    if let Some(app) = remote {
        let k8s = executor::detail_remote(agent, serde_json::json!({"id": app_id})).await?;
        return Ok(serde_json::json!({"app": app, "k8s": k8s}));
    }

    Err(AgentError::AppNotFound)
}

/// Pod logs, fetched from the executing side.
pub async fn logs(
    agent: &Agent,
    app_id: &str,
    tail: Option<u32>,
    pod: Option<String>,
) -> Result<Value, AgentError> {
    let local = agent.local_apps.read().await.get(app_id).cloned();
    if let Some(app) = local {
        let ch = channel::channel_to(agent, &app.target_peer, CHANNEL_WAIT).await?;
        return ch
            .call(
                "remoteapp/logs",
                serde_json::json!({"id": app_id, "tail": tail, "pod": pod}),
                CALL_TIMEOUT,
            )
            .await;
    }

    if agent.remote_apps.read().await.contains_key(app_id) {
        return executor::logs_remote(
            agent,
            serde_json::json!({"id": app_id, "tail": tail, "pod": pod}),
        )
        .await;
    }

    Err(AgentError::AppNotFound)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::executor::InMemoryBackend;
    use crate::state::AgentCore;
    use crate::store::FileStore;
    use std::sync::Arc;

    async fn test_agent(dir: &std::path::Path) -> Agent {
        let config = AgentConfig {
            name: "us-east".into(),
            namespace: "porpulsion".into(),
            self_url: "https://127.0.0.1:8443".into(),
            self_ip: "127.0.0.1".into(),
            operator_bind: "127.0.0.1:0".parse().unwrap(),
            peer_bind: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            max_frame_bytes: 4 * 1024 * 1024,
        };
        let store = Arc::new(FileStore::open(dir).unwrap());
        AgentCore::bootstrap(config, store, Arc::new(InMemoryBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn submit_requires_a_known_peer() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let err = submit(&agent, "web", WorkloadSpec::from_image("nginx"), "nowhere")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PeerNotFound));
        assert!(agent.local_apps.read().await.is_empty());
    }

    #[tokio::test]
    async fn status_report_updates_app_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let mut app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "us-east");
        app.target_peer = "eu-west".into();
        let id = app.id.clone();
        agent.local_apps.write().await.insert(id.clone(), app);

        on_status_report(
            &agent,
            serde_json::json!({"id": id, "status": "Ready", "updated_at": Utc::now()}),
        )
        .await;
        assert_eq!(
            agent.local_apps.read().await.get(&id).unwrap().status,
            AppStatus::Ready
        );
    }

    #[tokio::test]
    async fn failed_status_raises_a_notification() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let mut app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "us-east");
        app.target_peer = "eu-west".into();
        let id = app.id.clone();
        agent.local_apps.write().await.insert(id.clone(), app);

        on_status_report(
            &agent,
            serde_json::json!({"id": id, "status": "Failed: image pull backoff"}),
        )
        .await;
        let notifications = agent.notifications.lock().await;
        assert!(!notifications.is_empty());
        assert!(notifications[0].title.contains("Workload failed"));
    }

    #[tokio::test]
    async fn status_report_for_unknown_app_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        on_status_report(
            &agent,
            serde_json::json!({"id": "ffffffff", "status": "Ready"}),
        )
        .await;
        assert!(agent.local_apps.read().await.is_empty());
        assert!(agent.notifications.lock().await.is_empty());
    }
}
