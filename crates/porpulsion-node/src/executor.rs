// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Executor side of the workload lifecycle.
//!
//! Translates an accepted [`WorkloadSpec`] into calls on an
//! [`ExecutorBackend`] (the cluster-API seam — the real cluster client is an
//! external collaborator) and drives the status state machine:
//!
//! ```text
//! Pending ─submit─► Creating ─apply─► Running ─poll ready≥desired─► Ready
//!                        │                 │ 60 polls (2 s) exhausted
//!                        │apply error      └───────────────────────► Timeout
//!                        └► Failed:<reason>
//! ```
//!
//! Each transition pushes `remoteapp/status` to the submitter. A re-deploy
//! of the same id cancels the previous readiness watcher through its stop
//! flag before starting a new one, so a superseded watcher can never clobber
//! the newer status.
//!
//! Deployments carry the labels `porpulsion.io/remote-app-id` and
//! `porpulsion.io/source-peer` so they are rediscoverable after a restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use porpulsion_model::{
    app::new_app_id, check_admission, AppStatus, PendingApproval, RemoteApp, WorkloadSpec,
};

use crate::channel::CALL_TIMEOUT;
use crate::error::AgentError;
use crate::notify::Level;
use crate::state::Agent;

/// Readiness poll: 60 attempts, 2 s apart.
const READY_POLL_ATTEMPTS: u32 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Status callbacks: 3 attempts, pausing 1 s then 2 s.
const STATUS_RETRY_DELAYS: [u64; 2] = [1, 2];

/// Label carrying the app id on every object the executor creates.
pub const APP_ID_LABEL: &str = "porpulsion.io/remote-app-id";
/// Label carrying the submitting peer's name.
pub const SOURCE_PEER_LABEL: &str = "porpulsion.io/source-peer";

/// Deployment name for an app: `ra-<id>-<name>`, truncated to the cluster's
/// 63-character object-name limit.
pub fn deployment_name(id: &str, name: &str) -> String {
    let full = format!("ra-{id}-{name}");
    full.chars().take(63).collect()
}

// ── Backend seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("deployment not found")]
    NotFound,
    #[error("cluster API error: {0}")]
    Api(String),
}

/// Live state of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub deploy_name: String,
    pub desired: u32,
    pub ready: u32,
    pub available: u32,
    pub updated: u32,
    pub pods: Vec<PodInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub phase: String,
    pub ready: bool,
    pub restarts: u32,
    pub node: String,
}

/// A deployment rediscovered by label selector after a restart.
#[derive(Debug, Clone)]
pub struct DiscoveredApp {
    pub id: String,
    pub name: String,
    pub source_peer: String,
    pub desired: u32,
    pub ready: u32,
}

/// Pod logs for one app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogBundle {
    pub pods: Vec<PodLogs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodLogs {
    pub name: String,
    pub lines: Vec<String>,
}

/// The cluster-API capability the executor depends on.
///
/// `apply` is create-or-replace keyed by the deployment name so re-submitting
/// the same id is idempotent. `resolve_service` returns the Service *name*
/// for an app; the tunnel composes the in-cluster DNS authority from it.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn apply(&self, app: &RemoteApp, namespace: &str) -> Result<(), BackendError>;
    async fn delete(&self, deploy_name: &str, namespace: &str) -> Result<(), BackendError>;
    async fn scale(
        &self,
        deploy_name: &str,
        namespace: &str,
        replicas: u32,
    ) -> Result<(), BackendError>;
    async fn status(
        &self,
        deploy_name: &str,
        namespace: &str,
    ) -> Result<DeploymentStatus, BackendError>;
    /// List deployments carrying [`APP_ID_LABEL`] — restart recovery.
    async fn list_apps(&self, namespace: &str) -> Result<Vec<DiscoveredApp>, BackendError>;
    async fn resolve_service(&self, app_id: &str, namespace: &str)
        -> Result<String, BackendError>;
    async fn pod_logs(
        &self,
        app_id: &str,
        namespace: &str,
        tail: u32,
        pod: Option<&str>,
    ) -> Result<LogBundle, BackendError>;
}

// ── Inbound submission ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReceivePayload {
    #[serde(default)]
    id: Option<String>,
    name: String,
    spec: WorkloadSpec,
}

/// `remoteapp/receive`: admission → approval queue or execute.
///
/// `peer_name` comes from the authenticated channel, never from the payload.
/// Resubmitting an id we already run is idempotent — the deployment is
/// re-applied and the old watcher cancelled.
pub async fn receive_app(
    agent: &Agent,
    peer_name: &str,
    payload: Value,
) -> Result<Value, AgentError> {
    let req: ReceivePayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    let settings = agent.settings.read().await.clone();

    let admission = {
        let remote = agent.remote_apps.read().await;
        let active: Vec<&RemoteApp> = remote
            .values()
            .filter(|a| Some(&a.id) != req.id.as_ref())
            .collect();
        check_admission(&req.spec, peer_name, &settings, &active)
    };
    if let Err(e) = admission {
        warn!(peer = %peer_name, app = %req.name, "workload rejected by policy: {e}");
        agent
            .notify(
                Level::Error,
                format!("Workload rejected from {peer_name}"),
                format!("'{}': {e}", req.name),
            )
            .await;
        return Err(AgentError::Admission(e.to_string()));
    }

    let app_id = req.id.unwrap_or_else(new_app_id);

    if settings.require_remoteapp_approval {
        agent.pending_approval.write().await.insert(
            app_id.clone(),
            PendingApproval {
                id: app_id.clone(),
                name: req.name.clone(),
                spec: req.spec,
                source_peer: peer_name.to_string(),
                since: chrono::Utc::now(),
            },
        );
        agent.persist_state().await;
        info!(app = %app_id, peer = %peer_name, "workload queued for approval");
        agent
            .notify(
                Level::Info,
                "Approval required",
                format!("'{}' from {peer_name} is waiting for your approval.", req.name),
            )
            .await;
        return Ok(serde_json::json!({"id": app_id, "status": "pending_approval"}));
    }

    let mut app = RemoteApp::new(req.name, req.spec, peer_name);
    app.id = app_id;
    info!(app = %app.id, name = %app.name, peer = %peer_name, "received workload");
    let snapshot = serde_json::to_value(&app).map_err(AgentError::payload)?;
    run_workload(agent, app).await;
    Ok(snapshot)
}

// ── Approval queue ────────────────────────────────────────────────────────────

/// Operator approved a parked submission: execute it under the same id.
pub async fn approve(agent: &Agent, app_id: &str) -> Result<(), AgentError> {
    let entry = agent
        .pending_approval
        .write()
        .await
        .remove(app_id)
        .ok_or(AgentError::AppNotFound)?;
    agent.persist_state().await;

    let mut app = RemoteApp::new(entry.name, entry.spec, entry.source_peer);
    app.id = entry.id;
    info!(app = %app.id, peer = %app.source_peer, "workload approved");
    run_workload(agent, app).await;
    Ok(())
}

/// Operator rejected a parked submission: drop it and tell the submitter.
pub async fn reject(agent: &Agent, app_id: &str) -> Result<(), AgentError> {
    let entry = agent
        .pending_approval
        .write()
        .await
        .remove(app_id)
        .ok_or(AgentError::AppNotFound)?;
    agent.persist_state().await;
    info!(app = %app_id, peer = %entry.source_peer, "workload rejected by operator");

    let ch = agent.channels.read().await.get(&entry.source_peer).cloned();
    if let Some(ch) = ch.filter(|ch| ch.is_connected()) {
        let _ = ch
            .call(
                "remoteapp/status",
                serde_json::json!({
                    "id": app_id,
                    "status": AppStatus::Rejected.to_string(),
                    "updated_at": chrono::Utc::now(),
                }),
                CALL_TIMEOUT,
            )
            .await;
    }
    Ok(())
}

// ── Execution and the readiness watcher ───────────────────────────────────────

/// Install the app in `remote_apps` and start the apply + watch task,
/// cancelling any watcher a previous deploy of the same id left running.
pub async fn run_workload(agent: &Agent, app: RemoteApp) {
    let token = CancellationToken::new();
    {
        let mut watchers = agent.watchers.lock().await;
        if let Some(old) = watchers.insert(app.id.clone(), token.clone()) {
            old.cancel();
        }
    }
    agent
        .remote_apps
        .write()
        .await
        .insert(app.id.clone(), app.clone());

    let agent = agent.clone();
    tokio::spawn(async move {
        execute(agent, app, token).await;
    });
}

async fn execute(agent: Agent, mut app: RemoteApp, token: CancellationToken) {
    report_status(&agent, &mut app, AppStatus::Creating, &token).await;

    if let Err(e) = agent.backend.apply(&app, &agent.config.namespace).await {
        warn!(app = %app.id, "apply failed: {e}");
        report_status(&agent, &mut app, AppStatus::Failed(e.to_string()), &token).await;
        release_watcher(&agent, &app.id, &token).await;
        return;
    }
    info!(app = %app.id, deploy = %deployment_name(&app.id, &app.name), "deployment applied");
    report_status(&agent, &mut app, AppStatus::Running, &token).await;

    let desired = app.spec.replicas;
    if let Some(outcome) = watch_ready(&agent, &app, desired, &token).await {
        report_status(&agent, &mut app, outcome, &token).await;
    }
    release_watcher(&agent, &app.id, &token).await;
}

/// Poll the backend until the deployment is ready, the attempts run out, or
/// the stop flag fires. `None` means cancelled — the superseding deploy owns
/// the status now.
async fn watch_ready(
    agent: &Agent,
    app: &RemoteApp,
    desired: u32,
    token: &CancellationToken,
) -> Option<AppStatus> {
    let deploy = deployment_name(&app.id, &app.name);
    for _ in 0..READY_POLL_ATTEMPTS {
        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
        }
        match agent.backend.status(&deploy, &agent.config.namespace).await {
            Ok(status) if status.ready >= desired => return Some(AppStatus::Ready),
            Ok(_) => {}
            Err(e) => warn!(app = %app.id, "error checking deployment status: {e}"),
        }
    }
    Some(AppStatus::Timeout)
}

/// Record a status transition and push it to the submitter.
///
/// Skipped entirely when the stop flag already fired: a superseded watcher
/// must never publish a stale status. The push wants an ack, so it is a call
/// with a short retry ladder; failure to deliver is logged, not fatal —
/// the submitter re-converges on the next successful report.
async fn report_status(
    agent: &Agent,
    app: &mut RemoteApp,
    status: AppStatus,
    token: &CancellationToken,
) {
    if token.is_cancelled() {
        return;
    }
    app.set_status(status.clone());
    info!(app = %app.id, name = %app.name, status = %status, "workload status");
    {
        let mut remote = agent.remote_apps.write().await;
        if let Some(entry) = remote.get_mut(&app.id) {
            entry.status = status.clone();
            entry.updated_at = app.updated_at;
        }
    }

    let payload = serde_json::json!({
        "id": &app.id,
        "status": status.to_string(),
        "updated_at": app.updated_at,
    });

    // Best-effort: no waiting for a channel that is not there. The submitter
    // re-converges from the last persisted status if a report is lost.
    let ch = agent.channels.read().await.get(&app.source_peer).cloned();
    let Some(ch) = ch.filter(|ch| ch.is_connected()) else {
        warn!(app = %app.id, peer = %app.source_peer, "no channel for status report");
        return;
    };
    for attempt in 0..=STATUS_RETRY_DELAYS.len() {
        match ch
            .call("remoteapp/status", payload.clone(), Duration::from_secs(5))
            .await
        {
            Ok(_) => return,
            Err(e) => {
                warn!(
                    app = %app.id,
                    attempt = attempt + 1,
                    "status report not acknowledged: {e}"
                );
                if let Some(seconds) = STATUS_RETRY_DELAYS.get(attempt) {
                    tokio::time::sleep(Duration::from_secs(*seconds)).await;
                }
            }
        }
    }
}

/// Drop the watcher-map entry, but only if it still belongs to this task.
async fn release_watcher(agent: &Agent, app_id: &str, token: &CancellationToken) {
    let mut watchers = agent.watchers.lock().await;
    if !token.is_cancelled() {
        watchers.remove(app_id);
    }
}

// ── Channel request handlers (executor side) ──────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdPayload {
    #[serde(default)]
    id: String,
}

/// `remoteapp/delete`.
pub async fn delete_remote(agent: &Agent, payload: Value) -> Result<Value, AgentError> {
    let req: IdPayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    let app = agent
        .remote_apps
        .write()
        .await
        .remove(&req.id)
        .ok_or(AgentError::AppNotFound)?;
    {
        let mut watchers = agent.watchers.lock().await;
        if let Some(token) = watchers.remove(&req.id) {
            token.cancel();
        }
    }
    let deploy = deployment_name(&app.id, &app.name);
    match agent.backend.delete(&deploy, &agent.config.namespace).await {
        Ok(()) | Err(BackendError::NotFound) => {}
        Err(e) => warn!(app = %req.id, "error deleting deployment: {e}"),
    }
    info!(app = %req.id, "deleted remote app");
    Ok(serde_json::json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct ScalePayload {
    id: String,
    replicas: u32,
}

/// `remoteapp/scale`.
pub async fn scale_remote(agent: &Agent, payload: Value) -> Result<Value, AgentError> {
    let req: ScalePayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    let deploy = {
        let remote = agent.remote_apps.read().await;
        let app = remote.get(&req.id).ok_or(AgentError::AppNotFound)?;
        deployment_name(&app.id, &app.name)
    };
    agent
        .backend
        .scale(&deploy, &agent.config.namespace, req.replicas)
        .await?;
    if let Some(app) = agent.remote_apps.write().await.get_mut(&req.id) {
        app.spec.replicas = req.replicas;
        app.updated_at = chrono::Utc::now();
    }
    info!(app = %req.id, replicas = req.replicas, "scaled remote app");
    Ok(serde_json::json!({"ok": true, "replicas": req.replicas}))
}

/// `remoteapp/detail`: live cluster state plus the spec we hold.
pub async fn detail_remote(agent: &Agent, payload: Value) -> Result<Value, AgentError> {
    let req: IdPayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    let app = agent
        .remote_apps
        .read()
        .await
        .get(&req.id)
        .cloned()
        .ok_or(AgentError::AppNotFound)?;
    let deploy = deployment_name(&app.id, &app.name);
    let status = agent.backend.status(&deploy, &agent.config.namespace).await;
    let mut detail = match status {
        Ok(status) => serde_json::to_value(status).map_err(AgentError::payload)?,
        Err(BackendError::NotFound) => serde_json::json!({"error": "deployment not found"}),
        Err(e) => return Err(e.into()),
    };
    detail["spec"] = serde_json::to_value(&app.spec).map_err(AgentError::payload)?;
    Ok(detail)
}

#[derive(Debug, Deserialize)]
struct LogsPayload {
    id: String,
    #[serde(default)]
    tail: Option<u32>,
    #[serde(default)]
    pod: Option<String>,
}

/// `remoteapp/logs`.
pub async fn logs_remote(agent: &Agent, payload: Value) -> Result<Value, AgentError> {
    let req: LogsPayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    if !agent.remote_apps.read().await.contains_key(&req.id) {
        return Err(AgentError::AppNotFound);
    }
    let tail = req.tail.unwrap_or(200);
    let pod = req.pod.as_deref().map(str::trim).filter(|p| !p.is_empty());
    let bundle = agent
        .backend
        .pod_logs(&req.id, &agent.config.namespace, tail, pod)
        .await?;
    serde_json::to_value(bundle).map_err(AgentError::payload)
}

#[derive(Debug, Deserialize)]
struct SpecUpdatePayload {
    id: String,
    spec: WorkloadSpec,
}

/// `remoteapp/spec-update`: admission-check the new spec, then re-deploy
/// under the same id (cancelling the old watcher).
pub async fn spec_update_remote(
    agent: &Agent,
    peer_name: &str,
    payload: Value,
) -> Result<Value, AgentError> {
    let req: SpecUpdatePayload = serde_json::from_value(payload).map_err(AgentError::payload)?;
    let mut app = agent
        .remote_apps
        .read()
        .await
        .get(&req.id)
        .cloned()
        .ok_or(AgentError::AppNotFound)?;

    let settings = agent.settings.read().await.clone();
    {
        let remote = agent.remote_apps.read().await;
        // The app being replaced does not count against the quotas.
        let active: Vec<&RemoteApp> = remote.values().filter(|a| a.id != req.id).collect();
        check_admission(&req.spec, peer_name, &settings, &active)
            .map_err(|e| AgentError::Admission(e.to_string()))?;
    }

    app.spec = req.spec;
    run_workload(agent, app).await;
    Ok(serde_json::json!({"ok": true}))
}

// ── Restart recovery ──────────────────────────────────────────────────────────

/// Rebuild `remote_apps` from the deployments the backend still runs, and
/// resume a lightweight readiness watcher for any that are not yet ready.
/// Nothing is re-applied.
pub async fn recover(agent: &Agent) {
    let discovered = match agent.backend.list_apps(&agent.config.namespace).await {
        Ok(list) => list,
        Err(e) => {
            warn!("could not reconstruct remote apps from the cluster: {e}");
            return;
        }
    };

    let mut restored = 0usize;
    for found in discovered {
        if agent.remote_apps.read().await.contains_key(&found.id) {
            continue;
        }
        let ready = found.ready >= found.desired;
        let mut spec = WorkloadSpec::from_image("");
        spec.replicas = found.desired;
        let mut app = RemoteApp::new(found.name, spec, found.source_peer);
        app.id = found.id.clone();
        app.status = if ready {
            AppStatus::Ready
        } else {
            AppStatus::Running
        };
        agent
            .remote_apps
            .write()
            .await
            .insert(app.id.clone(), app.clone());
        restored += 1;

        if !ready {
            let token = CancellationToken::new();
            agent
                .watchers
                .lock()
                .await
                .insert(app.id.clone(), token.clone());
            let agent = agent.clone();
            tokio::spawn(async move {
                let desired = app.spec.replicas;
                let mut app = app;
                if let Some(outcome) = watch_ready(&agent, &app, desired, &token).await {
                    report_status(&agent, &mut app, outcome, &token).await;
                }
                release_watcher(&agent, &app.id, &token).await;
            });
        }
    }
    if restored > 0 {
        info!(count = restored, "reconstructed remote apps from the cluster");
    }
}

// ── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemoryDeployment {
    app_id: String,
    app_name: String,
    source_peer: String,
    desired: u32,
    ready: u32,
}

/// Backend for development and tests: deployments are rows in a map.
///
/// With `auto_ready` (the default) an applied deployment reports all
/// replicas ready immediately; [`InMemoryBackend::manual`] keeps them at
/// zero until a test calls [`InMemoryBackend::set_ready`].
pub struct InMemoryBackend {
    deployments: std::sync::Mutex<HashMap<String, MemoryDeployment>>,
    auto_ready: bool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            deployments: std::sync::Mutex::new(HashMap::new()),
            auto_ready: true,
        }
    }

    pub fn manual() -> Self {
        Self {
            deployments: std::sync::Mutex::new(HashMap::new()),
            auto_ready: false,
        }
    }

    pub fn set_ready(&self, app_id: &str, ready: u32) {
        let mut map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        for deployment in map.values_mut() {
            if deployment.app_id == app_id {
                deployment.ready = ready;
            }
        }
    }

    pub fn deployment_count(&self) -> usize {
        self.deployments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn has_deployment(&self, deploy_name: &str) -> bool {
        self.deployments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(deploy_name)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorBackend for InMemoryBackend {
    async fn apply(&self, app: &RemoteApp, _namespace: &str) -> Result<(), BackendError> {
        let name = deployment_name(&app.id, &app.name);
        let mut map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            name,
            MemoryDeployment {
                app_id: app.id.clone(),
                app_name: app.name.clone(),
                source_peer: app.source_peer.clone(),
                desired: app.spec.replicas,
                ready: if self.auto_ready { app.spec.replicas } else { 0 },
            },
        );
        Ok(())
    }

    async fn delete(&self, deploy_name: &str, _namespace: &str) -> Result<(), BackendError> {
        self.deployments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(deploy_name)
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    async fn scale(
        &self,
        deploy_name: &str,
        _namespace: &str,
        replicas: u32,
    ) -> Result<(), BackendError> {
        let mut map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        let deployment = map.get_mut(deploy_name).ok_or(BackendError::NotFound)?;
        deployment.desired = replicas;
        if self.auto_ready {
            deployment.ready = replicas;
        }
        Ok(())
    }

    async fn status(
        &self,
        deploy_name: &str,
        _namespace: &str,
    ) -> Result<DeploymentStatus, BackendError> {
        let map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        let deployment = map.get(deploy_name).ok_or(BackendError::NotFound)?;
        let pods = (0..deployment.desired)
            .map(|i| PodInfo {
                name: format!("{deploy_name}-{i}"),
                phase: "Running".to_string(),
                ready: i < deployment.ready,
                restarts: 0,
                node: "local".to_string(),
            })
            .collect();
        Ok(DeploymentStatus {
            deploy_name: deploy_name.to_string(),
            desired: deployment.desired,
            ready: deployment.ready,
            available: deployment.ready,
            updated: deployment.desired,
            pods,
        })
    }

    async fn list_apps(&self, _namespace: &str) -> Result<Vec<DiscoveredApp>, BackendError> {
        let map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .values()
            .map(|d| DiscoveredApp {
                id: d.app_id.clone(),
                name: d.app_name.clone(),
                source_peer: d.source_peer.clone(),
                desired: d.desired,
                ready: d.ready,
            })
            .collect())
    }

    async fn resolve_service(
        &self,
        app_id: &str,
        _namespace: &str,
    ) -> Result<String, BackendError> {
        let map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        map.values()
            .find(|d| d.app_id == app_id)
            .map(|d| format!("ra-{}", d.app_id))
            .ok_or(BackendError::NotFound)
    }

    async fn pod_logs(
        &self,
        app_id: &str,
        _namespace: &str,
        _tail: u32,
        pod: Option<&str>,
    ) -> Result<LogBundle, BackendError> {
        let map = self.deployments.lock().unwrap_or_else(|e| e.into_inner());
        let deployment = map
            .values()
            .find(|d| d.app_id == app_id)
            .ok_or(BackendError::NotFound)?;
        let deploy_name = deployment_name(&deployment.app_id, &deployment.app_name);
        let pods = (0..deployment.desired)
            .map(|i| format!("{deploy_name}-{i}"))
            .filter(|name| pod.map(|p| p == name).unwrap_or(true))
            .map(|name| PodLogs {
                name,
                lines: Vec::new(),
            })
            .collect();
        Ok(LogBundle { pods })
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_is_truncated_to_63() {
        let long = "a".repeat(100);
        let name = deployment_name("12345678", &long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("ra-12345678-"));
    }

    #[test]
    fn deployment_name_embeds_id_and_name() {
        assert_eq!(deployment_name("cafe0123", "nginx"), "ra-cafe0123-nginx");
    }

    #[tokio::test]
    async fn in_memory_backend_apply_is_idempotent() {
        let backend = InMemoryBackend::new();
        let app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "alice");
        backend.apply(&app, "porpulsion").await.unwrap();
        backend.apply(&app, "porpulsion").await.unwrap();
        assert_eq!(backend.deployment_count(), 1);
    }

    #[tokio::test]
    async fn in_memory_backend_reports_ready() {
        let backend = InMemoryBackend::new();
        let mut app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "alice");
        app.spec.replicas = 3;
        backend.apply(&app, "ns").await.unwrap();
        let status = backend
            .status(&deployment_name(&app.id, "web"), "ns")
            .await
            .unwrap();
        assert_eq!(status.desired, 3);
        assert_eq!(status.ready, 3);
        assert_eq!(status.pods.len(), 3);
    }

    #[tokio::test]
    async fn manual_backend_stays_unready_until_told() {
        let backend = InMemoryBackend::manual();
        let app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "alice");
        backend.apply(&app, "ns").await.unwrap();
        let deploy = deployment_name(&app.id, "web");
        assert_eq!(backend.status(&deploy, "ns").await.unwrap().ready, 0);
        backend.set_ready(&app.id, 1);
        assert_eq!(backend.status(&deploy, "ns").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn service_resolution_requires_a_deployment() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.resolve_service("nope", "ns").await,
            Err(BackendError::NotFound)
        ));
        let app = RemoteApp::new("web", WorkloadSpec::from_image("nginx"), "alice");
        backend.apply(&app, "ns").await.unwrap();
        let service = backend.resolve_service(&app.id, "ns").await.unwrap();
        assert_eq!(service, format!("ra-{}", app.id));
    }
}
