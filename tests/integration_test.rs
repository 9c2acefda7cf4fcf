// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests for the agent core using the in-memory executor
/// backend: admission, the approval gate, the readiness watcher, invite
/// token single use, and tunnel policy.
use std::sync::Arc;
use std::time::Duration;

use porpulsion_model::AppStatus;
use porpulsion_node::config::AgentConfig;
use porpulsion_node::executor::{self, deployment_name, InMemoryBackend};
use porpulsion_node::peering::{self, PeerHello};
use porpulsion_node::state::{Agent, AgentCore};
use porpulsion_node::store::FileStore;
use porpulsion_node::{tunnel, AgentError};

async fn test_agent(dir: &std::path::Path, backend: Arc<InMemoryBackend>) -> Agent {
    let config = AgentConfig {
        name: "eu-west".into(),
        namespace: "porpulsion".into(),
        self_url: "https://127.0.0.1:8443".into(),
        self_ip: "127.0.0.1".into(),
        operator_bind: "127.0.0.1:0".parse().unwrap(),
        peer_bind: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.to_path_buf(),
        max_frame_bytes: 4 * 1024 * 1024,
    };
    let store = Arc::new(FileStore::open(dir).unwrap());
    AgentCore::bootstrap(config, store, backend).await.unwrap()
}

fn receive_payload(id: &str, name: &str, image: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "spec": {"image": image, "replicas": 1},
        "source_peer": "us-east",
    })
}

async fn wait_for_status(agent: &Agent, id: &str, wanted: &AppStatus) -> bool {
    for _ in 0..100 {
        if agent
            .remote_apps
            .read()
            .await
            .get(id)
            .map(|a| &a.status == wanted)
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

// ── Executor flow ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn received_workload_reaches_ready_and_labels_survive() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let agent = test_agent(dir.path(), backend.clone()).await;

    let reply = executor::receive_app(&agent, "us-east", receive_payload("cafe0001", "web", "nginx:1.25"))
        .await
        .unwrap();
    assert_eq!(reply["id"], "cafe0001");

    assert!(
        wait_for_status(&agent, "cafe0001", &AppStatus::Ready).await,
        "app must reach Ready with an auto-ready backend"
    );
    assert!(backend.has_deployment(&deployment_name("cafe0001", "web")));
}

#[tokio::test]
async fn admission_rejection_creates_no_deployment() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let agent = test_agent(dir.path(), backend.clone()).await;
    agent.settings.write().await.blocked_images = "nginx".into();

    let err = executor::receive_app(&agent, "us-east", receive_payload("cafe0002", "web", "nginx:1.25"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Admission(_)));
    assert!(err.to_string().contains("blocked"));
    assert_eq!(backend.deployment_count(), 0);
    assert!(agent.remote_apps.read().await.is_empty());
    // Rejections surface as a notification on the executor side.
    assert!(!agent.notifications.lock().await.is_empty());
}

#[tokio::test]
async fn quota_rejection_names_the_configured_limit() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let agent = test_agent(dir.path(), backend.clone()).await;
    agent.settings.write().await.max_cpu_request_per_pod = "500m".into();

    let payload = serde_json::json!({
        "id": "cafe0003",
        "name": "big",
        "spec": {"image": "nginx", "resources": {"requests": {"cpu": "1", "memory": "64Mi"}}},
    });
    let err = executor::receive_app(&agent, "us-east", payload)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500m"), "got: {err}");
    assert_eq!(backend.deployment_count(), 0);
}

// ── Approval gate ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn approval_mode_parks_then_executes_under_same_id() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::new());
    let agent = test_agent(dir.path(), backend.clone()).await;
    agent.settings.write().await.require_remoteapp_approval = true;

    let reply = executor::receive_app(&agent, "us-east", receive_payload("cafe0004", "web", "nginx"))
        .await
        .unwrap();
    assert_eq!(reply["status"], "pending_approval");

    // Parked and executing are mutually exclusive for the same id.
    assert!(agent.pending_approval.read().await.contains_key("cafe0004"));
    assert!(!agent.remote_apps.read().await.contains_key("cafe0004"));
    assert_eq!(backend.deployment_count(), 0);

    executor::approve(&agent, "cafe0004").await.unwrap();
    assert!(!agent.pending_approval.read().await.contains_key("cafe0004"));
    assert!(wait_for_status(&agent, "cafe0004", &AppStatus::Ready).await);
    assert!(backend.has_deployment(&deployment_name("cafe0004", "web")));
}

#[tokio::test]
async fn rejecting_an_unknown_approval_is_a_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;
    let err = executor::reject(&agent, "missing").await.unwrap_err();
    assert!(matches!(err, AgentError::AppNotFound));
}

// ── Readiness watcher ─────────────────────────────────────────────────────────

#[tokio::test]
async fn redeploy_cancels_the_previous_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(InMemoryBackend::manual());
    let agent = test_agent(dir.path(), backend.clone()).await;

    // First deploy: stays unready, watcher polling.
    executor::receive_app(&agent, "us-east", receive_payload("cafe0005", "web", "nginx:1"))
        .await
        .unwrap();
    assert!(wait_for_status(&agent, "cafe0005", &AppStatus::Running).await);

    // Re-deploy the same id — the first watcher must be superseded.
    executor::receive_app(&agent, "us-east", receive_payload("cafe0005", "web", "nginx:2"))
        .await
        .unwrap();

    // Let the second apply land (it resets readiness) before marking ready.
    tokio::time::sleep(Duration::from_secs(1)).await;
    backend.set_ready("cafe0005", 1);
    assert!(
        wait_for_status(&agent, "cafe0005", &AppStatus::Ready).await,
        "only the newer watcher reports the final status"
    );
    // Exactly one watcher slot remains at most; the superseded one must not
    // have left a stale terminal status behind.
    let status = agent
        .remote_apps
        .read()
        .await
        .get("cafe0005")
        .unwrap()
        .status
        .clone();
    assert_eq!(status, AppStatus::Ready);
}

// ── Invite token single use ───────────────────────────────────────────────────

#[tokio::test]
async fn invite_token_is_single_use() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;
    let token = agent.invite_token.read().await.clone();

    let hello = PeerHello {
        name: "us-east".into(),
        url: "https://10.0.0.1:8443".into(),
        ca: "-----BEGIN CERTIFICATE-----\nfake\n-----END CERTIFICATE-----".into(),
    };

    let reply = peering::handle_peer_post(&agent, Some(&token), hello.clone())
        .await
        .unwrap();
    assert_eq!(reply.status, "pending");
    assert_eq!(agent.pending_inbound.read().await.len(), 1);
    assert_ne!(*agent.invite_token.read().await, token, "token must rotate");

    // Replaying the consumed token is rejected and state is unchanged.
    let err = peering::handle_peer_post(&agent, Some(&token), hello)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidToken));
    assert_eq!(agent.pending_inbound.read().await.len(), 1);
}

#[tokio::test]
async fn confirmation_with_mismatched_ca_is_rejected() {
    use porpulsion_model::PendingOutbound;

    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;

    // An awaiting outbound entry pinned to a different CA than the one the
    // confirmation presents. The entry's own CA comes from a second agent.
    let other_dir = tempfile::tempdir().unwrap();
    let other = test_agent(other_dir.path(), Arc::new(InMemoryBackend::new())).await;
    let mut entry = PendingOutbound::new(
        "https://10.0.0.9:8443",
        porpulsion_node::identity::fingerprint(&other.identity.ca_cert_pem).unwrap(),
    );
    entry.status = porpulsion_model::PendingOutboundStatus::AwaitingConfirmation;
    entry.peer_ca = Some(other.identity.ca_cert_pem.clone());
    agent
        .pending_outbound
        .write()
        .await
        .insert(entry.url.clone(), entry);

    // Same URL, different CA — must not be promoted.
    let hello = PeerHello {
        name: "mitm".into(),
        url: "https://10.0.0.9:8443".into(),
        ca: agent.identity.ca_cert_pem.clone(),
    };
    let err = peering::handle_peer_post(&agent, None, hello)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoPendingOutbound));
    assert!(agent.peers.read().await.is_empty());
    // The pending entry survives for a legitimate confirmation.
    assert_eq!(agent.pending_outbound.read().await.len(), 1);
}

#[tokio::test]
async fn confirmation_without_pending_entry_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;
    // A valid CA but no awaiting outbound entry → 403-class error.
    let hello = PeerHello {
        name: "stranger".into(),
        url: "https://10.9.9.9:8443".into(),
        ca: agent.identity.ca_cert_pem.clone(),
    };
    let err = peering::handle_peer_post(&agent, None, hello)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NoPendingOutbound));
    assert!(agent.peers.read().await.is_empty());
}

// ── Tunnel policy ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn tunnel_gates_run_before_any_proxying() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;

    let payload = serde_json::json!({
        "app_id": "cafe0006", "port": 8080, "method": "GET", "path": "hello",
    });

    // Inbound tunnels disabled beats everything.
    agent.settings.write().await.allow_inbound_tunnels = false;
    let err = tunnel::handle_proxy_request(&agent, "us-east", payload.clone())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("disabled"));

    // Enabled but empty allowlist: deny-all.
    agent.settings.write().await.allow_inbound_tunnels = true;
    let err = tunnel::handle_proxy_request(&agent, "us-east", payload.clone())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no tunnel peers"));

    // Allowlisted peer but the app does not exist here.
    agent.settings.write().await.allowed_tunnel_peers = "us-east".into();
    let err = tunnel::handle_proxy_request(&agent, "us-east", payload)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::AppNotFound));
}

// ── Unknown frame type ────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_request_type_is_reported_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(dir.path(), Arc::new(InMemoryBackend::new())).await;
    let err = porpulsion_node::channel::handlers::handle_request(
        &agent,
        "us-east",
        "remoteapp/freeze",
        serde_json::json!({}),
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_string(), "unknown type: remoteapp/freeze");
}
