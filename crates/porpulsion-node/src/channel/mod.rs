// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Persistent channels between peers.
//!
//! After the peering handshake completes, both sides attempt an outbound
//! WebSocket connect to the other's `/ws` endpoint; whichever connection
//! completes first wins and an inbound connection always replaces whatever
//! channel is currently installed. The replaced channel's pending RPCs fail
//! with "channel replaced". This rule is symmetric and leaves exactly one
//! channel per pair regardless of which side restarted.
//!
//! Each channel runs a dedicated writer task (owns the socket sink,
//! serialises sends, emits the 20 s keepalive ping) and a reader task
//! (dispatches inbound frames). RPC handlers are spawned off the reader so a
//! slow handler never stalls the wire.
//!
//! Reconnect backoff walks 2, 4, 8, 16, 30 s; after the ramp is exhausted a
//! one-shot "channel unreachable" notification is raised and retries
//! continue at the longest interval until the peer is removed.
//!
//! The outbound connect does not verify the server certificate — before the
//! first frame no trust anchor has been agreed, and afterwards the channel
//! is authenticated by the CA-fingerprint header check on the accepting
//! side. See `peering` for the full trust discussion.

pub mod frame;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use porpulsion_model::Peer;

use crate::error::AgentError;
use crate::notify::Level;
use crate::state::Agent;
use frame::Frame;

/// Seconds between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Reconnect backoff steps in seconds.
const RECONNECT_DELAY: [u64; 5] = [2, 4, 8, 16, 30];

/// WebSocket handshake deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long route handlers wait for a channel to come up before failing.
pub const CHANNEL_WAIT: Duration = Duration::from_secs(8);

/// Default RPC timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = HashMap<String, oneshot::Sender<Result<Frame, String>>>;

/// One live connection to a peer.
///
/// Cheap to clone behind an `Arc`; senders go through the writer task so
/// frame order on the wire matches call order.
pub struct PeerChannel {
    pub peer_name: String,
    pub peer_url: String,
    max_frame_bytes: usize,
    outbound: mpsc::Sender<String>,
    pending: std::sync::Mutex<PendingMap>,
    /// Cancelled exactly once, when the connection is gone (either direction
    /// failed, or the channel was replaced).
    pub closed: CancellationToken,
    peer_version: std::sync::Mutex<String>,
}

impl PeerChannel {
    fn new(
        peer_name: String,
        peer_url: String,
        max_frame_bytes: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                peer_name,
                peer_url,
                max_frame_bytes,
                outbound: tx,
                pending: std::sync::Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
                peer_version: std::sync::Mutex::new(String::new()),
            }),
            rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Send a request and wait up to `timeout` for the reply payload.
    ///
    /// A missing reply (timeout or channel loss) is a transport error — the
    /// caller cannot know whether the peer acted on the request.
    pub async fn call(
        &self,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        if let Err(e) = self
            .send_frame(&Frame::request(id.as_str(), kind, payload))
            .await
        {
            self.forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.forget(&id);
                Err(AgentError::Timeout(kind.to_string()))
            }
            Ok(Err(_)) => Err(AgentError::Transport(format!(
                "channel to {} closed",
                self.peer_name
            ))),
            Ok(Ok(Err(reason))) => Err(AgentError::Transport(reason)),
            Ok(Ok(Ok(reply))) => {
                if reply.ok.unwrap_or(false) {
                    Ok(reply.payload)
                } else {
                    Err(AgentError::Peer(
                        reply.error.unwrap_or_else(|| "peer error".to_string()),
                    ))
                }
            }
        }
    }

    /// Fire-and-forget message, no reply expected.
    pub async fn push(&self, kind: &str, payload: Value) -> Result<(), AgentError> {
        self.send_frame(&Frame::push(kind, payload)).await
    }

    pub fn peer_version(&self) -> String {
        self.peer_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), AgentError> {
        let text = serde_json::to_string(frame).map_err(AgentError::payload)?;
        if text.len() > self.max_frame_bytes {
            return Err(AgentError::FrameTooLarge {
                size: text.len(),
                limit: self.max_frame_bytes,
            });
        }
        if self.closed.is_cancelled() {
            return Err(AgentError::NoChannel(self.peer_name.clone()));
        }
        self.outbound
            .send(text)
            .await
            .map_err(|_| AgentError::Transport(format!("channel to {} closed", self.peer_name)))
    }

    /// Tear the channel down, failing every in-flight call with `reason`.
    pub fn close(&self, reason: &str) {
        self.closed.cancel();
        let pending: PendingMap = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (_, tx) in pending {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    /// Route a reply to its pending call. Returns false when the id is not
    /// ours (then it is an inbound request that happens to carry an id).
    fn complete_if_pending(&self, id: &str, frame: Frame) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

// ── Channel map management ────────────────────────────────────────────────────

/// Install a new channel for its peer, replacing (and failing) any old one.
async fn install(agent: &Agent, channel: Arc<PeerChannel>) {
    let old = agent
        .channels
        .write()
        .await
        .insert(channel.peer_name.clone(), channel.clone());
    if let Some(old) = old {
        debug!(peer = %channel.peer_name, "replacing existing channel");
        old.close("channel replaced");
    }
}

/// Remove the channel from the map iff it is still the installed one, then
/// close it.
async fn finish(agent: &Agent, channel: &Arc<PeerChannel>) {
    channel.close("connection closed");
    let mut channels = agent.channels.write().await;
    if let Some(current) = channels.get(&channel.peer_name) {
        if Arc::ptr_eq(current, channel) {
            channels.remove(&channel.peer_name);
        }
    }
}

/// Live channel to a peer, waiting up to `wait` for one to come up. Covers
/// the race between peering completing and the first call being made.
pub async fn channel_to(
    agent: &Agent,
    peer_name: &str,
    wait: Duration,
) -> Result<Arc<PeerChannel>, AgentError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(ch) = agent.channels.read().await.get(peer_name).cloned() {
            if ch.is_connected() {
                return Ok(ch);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(AgentError::NoChannel(peer_name.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Close a peer's channel, pushing a best-effort `peer/disconnect` first.
pub async fn close_peer_channel(agent: &Agent, peer_name: &str) {
    let channel = agent.channels.write().await.remove(peer_name);
    if let Some(channel) = channel {
        let _ = channel
            .push(
                frame::PEER_DISCONNECT,
                serde_json::json!({"name": &agent.config.name}),
            )
            .await;
        channel.close("peer removed");
    }
}

// ── Maintenance (outbound side) ───────────────────────────────────────────────

/// Start maintenance loops for every peer currently in the registry.
pub async fn spawn_all_maintain(agent: &Agent) {
    let names: Vec<String> = agent.peers.read().await.keys().cloned().collect();
    for name in names {
        spawn_maintain(agent, &name);
    }
}

/// Start (at most) one maintenance loop for a peer.
pub fn spawn_maintain(agent: &Agent, peer_name: &str) {
    {
        let mut maintained = agent
            .maintained
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !maintained.insert(peer_name.to_string()) {
            return;
        }
    }
    let agent = agent.clone();
    let peer_name = peer_name.to_string();
    tokio::spawn(async move {
        maintain_loop(&agent, &peer_name).await;
        agent
            .maintained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer_name);
    });
}

async fn maintain_loop(agent: &Agent, peer_name: &str) {
    let mut attempt: usize = 0;
    let mut notified_failure = false;
    loop {
        let Some(peer) = agent.peers.read().await.get(peer_name).cloned() else {
            debug!(peer = %peer_name, "peer removed — stopping channel maintenance");
            return;
        };

        // The peer may already have connected to us; park until that channel
        // dies before competing for ownership again.
        let existing = agent.channels.read().await.get(peer_name).cloned();
        if let Some(ch) = existing {
            if ch.is_connected() {
                ch.closed.cancelled().await;
                attempt = 0;
                notified_failure = false;
                continue;
            }
        }

        match connect_and_run(agent, &peer).await {
            Ok(()) => {
                notified_failure = false;
                let delay = RECONNECT_DELAY[0];
                info!(peer = %peer_name, "channel dropped — reconnecting in {delay}s");
                attempt = 1;
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            Err(e) => {
                let delay = RECONNECT_DELAY[attempt.min(RECONNECT_DELAY.len() - 1)];
                warn!(peer = %peer_name, "channel connect failed ({e}) — retrying in {delay}s");
                attempt += 1;
                if attempt == RECONNECT_DELAY.len() && !notified_failure {
                    notified_failure = true;
                    agent
                        .notify(
                            Level::Error,
                            format!("Channel unreachable: {peer_name}"),
                            format!(
                                "Lost connection to '{peer_name}' and repeated reconnects are failing. Will keep retrying."
                            ),
                        )
                        .await;
                }
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

/// One outbound connection lifetime: connect, install, serve until closed.
///
/// `Err` means the connect itself failed (feeds the backoff); `Ok(())` means
/// the connection was established and later dropped.
async fn connect_and_run(agent: &Agent, peer: &Peer) -> Result<(), AgentError> {
    use base64::Engine;
    use tungstenite::client::IntoClientRequest;

    let ws_url = ws_url_for(&peer.url);
    let mut request = ws_url
        .clone()
        .into_client_request()
        .map_err(|e| AgentError::Transport(format!("bad channel url {ws_url}: {e}")))?;
    let ca_b64 =
        base64::engine::general_purpose::STANDARD.encode(agent.identity.ca_cert_pem.as_bytes());
    request.headers_mut().insert(
        "X-Agent-Name",
        agent
            .config
            .name
            .parse()
            .map_err(|_| AgentError::Transport("agent name is not header-safe".into()))?,
    );
    request.headers_mut().insert(
        "X-Agent-Ca",
        ca_b64
            .parse()
            .map_err(|_| AgentError::Transport("CA PEM is not header-safe".into()))?,
    );

    let connector =
        tokio_tungstenite::Connector::Rustls(Arc::new(insecure_client_config()?));
    let connect = tokio_tungstenite::connect_async_tls_with_config(
        request,
        None,
        false,
        Some(connector),
    );
    let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| AgentError::Transport("websocket handshake timed out".into()))?
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    let (sink, read) = stream.split();
    let (channel, outbound_rx) = PeerChannel::new(
        peer.name.clone(),
        peer.url.clone(),
        agent.config.max_frame_bytes,
    );
    install(agent, channel.clone()).await;
    tokio::spawn(run_writer_ws(sink, outbound_rx, channel.closed.clone()));

    info!(peer = %peer.name, "channel connected");
    announce_version(agent, &channel).await;

    run_reader_ws(agent.clone(), channel.clone(), read).await;
    finish(agent, &channel).await;
    Ok(())
}

fn ws_url_for(peer_url: &str) -> String {
    let url = peer_url
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    format!("{}/ws", url.trim_end_matches('/'))
}

async fn announce_version(agent: &Agent, channel: &Arc<PeerChannel>) {
    let _ = channel
        .push(
            frame::VERSION_ANNOUNCE,
            serde_json::json!({"version": &agent.version_hash}),
        )
        .await;
}

// ── Inbound (server side) ─────────────────────────────────────────────────────

/// Serve an authenticated inbound socket until it closes.
///
/// Called by the `/ws` upgrade handler after the CA fingerprint check. The
/// new channel replaces any existing one for this peer (dual-ownership
/// reconciliation).
pub async fn accept_inbound(agent: Agent, peer_name: String, socket: axum::extract::ws::WebSocket) {
    let peer_url = agent
        .peers
        .read()
        .await
        .get(&peer_name)
        .map(|p| p.url.clone())
        .unwrap_or_default();

    let (channel, outbound_rx) =
        PeerChannel::new(peer_name.clone(), peer_url, agent.config.max_frame_bytes);
    install(&agent, channel.clone()).await;

    let (sink, read) = socket.split();
    tokio::spawn(run_writer_axum(sink, outbound_rx, channel.closed.clone()));

    info!(peer = %peer_name, "inbound channel accepted");
    announce_version(&agent, &channel).await;

    run_reader_axum(agent.clone(), channel.clone(), read).await;
    finish(&agent, &channel).await;
    info!(peer = %peer_name, "inbound channel closed");
}

// ── Reader / writer tasks ─────────────────────────────────────────────────────

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn run_writer_ws(
    mut sink: futures::stream::SplitSink<WsStream, tungstenite::Message>,
    mut rx: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = sink.send(tungstenite::Message::Close(None)).await;
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(text) => {
                    if sink.send(tungstenite::Message::Text(text)).await.is_err() {
                        closed.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                let text = ping_frame();
                if sink.send(tungstenite::Message::Text(text)).await.is_err() {
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn run_reader_ws(
    agent: Agent,
    channel: Arc<PeerChannel>,
    mut read: futures::stream::SplitStream<WsStream>,
) {
    loop {
        tokio::select! {
            _ = channel.closed.cancelled() => break,
            msg = read.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    dispatch(&agent, &channel, text).await;
                }
                Some(Ok(tungstenite::Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer = %channel.peer_name, "channel recv error: {e}");
                    break;
                }
            }
        }
    }
}

async fn run_writer_axum(
    mut sink: futures::stream::SplitSink<
        axum::extract::ws::WebSocket,
        axum::extract::ws::Message,
    >,
    mut rx: mpsc::Receiver<String>,
    closed: CancellationToken,
) {
    use axum::extract::ws::Message;
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        closed.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Text(ping_frame())).await.is_err() {
                    closed.cancel();
                    break;
                }
            }
        }
    }
}

async fn run_reader_axum(
    agent: Agent,
    channel: Arc<PeerChannel>,
    mut read: futures::stream::SplitStream<axum::extract::ws::WebSocket>,
) {
    use axum::extract::ws::Message;
    loop {
        tokio::select! {
            _ = channel.closed.cancelled() => break,
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&agent, &channel, text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer = %channel.peer_name, "channel recv error: {e}");
                    break;
                }
            }
        }
    }
}

fn ping_frame() -> String {
    // Built by hand so the keepalive never depends on serde succeeding.
    r#"{"type":"ping","payload":{}}"#.to_string()
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Route one inbound text frame: reply → pending call, request → handler
/// (spawned, replies with the same id), push → push handler.
async fn dispatch(agent: &Agent, channel: &Arc<PeerChannel>, text: String) {
    if text.len() > channel.max_frame_bytes {
        warn!(
            peer = %channel.peer_name,
            size = text.len(),
            "dropping oversized frame"
        );
        return;
    }
    let frame: Frame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(_) => {
            warn!(peer = %channel.peer_name, "bad JSON frame — dropped");
            return;
        }
    };

    if let Some(id) = frame.id.clone() {
        // Reply to one of our pending requests?
        if channel.complete_if_pending(&id, frame.clone()) {
            return;
        }

        // Inbound request — run the handler off the reader task so slow
        // handlers never block the wire, and reply with the same id.
        let agent = agent.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let reply = match handlers::handle_request(
                &agent,
                &channel.peer_name,
                &frame.kind,
                frame.payload,
            )
            .await
            {
                Ok(payload) => Frame::reply_ok(id.as_str(), payload),
                Err(e) => {
                    warn!(peer = %channel.peer_name, kind = %frame.kind, "handler failed: {e}");
                    Frame::reply_err(id.as_str(), e.to_string())
                }
            };
            let _ = channel.send_frame(&reply).await;
        });
        return;
    }

    // Fire-and-forget push.
    match frame.kind.as_str() {
        frame::PING => {}
        frame::VERSION_ANNOUNCE => {
            let peer_version = frame.payload["version"].as_str().unwrap_or("").to_string();
            *channel
                .peer_version
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = peer_version.clone();
            if !peer_version.is_empty() && peer_version != agent.version_hash {
                warn!(
                    peer = %channel.peer_name,
                    local = %&agent.version_hash[..8.min(agent.version_hash.len())],
                    remote = %&peer_version[..8.min(peer_version.len())],
                    "version mismatch with peer"
                );
                agent
                    .notify(
                        Level::Warn,
                        format!("Version mismatch with {}", channel.peer_name),
                        format!(
                            "Local: {}  {}: {}. Some features may not work correctly.",
                            &agent.version_hash[..8.min(agent.version_hash.len())],
                            channel.peer_name,
                            &peer_version[..8.min(peer_version.len())],
                        ),
                    )
                    .await;
            }
        }
        _ => handlers::handle_push(agent, &channel.peer_name, &frame.kind, frame.payload).await,
    }
}

// ── Bootstrap TLS for the outbound connect ────────────────────────────────────

/// Client TLS config that accepts any server certificate.
///
/// The channel's authentication is the CA-fingerprint exchange performed by
/// the accepting side, not the transport certificate; in production
/// deployments the `/ws` endpoint usually sits behind an ingress with a real
/// certificate anyway.
fn insecure_client_config() -> Result<rustls::ClientConfig, AgentError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| AgentError::Transport(format!("tls config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_rewrites_scheme_and_appends_ws() {
        assert_eq!(ws_url_for("https://10.0.0.2:8443"), "wss://10.0.0.2:8443/ws");
        assert_eq!(ws_url_for("http://10.0.0.2:8443/"), "ws://10.0.0.2:8443/ws");
    }

    #[test]
    fn ping_frame_is_valid_json() {
        let frame: Frame = serde_json::from_str(&ping_frame()).unwrap();
        assert_eq!(frame.kind, "ping");
        assert!(frame.id.is_none());
    }

    #[tokio::test]
    async fn close_fails_pending_calls_with_reason() {
        let (channel, mut rx) = PeerChannel::new("peer".into(), "".into(), 1024 * 1024);
        // Start a call on a background task; it parks waiting for a reply.
        let ch = channel.clone();
        let call = tokio::spawn(async move {
            ch.call("remoteapp/detail", serde_json::json!({}), Duration::from_secs(5))
                .await
        });
        // Wait until the request frame reaches the writer queue.
        let _ = rx.recv().await;
        channel.close("channel replaced");
        let err = call.await.unwrap().unwrap_err();
        match err {
            AgentError::Transport(reason) => assert_eq!(reason, "channel replaced"),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_reply_surfaces_peer_message() {
        let (channel, mut rx) = PeerChannel::new("peer".into(), "".into(), 1024 * 1024);
        let ch = channel.clone();
        let call = tokio::spawn(async move {
            ch.call("remoteapp/receive", serde_json::json!({}), Duration::from_secs(5))
                .await
        });
        let sent = rx.recv().await.unwrap();
        let frame: Frame = serde_json::from_str(&sent).unwrap();
        let id = frame.id.unwrap();
        assert!(channel.complete_if_pending(
            &id,
            Frame::reply_err(id.as_str(), "inbound workloads are disabled on this agent")
        ));
        let err = call.await.unwrap().unwrap_err();
        match err {
            AgentError::Peer(msg) => {
                assert_eq!(msg, "inbound workloads are disabled on this agent")
            }
            other => panic!("expected peer error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_outbound_frame_is_rejected() {
        let (channel, _rx) = PeerChannel::new("peer".into(), "".into(), 64);
        let big = "x".repeat(256);
        let err = channel
            .push("remoteapp/status", serde_json::json!({"blob": big}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn reply_routing_is_by_id() {
        let (channel, mut rx) = PeerChannel::new("peer".into(), "".into(), 1024 * 1024);
        let ch = channel.clone();
        let call = tokio::spawn(async move {
            ch.call("remoteapp/scale", serde_json::json!({"replicas": 2}), Duration::from_secs(5))
                .await
        });
        let sent = rx.recv().await.unwrap();
        let id = serde_json::from_str::<Frame>(&sent).unwrap().id.unwrap();
        // A reply with a different id is not ours.
        assert!(!channel.complete_if_pending("unrelated", Frame::reply_ok("unrelated", Value::Null)));
        assert!(channel.complete_if_pending(
            &id,
            Frame::reply_ok(id.as_str(), serde_json::json!({"ok": true}))
        ));
        let payload = call.await.unwrap().unwrap();
        assert_eq!(payload["ok"], true);
    }
}
