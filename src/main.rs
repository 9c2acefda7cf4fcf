// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use porpulsion_node::config::AgentConfig;
use porpulsion_node::executor::InMemoryBackend;
use porpulsion_node::store::{CredentialsDoc, FileStore, KeyValueStore, CREDENTIALS_KEY};
use porpulsion_node::{channel, executor, http, AgentCore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Token { data_dir }) => print_token(data_dir).await,
        Some(Commands::Start {
            operator_bind,
            peer_bind,
            data_dir,
        }) => start(operator_bind, peer_bind, data_dir).await,
        None => start(None, None, None).await,
    }
}

async fn start(
    operator_bind: Option<SocketAddr>,
    peer_bind: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = AgentConfig::from_env(operator_bind, peer_bind, data_dir);
    info!(agent = %config.name, self_url = %config.self_url, "starting agent");

    let store = open_store(&config)?;
    let backend = Arc::new(InMemoryBackend::new());
    let agent = AgentCore::bootstrap(config, store, backend)
        .await
        .context("agent bootstrap failed")?;

    let peer_count = agent.peers.read().await.len();
    info!(
        fingerprint = %agent.identity.fingerprint,
        peers = peer_count,
        "agent identity ready"
    );

    // Rediscover workloads that survived a restart, then reconnect peers.
    executor::recover(&agent).await;
    channel::spawn_all_maintain(&agent).await;

    http::serve(agent).await
}

/// Open the durable store, degrading to a temp directory before giving up.
/// Unrecoverable only when neither the configured directory nor local temp
/// is writable.
fn open_store(config: &AgentConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    match FileStore::open(&config.data_dir) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            warn!(
                dir = %config.data_dir.display(),
                "data directory unavailable ({e:#}) — falling back to temp storage"
            );
            let fallback = std::env::temp_dir().join("porpulsion");
            let store = FileStore::open(&fallback)
                .context("no writable location for agent state")?;
            Ok(Arc::new(store))
        }
    }
}

async fn print_token(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = AgentConfig::from_env(None, None, data_dir);
    let store = FileStore::open(&config.data_dir)
        .with_context(|| format!("opening {}", config.data_dir.display()))?;
    let Some(bytes) = store.read(CREDENTIALS_KEY).await? else {
        anyhow::bail!(
            "no credentials found in {} — start the agent once first",
            config.data_dir.display()
        );
    };
    let doc: CredentialsDoc = serde_json::from_slice(&bytes).context("parsing credentials")?;
    let fingerprint = porpulsion_node::identity::fingerprint(&doc.ca_crt)
        .context("fingerprinting stored CA")?;

    println!("Agent:            {}", config.name);
    println!("Self URL:         {}", config.self_url);
    println!("Invite token:     {}", doc.invite_token);
    println!("CA fingerprint:   {fingerprint}");
    println!();
    println!("Hand the token and fingerprint to the peering operator out-of-band;");
    println!("they paste both into their agent's 'Connect peer' form.");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
