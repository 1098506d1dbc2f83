//! Demo node: runs a full keygen and keysign on a local in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use tracing::info;

use tss_engine::logging::init_logging;
use tss_engine::mpc::MpcEngine;
use tss_engine::mpc::frost::FrostEngine;
use tss_engine::request::{KeygenRequest, KeysignRequest};
use tss_engine::storage::memory::MemoryStateManager;
use tss_engine::transport::memory::MemoryNetwork;
use tss_engine::types::Status;
use tss_engine::{TssConfig, TssServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "tss-node", version, about = "Threshold signing coordination node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one keygen and one keysign across an in-memory cluster
    Simulate {
        #[arg(short, long, default_value_t = 4)]
        parties: usize,

        #[arg(short, long, required = true, help = "Message to sign, repeat for a batch")]
        message: Vec<String>,

        #[arg(long, help = "Keygen timeout in seconds")]
        keygen_timeout: Option<u64>,

        #[arg(long, help = "JSON config file; missing fields use defaults")]
        config: Option<String>,

        #[arg(long, help = "Also write daily rolling log files here")]
        log_dir: Option<String>,

        #[arg(long, help = "JSON log files instead of logfmt")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            parties,
            message,
            keygen_timeout,
            config,
            log_dir,
            json,
        } => {
            let _guard = init_logging(log_dir.as_deref(), json);

            let mut config = match config {
                Some(path) => TssConfig::from_file(&path).with_context(|| format!("loading config {path}"))?,
                None => TssConfig::default(),
            };
            if let Some(secs) = keygen_timeout {
                config.keygen_timeout = Duration::from_secs(secs);
            }
            simulate(parties, message, config).await
        }
    }
}

fn node_key() -> String {
    let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
    hex::encode(signing_key.verifying_key().to_bytes())
}

async fn simulate(parties: usize, messages: Vec<String>, config: TssConfig) -> Result<()> {
    if parties < 2 {
        bail!("a cluster needs at least 2 parties, got {parties}");
    }

    let network = MemoryNetwork::new();
    let engine: Arc<dyn MpcEngine> = Arc::new(FrostEngine::new());
    let mut keys: Vec<String> = (0..parties).map(|_| node_key()).collect();
    keys.sort();

    let mut servers = Vec::with_capacity(parties);
    for key in &keys {
        let (transport, inbound) = network.join(key)?;
        let server = TssServer::new(
            config.clone(),
            key,
            transport,
            inbound,
            engine.clone(),
            Arc::new(MemoryStateManager::new()),
        )?;
        server.start()?;
        servers.push(Arc::new(server));
    }
    info!(parties, "cluster started");

    // Keygen on every node
    let handles: Vec<_> = servers
        .iter()
        .map(|server| {
            let server = server.clone();
            let req = KeygenRequest::new(keys.clone(), VERSION);
            tokio::spawn(async move { server.keygen(&req).await })
        })
        .collect();
    let mut pool_keys = Vec::with_capacity(parties);
    for (key, handle) in keys.iter().zip(handles) {
        let response = handle.await??;
        if response.status != Status::Success {
            bail!(
                "keygen failed on {key}: {} (blamed: {:?})",
                response.blame.fail_reason,
                response.blame.pub_keys()
            );
        }
        pool_keys.push(response.pub_key);
    }
    let pool_pub_key = pool_keys[0].clone();
    if pool_keys.iter().any(|k| *k != pool_pub_key) {
        bail!("nodes disagree on the pool public key: {pool_keys:?}");
    }
    println!("Pool public key: {pool_pub_key}");

    // Keysign the batch on every node
    let encoded: Vec<String> = messages.iter().map(|m| STANDARD.encode(m.as_bytes())).collect();
    let req = KeysignRequest::new(&pool_pub_key, encoded, keys.clone(), VERSION);
    let handles: Vec<_> = servers
        .iter()
        .map(|server| {
            let server = server.clone();
            let req = req.clone();
            tokio::spawn(async move { server.keysign(&req).await })
        })
        .collect();

    let mut signatures = Vec::with_capacity(parties);
    for (key, handle) in keys.iter().zip(handles) {
        let response = handle.await??;
        if response.status != Status::Success {
            bail!(
                "keysign failed on {key}: {} (blamed: {:?})",
                response.blame.fail_reason,
                response.blame.pub_keys()
            );
        }
        println!("Node {key}");
        for sig in &response.signatures {
            println!("  {} -> {}", sig.msg, sig.signature);
        }
        signatures.push(response.signatures);
    }
    if signatures.iter().any(|s| *s != signatures[0]) {
        bail!("nodes produced different signatures");
    }

    for server in &servers {
        server.stop();
    }
    info!("simulation finished");
    Ok(())
}
