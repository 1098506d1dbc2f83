//! Shared helpers for the engine test suites.

mod four_nodes_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use crate::config::{JoinPartyConfig, TssConfig};
use crate::conversion::peer_id_from_pubkey;
use crate::error::TransportError;
use crate::messages::ProtocolId;
use crate::mpc::MpcEngine;
use crate::server::TssServer;
use crate::storage::memory::MemoryStateManager;
use crate::transport::Transport;
use crate::transport::memory::MemoryNetwork;
use crate::types::PeerId;

/// Fresh hex-encoded Ed25519 node key.
pub(crate) fn node_key() -> String {
    let signing_key = SigningKey::from_bytes(&rand::random::<[u8; 32]>());
    hex::encode(signing_key.verifying_key().to_bytes())
}

/// `n` node keys in sorted order, so key `i` is party `i + 1`.
pub(crate) fn sorted_keys(n: usize) -> Vec<String> {
    let mut keys: Vec<String> = (0..n).map(|_| node_key()).collect();
    keys.sort();
    keys
}

pub(crate) fn peer(key: &str) -> PeerId {
    peer_id_from_pubkey(key).expect("valid test key")
}

pub(crate) fn test_config() -> TssConfig {
    TssConfig {
        keygen_timeout: Duration::from_secs(5),
        keysign_timeout: Duration::from_secs(5),
        join_party: JoinPartyConfig {
            timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(100),
            max_attempts: 30,
        },
        status_history: 32,
    }
}

/// Transport that records every send instead of delivering it.
pub(crate) struct RecordingTransport {
    pub local: PeerId,
    pub sent: Mutex<Vec<(PeerId, ProtocolId, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn new(local: PeerId) -> Self {
        RecordingTransport {
            local,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<(PeerId, ProtocolId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    async fn send(&self, to: &PeerId, protocol: ProtocolId, payload: Vec<u8>) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((to.clone(), protocol, payload));
        Ok(())
    }

    fn address_book(&self) -> HashMap<PeerId, String> {
        HashMap::new()
    }
}

pub(crate) struct TestNode {
    pub pub_key: String,
    pub server: Arc<TssServer>,
    pub storage: Arc<MemoryStateManager>,
}

/// Start an `n`-node in-memory cluster. Nodes are ordered by public key.
pub(crate) fn cluster(n: usize, engine: Arc<dyn MpcEngine>, config: TssConfig) -> (MemoryNetwork, Vec<TestNode>) {
    cluster_with(sorted_keys(n), engine, config, |_, transport| transport)
}

/// Cluster over the given sorted `keys`; node `i`'s transport goes through
/// `wrap(i, ..)` first.
pub(crate) fn cluster_with(
    keys: Vec<String>,
    engine: Arc<dyn MpcEngine>,
    config: TssConfig,
    wrap: impl Fn(usize, Arc<dyn Transport>) -> Arc<dyn Transport>,
) -> (MemoryNetwork, Vec<TestNode>) {
    let network = MemoryNetwork::new();
    let nodes = keys
        .into_iter()
        .enumerate()
        .map(|(i, pub_key)| {
            let (transport, inbound) = network.join(&pub_key).unwrap();
            let transport: Arc<dyn Transport> = transport;
            let transport = wrap(i, transport);
            let storage = Arc::new(MemoryStateManager::new());
            let server = TssServer::new(
                config.clone(),
                &pub_key,
                transport,
                inbound,
                engine.clone(),
                storage.clone(),
            )
            .unwrap();
            server.start().unwrap();
            TestNode {
                pub_key,
                server: Arc::new(server),
                storage,
            }
        })
        .collect();
    (network, nodes)
}
