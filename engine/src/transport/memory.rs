//! In-process transport for local clusters and tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use super::{InboundMessage, Transport};
use crate::conversion::peer_id_from_pubkey;
use crate::error::TransportError;
use crate::messages::ProtocolId;
use crate::types::PeerId;

#[derive(Default)]
struct Faults {
    muted: HashSet<(PeerId, ProtocolId)>, // outbound traffic from peer on protocol is dropped
    isolated: HashSet<PeerId>,
}

/// Shared switchboard connecting every [`MemoryTransport`].
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<DashMap<PeerId, mpsc::UnboundedSender<InboundMessage>>>,
    faults: Arc<RwLock<Faults>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node identified by its hex public key.
    pub fn join(
        &self,
        pub_key: &str,
    ) -> Result<(Arc<MemoryTransport>, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        let peer_id = peer_id_from_pubkey(pub_key)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(peer_id.clone(), tx);

        let transport = MemoryTransport {
            peer_id,
            network: self.clone(),
        };
        Ok((Arc::new(transport), rx))
    }

    /// Silently drop everything `peer` sends on `protocol`.
    pub fn mute(&self, peer: &PeerId, protocol: ProtocolId) {
        if let Ok(mut faults) = self.faults.write() {
            faults.muted.insert((peer.clone(), protocol));
        }
    }

    pub fn unmute(&self, peer: &PeerId, protocol: ProtocolId) {
        if let Ok(mut faults) = self.faults.write() {
            faults.muted.remove(&(peer.clone(), protocol));
        }
    }

    /// Cut a peer off in both directions.
    pub fn isolate(&self, peer: &PeerId) {
        if let Ok(mut faults) = self.faults.write() {
            faults.isolated.insert(peer.clone());
        }
    }

    fn dropped(&self, from: &PeerId, to: &PeerId, protocol: ProtocolId) -> bool {
        match self.faults.read() {
            Ok(faults) => {
                faults.isolated.contains(from)
                    || faults.isolated.contains(to)
                    || faults.muted.contains(&(from.clone(), protocol))
            }
            Err(_) => false,
        }
    }
}

pub struct MemoryTransport {
    peer_id: PeerId,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn send(&self, to: &PeerId, protocol: ProtocolId, payload: Vec<u8>) -> Result<(), TransportError> {
        let inbox = self
            .network
            .inboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?;

        if self.network.dropped(&self.peer_id, to, protocol) {
            trace!(from = %self.peer_id, to = %to, ?protocol, "dropping message (fault injected)");
            return Ok(());
        }

        inbox
            .send(InboundMessage {
                peer_id: self.peer_id.clone(),
                protocol,
                payload,
            })
            .map_err(|_| TransportError::SendFailed(format!("inbox of {to} closed")))
    }

    fn address_book(&self) -> HashMap<PeerId, String> {
        self.network
            .inboxes
            .iter()
            .filter(|entry| entry.key() != &self.peer_id)
            .map(|entry| (entry.key().clone(), format!("memory://{}", entry.key())))
            .collect()
    }
}
