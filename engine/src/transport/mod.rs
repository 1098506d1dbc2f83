//! Point-to-point transport collaborator.
//!
//! Connection setup, discovery and encryption belong to the implementation.
//! The coordination layer only sends bytes to a peer id and consumes an inbound
//! stream tagged with the sender.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::messages::ProtocolId;
use crate::types::PeerId;

/// One delivery from the network.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer_id: PeerId,
    pub protocol: ProtocolId,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    async fn send(&self, to: &PeerId, protocol: ProtocolId, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Known peers and their dial addresses.
    fn address_book(&self) -> HashMap<PeerId, String>;
}
