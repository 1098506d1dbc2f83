//! MPC engine collaborator contract.
//!
//! The engine owns the threshold math. It is handed the ordered party list and
//! a pair of channels: `inbound` carries only messages the router has already
//! confirmed, `outbound` takes routing-tagged messages in emission order.

pub mod frost;

use async_trait::async_trait;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::error::EngineError;
use crate::messages::WireMessage;
use crate::types::{CeremonyKind, PartyId};

/// Channel capacity between the runner and the engine.
pub const ENGINE_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct PartyParams {
    pub parties: Vec<PartyId>, // sorted by index
    pub local: PartyId,
    pub threshold: usize,
}

impl PartyParams {
    pub fn others(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter().filter(move |p| p.index != self.local.index)
    }
}

pub struct EngineIo {
    pub inbound: mpsc::Receiver<WireMessage>,
    pub outbound: mpsc::Sender<WireMessage>,
}

/// Runner-side ends of an [`EngineIo`].
pub struct EngineHandle {
    pub inbound: mpsc::Sender<WireMessage>,
    pub outbound: mpsc::Receiver<WireMessage>,
}

/// Wire up a fresh engine channel pair.
pub fn engine_channels() -> (EngineIo, EngineHandle) {
    let (in_tx, in_rx) = mpsc::channel(ENGINE_CHANNEL_SIZE);
    let (out_tx, out_rx) = mpsc::channel(ENGINE_CHANNEL_SIZE);
    (
        EngineIo {
            inbound: in_rx,
            outbound: out_tx,
        },
        EngineHandle {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

/// One protocol round as the blame manager sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSpec {
    pub label: String,
    pub broadcast: bool,
}

impl RoundSpec {
    pub fn new(label: &str, broadcast: bool) -> Self {
        RoundSpec {
            label: label.to_string(),
            broadcast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeygenOutput {
    pub pub_key: Vec<u8>,
    pub local_data: Zeroizing<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    pub message: Vec<u8>,
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait MpcEngine: Send + Sync {
    /// Check pre-parameters before any network traffic. Errors here are start failures.
    fn preflight(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Rounds of a ceremony, in protocol order.
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec>;

    async fn keygen(&self, params: PartyParams, io: EngineIo) -> Result<KeygenOutput, EngineError>;

    /// Sign every message in one ceremony. The result is in input order.
    async fn keysign(
        &self,
        params: PartyParams,
        local_data: Zeroizing<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError>;
}
