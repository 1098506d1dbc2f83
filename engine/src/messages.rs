//! Wire envelopes exchanged between nodes.
//!
//! Everything here is `bincode`-encoded. Ceremony traffic travels inside a
//! [`WrappedMessage`] carrying the ceremony id, so one transport can multiplex
//! concurrent ceremonies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::conversion::msg_to_hash_string;
use crate::error::TssResult;
use crate::types::{PartyId, PeerId};

/// Category of a [`WrappedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    KeygenMsg,
    KeysignMsg,
    KeygenVerMsg,
    KeysignVerMsg,
    Unknown,
}

impl MessageType {
    /// The confirmation category paired with a payload category.
    pub fn verification(self) -> MessageType {
        match self {
            MessageType::KeygenMsg => MessageType::KeygenVerMsg,
            MessageType::KeysignMsg => MessageType::KeysignVerMsg,
            _ => MessageType::Unknown,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageType::KeygenMsg => "TSSKeyGenMsg",
            MessageType::KeysignMsg => "TSSKeySignMsg",
            MessageType::KeygenVerMsg => "TSSKeyGenVerMsg",
            MessageType::KeysignVerMsg => "TSSKeySignVerMsg",
            MessageType::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Outer envelope for all ceremony traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    pub msg_id: String,
    pub payload: Vec<u8>,
}

impl WrappedMessage {
    pub fn new<T: Serialize>(message_type: MessageType, msg_id: &str, inner: &T) -> TssResult<Self> {
        Ok(WrappedMessage {
            message_type,
            msg_id: msg_id.to_string(),
            payload: bincode::serialize(inner)?,
        })
    }

    pub fn encode(&self) -> TssResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> TssResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decode the inner payload.
    pub fn inner<T: DeserializeOwned>(&self) -> TssResult<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Who sent an engine message and who should receive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRouting {
    pub from: PartyId,
    pub to: Vec<PartyId>, // empty for broadcast
    pub is_broadcast: bool,
}

/// Opaque per-round engine payload plus its routing tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub routing: MessageRouting,
    pub round_info: String,
    pub message: Vec<u8>,
}

impl WireMessage {
    pub fn broadcast(from: PartyId, round: &str, message: Vec<u8>) -> Self {
        WireMessage {
            routing: MessageRouting {
                from,
                to: Vec::new(),
                is_broadcast: true,
            },
            round_info: round.to_string(),
            message,
        }
    }

    pub fn unicast(from: PartyId, to: PartyId, round: &str, message: Vec<u8>) -> Self {
        WireMessage {
            routing: MessageRouting {
                from,
                to: vec![to],
                is_broadcast: false,
            },
            round_info: round.to_string(),
            message,
        }
    }

    /// Confirmation cache key: one slot per (sender, round).
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.routing.from.index, self.round_info)
    }

    pub fn content_hash(&self) -> String {
        msg_to_hash_string(&self.message)
    }
}

/// A peer's report of the hash it received for one broadcast slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfirmMessage {
    pub peer_id: PeerId,
    pub key: String,
    pub hash: String,
}

/// Leader's verdict on quorum formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPartyOutcome {
    Success,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPartyMessage {
    Request {
        id: String,
    },
    Response {
        id: String,
        outcome: JoinPartyOutcome,
        peer_ids: Vec<PeerId>, // standby roster
    },
}

impl JoinPartyMessage {
    pub fn encode(&self) -> TssResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> TssResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Transport-level protocol a payload travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolId {
    JoinParty,
    Tss,
}
