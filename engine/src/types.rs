//! Shared data types: peer identities, ceremony party ids, and the party/peer map.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::conversion::peer_id_from_pubkey;
use crate::error::{TssError, TssResult};

/// Network identity of a participant, derived from its public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol-facing identity of a participant inside one ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub index: u16,      // 1-based position in the sorted keygen roster
    pub pub_key: String, // hex-encoded node public key
}

/// Which multiparty protocol a ceremony runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CeremonyKind {
    Keygen,
    Keysign,
}

impl fmt::Display for CeremonyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CeremonyKind::Keygen => f.write_str("keygen"),
            CeremonyKind::Keysign => f.write_str("keysign"),
        }
    }
}

/// Caller-facing ceremony status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    NA,
    Success,
    Fail,
}

/// Bijective PartyId <-> PeerId mapping for one ceremony.
///
/// Built once from the participant roster before the engine starts and never
/// mutated afterwards, so it is shared behind an `Arc` without locking.
#[derive(Debug)]
pub struct PartyIdMap {
    parties: Vec<PartyId>,
    party_to_peer: HashMap<u16, PeerId>,
    peer_to_party: HashMap<PeerId, PartyId>,
}

impl PartyIdMap {
    pub fn new(parties: &[PartyId]) -> TssResult<Self> {
        let mut party_to_peer = HashMap::with_capacity(parties.len());
        let mut peer_to_party = HashMap::with_capacity(parties.len());
        for party in parties {
            let peer = peer_id_from_pubkey(&party.pub_key)
                .map_err(|e| TssError::InvalidRequest(e.to_string()))?;
            if party_to_peer.insert(party.index, peer.clone()).is_some()
                || peer_to_party.insert(peer, party.clone()).is_some()
            {
                return Err(TssError::InvalidRequest(format!(
                    "duplicate party {} in roster",
                    party.index
                )));
            }
        }

        Ok(PartyIdMap {
            parties: parties.to_vec(),
            party_to_peer,
            peer_to_party,
        })
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn parties(&self) -> &[PartyId] {
        &self.parties
    }

    pub fn peer_of(&self, index: u16) -> Option<&PeerId> {
        self.party_to_peer.get(&index)
    }

    pub fn party_of(&self, peer: &PeerId) -> Option<&PartyId> {
        self.peer_to_party.get(peer)
    }

    /// All peer ids in roster order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.parties
            .iter()
            .filter_map(|p| self.party_to_peer.get(&p.index).cloned())
            .collect()
    }

    /// Every peer except `local`, in roster order.
    pub fn peers_except(&self, local: &PeerId) -> Vec<PeerId> {
        self.peer_ids().into_iter().filter(|p| p != local).collect()
    }

    pub fn pub_key_of_peer(&self, peer: &PeerId) -> Option<&str> {
        self.peer_to_party.get(peer).map(|p| p.pub_key.as_str())
    }
}
