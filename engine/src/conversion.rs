//! Key, party and hash conversions shared by every ceremony.

use std::collections::HashSet;

use ed25519_dalek::VerifyingKey;

use crate::error::{TransportError, TssError, TssResult};
use crate::types::{PartyId, PeerId};

/// Derive the network identity of a node from its hex-encoded Ed25519 public key.
pub fn peer_id_from_pubkey(pub_key: &str) -> Result<PeerId, TransportError> {
    let bytes = hex::decode(pub_key)
        .map_err(|e| TransportError::InvalidKey(format!("{pub_key}: {e}")))?;
    let key_bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| TransportError::InvalidKey(format!("{pub_key}: expected 32 bytes")))?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| TransportError::InvalidKey(format!("{pub_key}: {e}")))?;

    let digest = blake3::hash(&key_bytes);
    Ok(PeerId(hex::encode(&digest.as_bytes()[..20])))
}

/// Threshold `t` for `n` participants: ceil(2n/3) - 1. The engine needs `t + 1` shares.
pub fn get_threshold(party_num: usize) -> TssResult<usize> {
    if party_num == 0 {
        return Err(TssError::InvalidRequest("no participants".into()));
    }
    Ok((2 * party_num).div_ceil(3) - 1)
}

/// Build the sorted party list for a ceremony and locate the local party.
///
/// Indices come from the position in the sorted `roster` (the keygen participant
/// list) so a signer keeps its keygen index in every later keysign. With no
/// roster the keys themselves are the roster.
pub fn get_parties(
    keys: &[String],
    local_pub_key: &str,
    roster: Option<&[String]>,
) -> TssResult<(Vec<PartyId>, Option<PartyId>)> {
    if keys.is_empty() {
        return Err(TssError::InvalidRequest("empty participant list".into()));
    }

    let mut seen = HashSet::with_capacity(keys.len());
    for key in keys {
        if !seen.insert(key.as_str()) {
            return Err(TssError::InvalidRequest(format!("duplicate key {key}")));
        }
    }

    let mut sorted_roster: Vec<&str> = roster
        .map(|r| r.iter().map(String::as_str).collect())
        .unwrap_or_else(|| keys.iter().map(String::as_str).collect());
    sorted_roster.sort_unstable();

    let mut parties = Vec::with_capacity(keys.len());
    for key in keys {
        let position = sorted_roster
            .binary_search(&key.as_str())
            .map_err(|_| TssError::InvalidRequest(format!("key {key} is not in the roster")))?;
        let index = u16::try_from(position + 1)
            .map_err(|_| TssError::InvalidRequest("roster too large".into()))?;
        parties.push(PartyId {
            index,
            pub_key: key.clone(),
        });
    }
    parties.sort_by_key(|p| p.index);

    let local = parties.iter().find(|p| p.pub_key == local_pub_key).cloned();
    Ok((parties, local))
}

/// Deterministic ceremony id: BLAKE3 hex digest of the canonical request bytes.
pub fn msg_to_hash_string(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Leader index for a ceremony, so quorum formation needs no agreement round.
pub fn leader_index(payload: &[u8], total: usize) -> TssResult<usize> {
    if total == 0 {
        return Err(TssError::InvalidRequest("no participants to elect a leader from".into()));
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload);
    hasher.update(&(total as u64).to_be_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    Ok((u64::from_be_bytes(prefix) % total as u64) as usize)
}
