//! Persistence of key-share material and the peer address book.

pub mod file;
pub mod memory;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::StorageError;
use crate::types::PeerId;

/// Everything a node keeps after a successful keygen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenLocalState {
    pub pub_key: String,    // pool public key, hex
    pub local_data: String, // engine key share, hex
    pub participant_keys: Vec<String>,
    pub local_party_key: String,
}

impl KeygenLocalState {
    /// Decoded share bytes, wiped on drop.
    pub fn share_bytes(&self) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        hex::decode(&self.local_data)
            .map(Zeroizing::new)
            .map_err(|e| StorageError::Corrupt(format!("share for {}: {e}", self.pub_key)))
    }
}

/// Pluggable store for local key shares and discovered peers.
pub trait LocalStateManager: Send + Sync {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<(), StorageError>;

    fn get_local_state(&self, pub_key: &str) -> Result<KeygenLocalState, StorageError>;

    fn save_address_book(&self, book: &HashMap<PeerId, String>) -> Result<(), StorageError>;

    fn retrieve_address_book(&self) -> Result<HashMap<PeerId, String>, StorageError>;
}
