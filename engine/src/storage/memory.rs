use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StorageError;
use crate::storage::{KeygenLocalState, LocalStateManager};
use crate::types::PeerId;

/// Non-persistent store for tests and local clusters.
#[derive(Default)]
pub struct MemoryStateManager {
    states: RwLock<HashMap<String, KeygenLocalState>>,
    address_book: RwLock<HashMap<PeerId, String>>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStateManager for MemoryStateManager {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<(), StorageError> {
        let mut states = self.states.write().map_err(|_| StorageError::Poisoned)?;
        states.insert(state.pub_key.clone(), state.clone());
        Ok(())
    }

    fn get_local_state(&self, pub_key: &str) -> Result<KeygenLocalState, StorageError> {
        let states = self.states.read().map_err(|_| StorageError::Poisoned)?;
        states
            .get(pub_key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(pub_key.to_string()))
    }

    fn save_address_book(&self, book: &HashMap<PeerId, String>) -> Result<(), StorageError> {
        let mut stored = self.address_book.write().map_err(|_| StorageError::Poisoned)?;
        *stored = book.clone();
        Ok(())
    }

    fn retrieve_address_book(&self) -> Result<HashMap<PeerId, String>, StorageError> {
        let stored = self.address_book.read().map_err(|_| StorageError::Poisoned)?;
        Ok(stored.clone())
    }
}
