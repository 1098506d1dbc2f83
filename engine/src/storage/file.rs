use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::storage::{KeygenLocalState, LocalStateManager};
use crate::types::PeerId;

const ADDRESS_BOOK_FILE: &str = "address_book.json";

/// JSON files under one base folder: `localstate-{pub_key}.json` per pool key
/// plus a shared `address_book.json`.
pub struct FileStateManager {
    folder: PathBuf,
}

impl FileStateManager {
    pub fn new(folder: impl AsRef<Path>) -> Result<Self, StorageError> {
        fs::create_dir_all(folder.as_ref())?;
        Ok(FileStateManager {
            folder: folder.as_ref().to_path_buf(),
        })
    }

    fn local_state_path(&self, pub_key: &str) -> PathBuf {
        self.folder.join(format!("localstate-{pub_key}.json"))
    }

    /// Write to a temp file, then rename over the target.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl LocalStateManager for FileStateManager {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.write_atomic(&self.local_state_path(&state.pub_key), &bytes)
    }

    fn get_local_state(&self, pub_key: &str) -> Result<KeygenLocalState, StorageError> {
        let raw = match fs::read(self.local_state_path(pub_key)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(pub_key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    fn save_address_book(&self, book: &HashMap<PeerId, String>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(book)?;
        self.write_atomic(&self.folder.join(ADDRESS_BOOK_FILE), &bytes)
    }

    fn retrieve_address_book(&self) -> Result<HashMap<PeerId, String>, StorageError> {
        match fs::read(self.folder.join(ADDRESS_BOOK_FILE)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}
