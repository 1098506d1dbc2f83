//! Caller-facing requests and responses.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::blame::Blame;
use crate::conversion::msg_to_hash_string;
use crate::error::{TssError, TssResult};
use crate::types::Status;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub keys: Vec<String>, // hex-encoded node public keys
    pub version: String,
}

impl KeygenRequest {
    pub fn new(keys: Vec<String>, version: &str) -> Self {
        KeygenRequest {
            keys,
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub pub_key: String, // hex, empty when this node is not a participant
    pub status: Status,
    pub blame: Blame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    pub pool_pub_key: String,
    pub messages: Vec<String>, // base64
    pub signer_pub_keys: Vec<String>,
    pub version: String,
}

impl KeysignRequest {
    pub fn new(pool_pub_key: &str, messages: Vec<String>, signer_pub_keys: Vec<String>, version: &str) -> Self {
        KeysignRequest {
            pool_pub_key: pool_pub_key.to_string(),
            messages,
            signer_pub_keys,
            version: version.to_string(),
        }
    }

    /// Decode the base64 messages in request order.
    pub fn decoded_messages(&self) -> TssResult<Vec<Vec<u8>>> {
        if self.messages.is_empty() {
            return Err(TssError::InvalidRequest("no messages to sign".into()));
        }
        self.messages
            .iter()
            .map(|m| {
                STANDARD
                    .decode(m)
                    .map_err(|e| TssError::InvalidRequest(format!("message is not base64: {e}")))
            })
            .collect()
    }

    /// Decoded messages sorted and deduplicated. Every signer feeds the engine
    /// in this order, whatever order it was handed the batch in.
    pub fn signing_order(&self) -> TssResult<Vec<Vec<u8>>> {
        let mut messages = self.decoded_messages()?;
        messages.sort();
        messages.dedup();
        Ok(messages)
    }
}

/// One signed message, both base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub msg: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<Signature>,
    pub status: Status,
    pub blame: Blame,
}

/// The request shapes that map onto a ceremony id.
pub enum CeremonyRequest<'a> {
    Keygen(&'a KeygenRequest),
    Keysign(&'a KeysignRequest),
}

impl CeremonyRequest<'_> {
    /// Canonical content of the request. Order of keys and messages in the
    /// submission does not matter, neither do repeated messages.
    pub fn canonical_bytes(&self) -> TssResult<Vec<u8>> {
        match self {
            CeremonyRequest::Keygen(req) => Ok(keygen_canonical(req)),
            CeremonyRequest::Keysign(req) => keysign_canonical(req),
        }
    }

    pub fn msg_id(&self) -> TssResult<String> {
        Ok(msg_to_hash_string(&self.canonical_bytes()?))
    }
}

fn keygen_canonical(req: &KeygenRequest) -> Vec<u8> {
    let mut keys: Vec<&str> = req.keys.iter().map(String::as_str).collect();
    keys.sort_unstable();
    keys.concat().into_bytes()
}

fn keysign_canonical(req: &KeysignRequest) -> TssResult<Vec<u8>> {
    let mut signers: Vec<&str> = req.signer_pub_keys.iter().map(String::as_str).collect();
    signers.sort_unstable();
    let messages = req.signing_order()?;

    let mut out = Vec::new();
    push_prefixed(&mut out, req.pool_pub_key.as_bytes());
    for signer in signers {
        push_prefixed(&mut out, signer.as_bytes());
    }
    for msg in &messages {
        push_prefixed(&mut out, msg);
    }
    Ok(out)
}

fn push_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}
