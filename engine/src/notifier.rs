//! One-shot delivery of keysign results.
//!
//! A notifier settles exactly once. A present result is checked against the
//! pool public key before it is forwarded; an absent result (the failure
//! sentinel) is forwarded as-is. Settling twice reports
//! [`NotifierError::AlreadySettled`] and leaves the first result in place.

use std::sync::Mutex;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::NotifierError;
use crate::mpc::SignatureData;

type Outcome = Option<Vec<SignatureData>>;

pub struct Notifier {
    msg_id: String,
    messages: Vec<Vec<u8>>,
    pool_pub_key: VerifyingKey,
    slot: Mutex<Option<oneshot::Sender<Outcome>>>,
    result: Mutex<Option<oneshot::Receiver<Outcome>>>,
}

impl Notifier {
    /// `pool_pub_key` is the 32-byte group key the signatures must verify under.
    pub fn new(msg_id: &str, messages: Vec<Vec<u8>>, pool_pub_key: &[u8]) -> Result<Self, NotifierError> {
        if msg_id.is_empty() {
            return Err(NotifierError::InvalidInput("empty message id".into()));
        }
        if messages.is_empty() {
            return Err(NotifierError::InvalidInput("no messages".into()));
        }
        let key_bytes: [u8; 32] = pool_pub_key
            .try_into()
            .map_err(|_| NotifierError::InvalidInput("pool public key must be 32 bytes".into()))?;
        let pool_pub_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| NotifierError::InvalidInput(format!("invalid pool public key: {e}")))?;

        let (tx, rx) = oneshot::channel();
        Ok(Notifier {
            msg_id: msg_id.to_string(),
            messages,
            pool_pub_key,
            slot: Mutex::new(Some(tx)),
            result: Mutex::new(Some(rx)),
        })
    }

    fn verify(&self, data: &[SignatureData]) -> Result<(), NotifierError> {
        if data.len() != self.messages.len() {
            return Err(NotifierError::VerificationFailed(format!(
                "expected {} signatures, got {}",
                self.messages.len(),
                data.len()
            )));
        }
        for (expected, sig) in self.messages.iter().zip(data) {
            if &sig.message != expected {
                return Err(NotifierError::VerificationFailed("signature is for a different message".into()));
            }
            let signature = Signature::from_slice(&sig.signature)
                .map_err(|e| NotifierError::VerificationFailed(format!("malformed signature: {e}")))?;
            self.pool_pub_key
                .verify(&sig.message, &signature)
                .map_err(|e| NotifierError::VerificationFailed(e.to_string()))?;
        }
        Ok(())
    }

    /// Settle the notifier, forwarding `data` to the waiter.
    pub fn process_signature(&self, data: Outcome) -> Result<(), NotifierError> {
        let mut slot = self.slot.lock().map_err(|_| NotifierError::AlreadySettled)?;
        if slot.is_none() {
            return Err(NotifierError::AlreadySettled);
        }

        if let Some(signatures) = &data {
            if let Err(e) = self.verify(signatures) {
                warn!(msg_id = %self.msg_id, error = %e, "keysign result rejected");
                return Err(e);
            }
        }

        let Some(tx) = slot.take() else {
            return Err(NotifierError::AlreadySettled);
        };
        let delivered = data.is_some();
        // The waiter may have gone away; the notifier is settled either way.
        let _ = tx.send(data);
        debug!(msg_id = %self.msg_id, delivered, "notifier settled");
        Ok(())
    }

    /// Wait for the settled result. `None` is the failure sentinel.
    pub async fn wait(&self) -> Result<Outcome, NotifierError> {
        let rx = self
            .result
            .lock()
            .map_err(|_| NotifierError::AlreadyConsumed)?
            .take()
            .ok_or(NotifierError::AlreadyConsumed)?;
        rx.await.map_err(|_| NotifierError::InvalidInput("notifier dropped before settling".into()))
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }
}
