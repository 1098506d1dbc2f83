//! Caller-facing facade of a TSS node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blame::Blame;
use crate::ceremony::{CeremonyInbound, CeremonySetup, CeremonyState, RoundRunner};
use crate::config::TssConfig;
use crate::conversion::{get_parties, get_threshold, peer_id_from_pubkey};
use crate::error::{TssError, TssResult};
use crate::messages::{ProtocolId, WrappedMessage};
use crate::mpc::MpcEngine;
use crate::notifier::Notifier;
use crate::party_coordinator::{PartyCoordinator, wait_for_shutdown};
use crate::request::{
    CeremonyRequest, KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, Signature,
};
use crate::status::{StatusSnapshot, TssStatus};
use crate::storage::LocalStateManager;
use crate::transport::{InboundMessage, Transport};
use crate::types::{CeremonyKind, PeerId, Status};

#[derive(Debug, Clone)]
enum CeremonyResult {
    Keygen(KeygenResponse),
    Keysign(KeysignResponse),
}

/// A ceremony in flight on this node.
struct CeremonySlot {
    inbound: mpsc::UnboundedSender<(PeerId, WrappedMessage)>,
    result: watch::Receiver<Option<CeremonyResult>>,
}

enum Registration {
    Started(CeremonyInbound, watch::Sender<Option<CeremonyResult>>),
    InFlight(watch::Receiver<Option<CeremonyResult>>),
}

pub struct TssServer {
    config: TssConfig,
    local_pub_key: String,
    transport: Arc<dyn Transport>,
    state_manager: Arc<dyn LocalStateManager>,
    coordinator: Arc<PartyCoordinator>,
    runner: RoundRunner,
    status: Arc<TssStatus>,
    ceremonies: Arc<DashMap<String, CeremonySlot>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl TssServer {
    pub fn new(
        config: TssConfig,
        local_pub_key: &str,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundMessage>,
        engine: Arc<dyn MpcEngine>,
        state_manager: Arc<dyn LocalStateManager>,
    ) -> TssResult<Self> {
        config.validate()?;
        let local_peer = peer_id_from_pubkey(local_pub_key)?;
        if local_peer != transport.local_peer_id() {
            return Err(TssError::InvalidRequest("transport identity does not match the node key".into()));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let status = Arc::new(TssStatus::new(config.status_history));
        let coordinator = Arc::new(PartyCoordinator::new(transport.clone(), config.join_party.clone()));
        let runner = RoundRunner::new(transport.clone(), coordinator.clone(), engine, status.clone(), shutdown_rx);

        Ok(TssServer {
            config,
            local_pub_key: local_pub_key.to_string(),
            transport,
            state_manager,
            coordinator,
            runner,
            status,
            ceremonies: Arc::new(DashMap::new()),
            inbound: Mutex::new(Some(inbound)),
            dispatcher: Mutex::new(None),
            shutdown,
        })
    }

    /// Start dispatching inbound traffic. Calling it again is a no-op.
    pub fn start(&self) -> TssResult<()> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| TssError::Internal("inbound lock poisoned".into()))?
            .take();
        let Some(mut inbound) = inbound else {
            return Ok(());
        };

        let coordinator = self.coordinator.clone();
        let ceremonies = self.ceremonies.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    message = inbound.recv() => message,
                };
                let Some(message) = message else {
                    break;
                };
                dispatch(&coordinator, &ceremonies, message);
            }
            debug!("inbound dispatcher stopped");
        });

        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            *dispatcher = Some(handle);
        }
        info!(peer = %self.transport.local_peer_id(), "tss server started");
        Ok(())
    }

    /// Raise the process-wide stop signal. Running ceremonies end ABORTED.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        info!(peer = %self.transport.local_peer_id(), "tss server stopping");
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    pub async fn keygen(&self, req: &KeygenRequest) -> TssResult<KeygenResponse> {
        for key in &req.keys {
            peer_id_from_pubkey(key)?;
        }
        let msg_id = CeremonyRequest::Keygen(req).msg_id()?;
        let (parties, local) = get_parties(&req.keys, &self.local_pub_key, None)?;
        let Some(local) = local else {
            info!(msg_id = %msg_id, "not a keygen participant, nothing to do");
            return Ok(KeygenResponse {
                status: Status::Success,
                ..Default::default()
            });
        };
        let threshold = get_threshold(parties.len())?;

        let (inbound, result_tx) = match self.register(&msg_id) {
            Registration::InFlight(rx) => {
                return match wait_result(&msg_id, rx).await? {
                    CeremonyResult::Keygen(resp) => Ok(resp),
                    CeremonyResult::Keysign(_) => Err(TssError::Internal("ceremony id collision".into())),
                };
            }
            Registration::Started(inbound, tx) => (inbound, tx),
        };

        let setup = CeremonySetup {
            msg_id: msg_id.clone(),
            kind: CeremonyKind::Keygen,
            parties,
            local,
            threshold,
            timeout: self.config.keygen_timeout,
        };
        let mut roster = req.keys.clone();
        roster.sort();
        let outcome = self
            .runner
            .run_keygen(setup, inbound, self.state_manager.as_ref(), &roster)
            .await;

        let response = match outcome.result {
            Some(output) if outcome.state == CeremonyState::Done => KeygenResponse {
                pub_key: hex::encode(&output.pub_key),
                status: Status::Success,
                blame: Blame::default(),
            },
            _ => KeygenResponse {
                pub_key: String::new(),
                status: Status::Fail,
                blame: outcome.blame,
            },
        };
        let detail = outcome.error.map(|e| e.to_string()).unwrap_or_else(|| response.pub_key.clone());
        self.status.record(CeremonyKind::Keygen, &msg_id, response.status, detail);

        self.finish(&msg_id, &result_tx, CeremonyResult::Keygen(response.clone()));
        Ok(response)
    }

    pub async fn keysign(&self, req: &KeysignRequest) -> TssResult<KeysignResponse> {
        if req.signer_pub_keys.is_empty() {
            return Err(TssError::InvalidRequest("no signers".into()));
        }
        for key in &req.signer_pub_keys {
            peer_id_from_pubkey(key)?;
        }
        let messages = req.decoded_messages()?;
        let signing_order = req.signing_order()?;
        let msg_id = CeremonyRequest::Keysign(req).msg_id()?;

        if !req.signer_pub_keys.contains(&self.local_pub_key) {
            info!(msg_id = %msg_id, "not a keysign participant, nothing to do");
            return Ok(KeysignResponse {
                status: Status::Success,
                ..Default::default()
            });
        }

        let local_state = self.state_manager.get_local_state(&req.pool_pub_key)?;
        let (parties, local) = get_parties(
            &req.signer_pub_keys,
            &self.local_pub_key,
            Some(&local_state.participant_keys),
        )?;
        let local = local.ok_or_else(|| TssError::Internal("local signer not found".into()))?;
        let threshold = get_threshold(local_state.participant_keys.len())?;
        if parties.len() < threshold + 1 {
            return Err(TssError::InvalidRequest(format!(
                "{} signers cannot meet threshold {threshold}",
                parties.len()
            )));
        }
        let pool_key = hex::decode(&req.pool_pub_key)
            .map_err(|e| TssError::InvalidRequest(format!("pool public key is not hex: {e}")))?;
        let notifier = Arc::new(
            Notifier::new(&msg_id, signing_order.clone(), &pool_key).map_err(|e| TssError::InvalidRequest(e.to_string()))?,
        );
        let local_data = local_state.share_bytes()?;

        let (inbound, result_tx) = match self.register(&msg_id) {
            Registration::InFlight(rx) => {
                return match wait_result(&msg_id, rx).await? {
                    CeremonyResult::Keysign(resp) => in_request_order(resp, &messages),
                    CeremonyResult::Keygen(_) => Err(TssError::Internal("ceremony id collision".into())),
                };
            }
            Registration::Started(inbound, tx) => (inbound, tx),
        };

        let setup = CeremonySetup {
            msg_id: msg_id.clone(),
            kind: CeremonyKind::Keysign,
            parties,
            local,
            threshold,
            timeout: self.config.keysign_timeout,
        };
        let outcome = self
            .runner
            .run_keysign(setup, inbound, local_data, signing_order, notifier)
            .await;

        let response = match outcome.result {
            Some(signatures) if outcome.state == CeremonyState::Done => {
                if let Err(e) = self.state_manager.save_address_book(&self.transport.address_book()) {
                    warn!(msg_id = %msg_id, error = %e, "failed to save address book");
                }
                KeysignResponse {
                    signatures: signatures
                        .iter()
                        .map(|s| Signature {
                            msg: STANDARD.encode(&s.message),
                            signature: STANDARD.encode(&s.signature),
                        })
                        .collect(),
                    status: Status::Success,
                    blame: Blame::default(),
                }
            }
            _ => KeysignResponse {
                signatures: Vec::new(),
                status: Status::Fail,
                blame: outcome.blame,
            },
        };
        let detail = outcome
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{} signatures", response.signatures.len()));
        self.status.record(CeremonyKind::Keysign, &msg_id, response.status, detail);

        self.finish(&msg_id, &result_tx, CeremonyResult::Keysign(response.clone()));
        in_request_order(response, &messages)
    }

    /// Claim `msg_id`, or join the ceremony already running under it.
    fn register(&self, msg_id: &str) -> Registration {
        match self.ceremonies.entry(msg_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!(msg_id, "duplicate request joins running ceremony");
                Registration::InFlight(entry.get().result.clone())
            }
            Entry::Vacant(entry) => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                let (result_tx, result_rx) = watch::channel(None);
                entry.insert(CeremonySlot {
                    inbound: inbound_tx,
                    result: result_rx,
                });
                Registration::Started(inbound_rx, result_tx)
            }
        }
    }

    fn finish(&self, msg_id: &str, result_tx: &watch::Sender<Option<CeremonyResult>>, result: CeremonyResult) {
        result_tx.send_replace(Some(result));
        self.ceremonies.remove(msg_id);
    }
}

impl Drop for TssServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}

async fn wait_result(msg_id: &str, mut rx: watch::Receiver<Option<CeremonyResult>>) -> TssResult<CeremonyResult> {
    let result = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| TssError::Internal(format!("ceremony {msg_id} ended without a result")))?
        .clone();
    result.ok_or_else(|| TssError::Internal(format!("ceremony {msg_id} ended without a result")))
}

/// Signatures come out of the ceremony in signing order; hand them back in the
/// order this caller submitted its messages, repeats included.
fn in_request_order(response: KeysignResponse, messages: &[Vec<u8>]) -> TssResult<KeysignResponse> {
    if response.signatures.is_empty() {
        return Ok(response);
    }
    let by_msg: HashMap<String, Signature> = response
        .signatures
        .into_iter()
        .map(|sig| (sig.msg.clone(), sig))
        .collect();
    let signatures = messages
        .iter()
        .map(|message| {
            by_msg
                .get(&STANDARD.encode(message))
                .cloned()
                .ok_or_else(|| TssError::Internal("ceremony result is missing a requested message".into()))
        })
        .collect::<TssResult<Vec<_>>>()?;
    Ok(KeysignResponse { signatures, ..response })
}

fn dispatch(coordinator: &PartyCoordinator, ceremonies: &DashMap<String, CeremonySlot>, message: InboundMessage) {
    match message.protocol {
        ProtocolId::JoinParty => coordinator.on_message(&message.peer_id, &message.payload),
        ProtocolId::Tss => {
            let wrapped = match WrappedMessage::decode(&message.payload) {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    warn!(peer = %message.peer_id, error = %e, "malformed ceremony message");
                    return;
                }
            };
            match ceremonies.get(&wrapped.msg_id) {
                Some(slot) => {
                    let msg_id = wrapped.msg_id.clone();
                    if slot.inbound.send((message.peer_id, wrapped)).is_err() {
                        debug!(msg_id = %msg_id, "ceremony already finished");
                    }
                }
                None => debug!(msg_id = %wrapped.msg_id, peer = %message.peer_id, "message for unknown ceremony dropped"),
            }
        }
    }
}
