//! Round runner: one ceremony from quorum formation to a final outcome.
//!
//! INIT -> SYNCING (join party) -> RUNNING -> DONE | TIMED_OUT | ABORTED | FAILED
//!
//! While RUNNING, two tasks cooperate with the runner loop: the engine task and
//! the inbound pump (transport -> router -> engine). Both stop on one shared
//! cancellation token and the runner waits for both before returning.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::blame::{
    BLAME_ENGINE_FAILURE, BLAME_ENGINE_START, BLAME_EXIT_SIGNAL, BLAME_FAIL_JOIN_PARTY, BLAME_SAVE_STATE,
    BLAME_SIGNATURE_VERIFY, BLAME_TSS_TIMEOUT, Blame, BlameManager,
};
use crate::conversion::leader_index;
use crate::error::{EngineError, JoinPartyError, TssError};
use crate::messages::{MessageType, WireMessage, WrappedMessage};
use crate::mpc::{EngineIo, KeygenOutput, MpcEngine, PartyParams, SignatureData, engine_channels};
use crate::notifier::Notifier;
use crate::party_coordinator::{PartyCoordinator, wait_for_shutdown};
use crate::router::MessageRouter;
use crate::status::TssStatus;
use crate::storage::{KeygenLocalState, LocalStateManager};
use crate::transport::Transport;
use crate::types::{CeremonyKind, PartyId, PartyIdMap, PeerId};

/// Inbound ceremony traffic, already demultiplexed by ceremony id.
pub type CeremonyInbound = mpsc::UnboundedReceiver<(PeerId, WrappedMessage)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyState {
    Init,
    Syncing,
    Running,
    Done,
    TimedOut,
    Aborted,
    Failed,
}

impl CeremonyState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CeremonyState::Init | CeremonyState::Syncing | CeremonyState::Running)
    }
}

impl fmt::Display for CeremonyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CeremonyState::Init => "INIT",
            CeremonyState::Syncing => "SYNCING",
            CeremonyState::Running => "RUNNING",
            CeremonyState::Done => "DONE",
            CeremonyState::TimedOut => "TIMED_OUT",
            CeremonyState::Aborted => "ABORTED",
            CeremonyState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Everything the runner needs to know about one ceremony.
#[derive(Debug, Clone)]
pub struct CeremonySetup {
    pub msg_id: String,
    pub kind: CeremonyKind,
    pub parties: Vec<PartyId>, // sorted by index
    pub local: PartyId,
    pub threshold: usize,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct CeremonyOutcome<T> {
    pub msg_id: String,
    pub state: CeremonyState,
    pub result: Option<T>,
    pub blame: Blame,
    pub error: Option<TssError>,
}

impl<T> CeremonyOutcome<T> {
    fn terminal(msg_id: &str, state: CeremonyState, blame: Blame, error: TssError) -> Self {
        CeremonyOutcome {
            msg_id: msg_id.to_string(),
            state,
            result: None,
            blame,
            error: Some(error),
        }
    }
}

pub struct RoundRunner {
    transport: Arc<dyn Transport>,
    coordinator: Arc<PartyCoordinator>,
    engine: Arc<dyn MpcEngine>,
    status: Arc<TssStatus>,
    shutdown: watch::Receiver<bool>,
}

fn message_type(kind: CeremonyKind) -> MessageType {
    match kind {
        CeremonyKind::Keygen => MessageType::KeygenMsg,
        CeremonyKind::Keysign => MessageType::KeysignMsg,
    }
}

impl RoundRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        coordinator: Arc<PartyCoordinator>,
        engine: Arc<dyn MpcEngine>,
        status: Arc<TssStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        RoundRunner {
            transport,
            coordinator,
            engine,
            status,
            shutdown,
        }
    }

    /// Drive one ceremony. `start_engine` builds the engine future once the
    /// quorum is formed; it runs on its own task.
    pub async fn run<T, F, Fut>(&self, setup: CeremonySetup, inbound: CeremonyInbound, start_engine: F) -> CeremonyOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce(PartyParams, EngineIo) -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let msg_id = setup.msg_id.as_str();
        let mut state = CeremonyState::Init;
        debug!(msg_id, kind = %setup.kind, state = %state, parties = setup.parties.len(), "ceremony created");

        // INIT
        let party_map = match PartyIdMap::new(&setup.parties) {
            Ok(map) => Arc::new(map),
            Err(e) => {
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, Blame::new(BLAME_ENGINE_START, vec![]), e);
            }
        };
        let blame = Arc::new(BlameManager::new(party_map.clone(), setup.local.clone(), setup.threshold));
        if let Err(e) = self.engine.preflight() {
            error!(msg_id, error = %e, "engine preflight failed");
            blame.set_fail_reason(BLAME_ENGINE_START);
            return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, blame.blame(), TssError::EngineStart(e.to_string()));
        }

        // SYNCING
        state = self.transition(msg_id, state, CeremonyState::Syncing);
        let leader = match self.elect_leader(msg_id, &setup.parties, &party_map) {
            Ok(leader) => leader,
            Err(e) => {
                blame.set_fail_reason(BLAME_FAIL_JOIN_PARTY);
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, blame.blame(), e);
            }
        };
        let mut shutdown = self.shutdown.clone();
        let peers = party_map.peer_ids();
        match self.coordinator.join_party_with_retry(msg_id, &leader, &peers, &mut shutdown).await {
            Ok(online) => debug!(msg_id, online = online.len(), "quorum formed"),
            Err(JoinPartyError::Timeout { online, absent }) => {
                let blame = blame.join_party_blame(&online);
                self.transition(msg_id, state, CeremonyState::Failed);
                let absent = absent.iter().map(ToString::to_string).collect();
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, blame, TssError::JoinTimeout(absent));
            }
            Err(JoinPartyError::Aborted) => {
                blame.set_fail_reason(BLAME_EXIT_SIGNAL);
                self.transition(msg_id, state, CeremonyState::Aborted);
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Aborted, blame.blame(), TssError::ExternalAbort);
            }
            Err(e) => {
                blame.set_fail_reason(BLAME_FAIL_JOIN_PARTY);
                self.transition(msg_id, state, CeremonyState::Failed);
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, blame.blame(), TssError::Internal(e.to_string()));
            }
        }

        // RUNNING
        state = self.transition(msg_id, state, CeremonyState::Running);
        let router = match MessageRouter::new(
            msg_id,
            message_type(setup.kind),
            setup.local.clone(),
            party_map.clone(),
            self.transport.clone(),
        ) {
            Ok(router) => Arc::new(router),
            Err(e) => {
                blame.set_fail_reason(BLAME_ENGINE_START);
                return CeremonyOutcome::terminal(msg_id, CeremonyState::Failed, blame.blame(), e);
            }
        };

        let (io, handle) = engine_channels();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let params = PartyParams {
            parties: setup.parties.clone(),
            local: setup.local.clone(),
            threshold: setup.threshold,
        };

        let engine_fut = start_engine(params, io);
        let mut engine_cancel = cancel_rx.clone();
        let mut engine_task: JoinHandle<Option<Result<T, EngineError>>> = tokio::spawn(async move {
            tokio::select! {
                result = engine_fut => Some(result),
                _ = cancelled(&mut engine_cancel) => None,
            }
        });
        let pump_task = tokio::spawn(pump_inbound(
            inbound,
            handle.inbound,
            router.clone(),
            blame.clone(),
            cancel_rx,
        ));

        let mut outbound = handle.outbound;
        let deadline = tokio::time::sleep(setup.timeout);
        tokio::pin!(deadline);

        let mut engine_finished = false;
        let mut result = None;
        let mut failure = None;
        let final_state = loop {
            tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => {
                    warn!(msg_id, "ceremony aborted by shutdown");
                    blame.set_fail_reason(BLAME_EXIT_SIGNAL);
                    failure = Some(TssError::ExternalAbort);
                    break CeremonyState::Aborted;
                }

                Some(msg) = outbound.recv() => {
                    self.route_outbound(&router, &blame, &msg).await;
                }

                joined = &mut engine_task => {
                    engine_finished = true;
                    // Everything the engine emitted before finishing still goes out, in order.
                    while let Ok(msg) = outbound.try_recv() {
                        self.route_outbound(&router, &blame, &msg).await;
                    }
                    match joined {
                        Ok(Some(Ok(value))) => {
                            result = Some(value);
                            break CeremonyState::Done;
                        }
                        Ok(Some(Err(EngineError::Start(reason)))) => {
                            error!(msg_id, reason = %reason, "engine failed to start");
                            blame.set_fail_reason(BLAME_ENGINE_START);
                            failure = Some(TssError::EngineStart(reason));
                            break CeremonyState::Failed;
                        }
                        Ok(Some(Err(EngineError::Culprit { party, round, reason }))) => {
                            error!(msg_id, party, round = %round, reason = %reason, "engine caught a misbehaving party");
                            let is_unicast = self.engine.rounds(setup.kind).iter().any(|r| r.label == round && !r.broadcast);
                            blame.record_culprit(&round, party, is_unicast);
                            failure = Some(TssError::Engine(EngineError::Culprit { party, round, reason }));
                            break CeremonyState::Failed;
                        }
                        Ok(Some(Err(e))) => {
                            error!(msg_id, error = %e, "engine failed");
                            blame.set_fail_reason(BLAME_ENGINE_FAILURE);
                            failure = Some(TssError::Engine(e));
                            break CeremonyState::Failed;
                        }
                        Ok(None) => {
                            blame.set_fail_reason(BLAME_ENGINE_FAILURE);
                            failure = Some(TssError::Internal("engine cancelled".into()));
                            break CeremonyState::Failed;
                        }
                        Err(e) => {
                            error!(msg_id, error = %e, "engine task died");
                            blame.set_fail_reason(BLAME_ENGINE_FAILURE);
                            failure = Some(TssError::Internal(format!("engine task: {e}")));
                            break CeremonyState::Failed;
                        }
                    }
                }

                _ = &mut deadline => {
                    let rounds = self.engine.rounds(setup.kind);
                    let pending = router.pending_snapshot();
                    let verdict = blame.on_timeout(&rounds, &pending);
                    warn!(
                        msg_id,
                        round = %verdict.round,
                        blamed = verdict.blame_nodes.len(),
                        pending = pending.len(),
                        "ceremony timed out"
                    );
                    failure = Some(TssError::RoundTimeout);
                    break CeremonyState::TimedOut;
                }
            }
        };

        // Stop both tasks and wait for them; partial engine state is dropped here.
        let _ = cancel_tx.send(true);
        if !engine_finished {
            engine_task.abort();
            let _ = engine_task.await;
        }
        let _ = pump_task.await;
        router.clear();

        self.transition(msg_id, state, final_state);
        let mut blame = blame.blame();
        if final_state == CeremonyState::TimedOut && blame.fail_reason.is_empty() {
            blame.fail_reason = BLAME_TSS_TIMEOUT.to_string();
        }
        CeremonyOutcome {
            msg_id: msg_id.to_string(),
            state: final_state,
            result,
            blame,
            error: failure,
        }
    }

    /// Keygen, then persist the share. A share that cannot be stored fails the ceremony.
    pub async fn run_keygen(
        &self,
        setup: CeremonySetup,
        inbound: CeremonyInbound,
        state_manager: &dyn LocalStateManager,
        participant_keys: &[String],
    ) -> CeremonyOutcome<KeygenOutput> {
        let engine = self.engine.clone();
        let local_key = setup.local.pub_key.clone();
        let mut outcome = self
            .run(setup, inbound, move |params, io| async move { engine.keygen(params, io).await })
            .await;

        if let Some(output) = &outcome.result {
            let state = KeygenLocalState {
                pub_key: hex::encode(&output.pub_key),
                local_data: hex::encode(output.local_data.as_slice()),
                participant_keys: participant_keys.to_vec(),
                local_party_key: local_key,
            };
            if let Err(e) = state_manager.save_local_state(&state) {
                error!(msg_id = %outcome.msg_id, error = %e, "failed to persist key share");
                outcome.state = CeremonyState::Failed;
                outcome.result = None;
                outcome.blame.fail_reason = BLAME_SAVE_STATE.to_string();
                outcome.error = Some(TssError::Storage(e));
            }
        }
        outcome
    }

    /// Keysign, then hand the signatures to `notifier` and wait for its verdict.
    pub async fn run_keysign(
        &self,
        setup: CeremonySetup,
        inbound: CeremonyInbound,
        local_data: Zeroizing<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        notifier: Arc<Notifier>,
    ) -> CeremonyOutcome<Vec<SignatureData>> {
        let engine = self.engine.clone();
        let mut outcome = self
            .run(setup, inbound, move |params, io| async move {
                engine.keysign(params, local_data, messages, io).await
            })
            .await;

        match outcome.result.take() {
            Some(signatures) => {
                if let Err(e) = notifier.process_signature(Some(signatures)) {
                    outcome.state = CeremonyState::Failed;
                    outcome.blame.fail_reason = BLAME_SIGNATURE_VERIFY.to_string();
                    outcome.error = Some(e.into());
                    let _ = notifier.process_signature(None);
                }
            }
            None => {
                let _ = notifier.process_signature(None);
            }
        }

        match notifier.wait().await {
            Ok(Some(signatures)) => outcome.result = Some(signatures),
            Ok(None) => {
                if outcome.state == CeremonyState::Done {
                    outcome.state = CeremonyState::Failed;
                }
            }
            Err(e) => {
                outcome.state = CeremonyState::Failed;
                outcome.error.get_or_insert(e.into());
            }
        }
        if outcome.state != CeremonyState::Done && outcome.blame.fail_reason.is_empty() {
            outcome.blame.fail_reason = BLAME_ENGINE_FAILURE.to_string();
        }
        outcome
    }

    fn elect_leader(&self, msg_id: &str, parties: &[PartyId], party_map: &PartyIdMap) -> Result<PeerId, TssError> {
        let index = leader_index(msg_id.as_bytes(), parties.len())?;
        let leader = party_map
            .peer_of(parties[index].index)
            .cloned()
            .ok_or_else(|| TssError::Internal("leader is not in the party map".into()))?;
        debug!(msg_id, leader = %leader, "join party leader elected");
        Ok(leader)
    }

    async fn route_outbound(&self, router: &MessageRouter, blame: &BlameManager, msg: &WireMessage) {
        self.status.set_current_round(&msg.round_info);
        blame.set_last_msg(&msg.round_info, msg.routing.is_broadcast);
        if let Err(e) = router.process_outbound(msg).await {
            warn!(round = %msg.round_info, error = %e, "failed to route outbound message");
        }
    }

    fn transition(&self, msg_id: &str, from: CeremonyState, to: CeremonyState) -> CeremonyState {
        if to.is_terminal() {
            info!(msg_id, from = %from, to = %to, "ceremony finished");
        } else {
            debug!(msg_id, from = %from, to = %to, "ceremony state change");
        }
        to
    }
}

/// Resolves when the ceremony's cancellation token fires or its owner is gone.
async fn cancelled(token: &mut watch::Receiver<bool>) {
    let _ = token.wait_for(|cancelled| *cancelled).await;
}

/// Transport -> router -> engine, until cancelled or either side goes away.
async fn pump_inbound(
    mut inbound: CeremonyInbound,
    engine_inbound: mpsc::Sender<WireMessage>,
    router: Arc<MessageRouter>,
    blame: Arc<BlameManager>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            delivery = inbound.recv() => delivery,
        };
        let Some((from, wrapped)) = delivery else {
            break;
        };
        match router.process_inbound(&from, wrapped, &blame).await {
            Ok(Some(msg)) => {
                if engine_inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(peer = %from, error = %e, "dropping inbound message"),
        }
    }
}
