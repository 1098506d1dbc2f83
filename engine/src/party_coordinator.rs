//! Join-party: form a quorum before a ceremony starts.
//!
//! One leader per ceremony is picked deterministically from the ceremony id.
//! Everyone else keeps asking the leader to be let in; the leader waits for the
//! full roster or its window to close and then tells every joined peer who is
//! on standby.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::JoinPartyConfig;
use crate::error::JoinPartyError;
use crate::messages::{JoinPartyMessage, JoinPartyOutcome, ProtocolId};
use crate::transport::Transport;
use crate::types::PeerId;

type JoinResponse = (JoinPartyOutcome, Vec<PeerId>);

enum Session {
    Leader {
        expected: HashSet<PeerId>,
        joined: Mutex<HashSet<PeerId>>,
        all_joined: Notify,
    },
    Requester {
        leader: PeerId,
        response: watch::Sender<Option<JoinResponse>>,
    },
}

/// Resolves once `shutdown` flips to true. A dropped sender never fires.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct PartyCoordinator {
    transport: Arc<dyn Transport>,
    config: JoinPartyConfig,
    sessions: DashMap<String, Arc<Session>>,
}

impl PartyCoordinator {
    pub fn new(transport: Arc<dyn Transport>, config: JoinPartyConfig) -> Self {
        PartyCoordinator {
            transport,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Run join-party for `msg_id` over the full roster `peers` (local included).
    ///
    /// Returns the standby roster on success. On failure the error carries the
    /// peers that did make it, so the caller can blame the rest.
    pub async fn join_party_with_retry(
        &self,
        msg_id: &str,
        leader: &PeerId,
        peers: &[PeerId],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<PeerId>, JoinPartyError> {
        let local = self.transport.local_peer_id();
        let result = if &local == leader {
            self.lead(msg_id, &local, peers, shutdown).await
        } else {
            self.request(msg_id, leader, peers, shutdown).await
        };
        self.sessions.remove(msg_id);
        result
    }

    async fn lead(
        &self,
        msg_id: &str,
        local: &PeerId,
        peers: &[PeerId],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<PeerId>, JoinPartyError> {
        let expected: HashSet<PeerId> = peers.iter().filter(|p| *p != local).cloned().collect();
        let session = Arc::new(Session::Leader {
            expected: expected.clone(),
            joined: Mutex::new(HashSet::new()),
            all_joined: Notify::new(),
        });
        self.sessions.insert(msg_id.to_string(), session.clone());
        let Session::Leader { joined, all_joined, .. } = session.as_ref() else {
            return Err(JoinPartyError::Message("leader session expected".into()));
        };
        info!(msg_id, expected = expected.len(), "leading join party");

        let wait_all = async {
            loop {
                let done = joined.lock().map(|j| j.len() >= expected.len()).unwrap_or(false);
                if done {
                    break;
                }
                all_joined.notified().await;
            }
        };
        tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown) => return Err(JoinPartyError::Aborted),
            _ = timeout(self.config.timeout, wait_all) => {}
        }

        let joined: HashSet<PeerId> = joined
            .lock()
            .map(|j| j.clone())
            .map_err(|_| JoinPartyError::Message("join party state poisoned".into()))?;
        let mut standby: Vec<PeerId> = joined.iter().cloned().chain(std::iter::once(local.clone())).collect();
        standby.sort();
        let outcome = if joined.len() >= expected.len() {
            JoinPartyOutcome::Success
        } else {
            JoinPartyOutcome::Timeout
        };

        let response = JoinPartyMessage::Response {
            id: msg_id.to_string(),
            outcome,
            peer_ids: standby.clone(),
        }
        .encode()
        .map_err(|e| JoinPartyError::Message(e.to_string()))?;
        for peer in &joined {
            if let Err(e) = self.transport.send(peer, ProtocolId::JoinParty, response.clone()).await {
                warn!(msg_id, peer = %peer, error = %e, "failed to send join party response");
            }
        }

        match outcome {
            JoinPartyOutcome::Success => Ok(standby),
            _ => {
                let absent = absent_from(peers, &standby);
                warn!(msg_id, absent = absent.len(), "join party timed out");
                Err(JoinPartyError::Timeout { online: standby, absent })
            }
        }
    }

    async fn request(
        &self,
        msg_id: &str,
        leader: &PeerId,
        peers: &[PeerId],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<PeerId>, JoinPartyError> {
        let (tx, mut rx) = watch::channel(None);
        self.sessions.insert(
            msg_id.to_string(),
            Arc::new(Session::Requester {
                leader: leader.clone(),
                response: tx,
            }),
        );
        let request = JoinPartyMessage::Request { id: msg_id.to_string() }
            .encode()
            .map_err(|e| JoinPartyError::Message(e.to_string()))?;

        for attempt in 1..=self.config.max_attempts {
            if let Err(e) = self.transport.send(leader, ProtocolId::JoinParty, request.clone()).await {
                debug!(msg_id, leader = %leader, attempt, error = %e, "join party request not delivered");
            }

            let response = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return Err(JoinPartyError::Aborted),
                r = timeout(self.config.retry_interval, rx.wait_for(Option::is_some)) => r,
            };
            let Ok(Ok(response)) = response else {
                continue;
            };
            let Some((outcome, online)) = response.clone() else {
                continue;
            };

            return match outcome {
                JoinPartyOutcome::Success => {
                    debug!(msg_id, attempt, "joined party");
                    Ok(online)
                }
                JoinPartyOutcome::Timeout => Err(JoinPartyError::Timeout {
                    absent: absent_from(peers, &online),
                    online,
                }),
                JoinPartyOutcome::Unknown => Err(JoinPartyError::Message("leader answered unknown".into())),
            };
        }

        // The leader never answered: everyone but the leader counts as online.
        warn!(msg_id, leader = %leader, "no answer from join party leader");
        let online: Vec<PeerId> = peers.iter().filter(|p| *p != leader).cloned().collect();
        Err(JoinPartyError::Timeout {
            online,
            absent: vec![leader.clone()],
        })
    }

    /// Feed one inbound join-party delivery.
    pub fn on_message(&self, from: &PeerId, payload: &[u8]) {
        let message = match JoinPartyMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "malformed join party message");
                return;
            }
        };
        let id = match &message {
            JoinPartyMessage::Request { id } | JoinPartyMessage::Response { id, .. } => id.clone(),
        };
        let Some(session) = self.sessions.get(&id).map(|s| s.value().clone()) else {
            debug!(msg_id = %id, peer = %from, "join party message for unknown ceremony dropped");
            return;
        };

        match (session.as_ref(), message) {
            (Session::Leader { expected, joined, all_joined }, JoinPartyMessage::Request { .. }) => {
                if !expected.contains(from) {
                    warn!(msg_id = %id, peer = %from, "join request from unexpected peer");
                    return;
                }
                if let Ok(mut joined) = joined.lock() {
                    if joined.insert(from.clone()) && joined.len() >= expected.len() {
                        all_joined.notify_one();
                    }
                }
            }
            (Session::Requester { leader, response }, JoinPartyMessage::Response { outcome, peer_ids, .. }) => {
                if from != leader {
                    warn!(msg_id = %id, peer = %from, "join response from non-leader");
                    return;
                }
                response.send_replace(Some((outcome, peer_ids)));
            }
            _ => debug!(msg_id = %id, peer = %from, "join party message does not match our role"),
        }
    }
}

fn absent_from(peers: &[PeerId], online: &[PeerId]) -> Vec<PeerId> {
    peers.iter().filter(|p| !online.contains(p)).cloned().collect()
}
