//! Accountability: attribute a failed ceremony to specific peers.
//!
//! The manager never talks to the network. The round runner feeds it the last
//! outbound message, the router feeds it received shares and equivocation
//! evidence, and on failure the runner asks it for a verdict with the router's
//! pending confirmations passed in as explicit context.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::mpc::RoundSpec;
use crate::router::PendingBroadcast;
use crate::types::{PartyId, PartyIdMap, PeerId};

pub const BLAME_TSS_TIMEOUT: &str = "tss timeout";
pub const BLAME_FAIL_JOIN_PARTY: &str = "fail to join party";
pub const BLAME_HASH_CHECK: &str = "hash check failed";
pub const BLAME_SIGNATURE_VERIFY: &str = "signature verification failed";
pub const BLAME_ENGINE_START: &str = "fail to start engine";
pub const BLAME_EXIT_SIGNAL: &str = "received exit signal";
pub const BLAME_ENGINE_FAILURE: &str = "tss engine failure";
pub const BLAME_INVALID_SHARE: &str = "invalid share";
pub const BLAME_SAVE_STATE: &str = "fail to save key share";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameNode {
    pub pub_key: String,
    pub blame_data: Vec<u8>, // evidence, e.g. the conflicting hashes
}

impl BlameNode {
    pub fn new(pub_key: &str) -> Self {
        BlameNode {
            pub_key: pub_key.to_string(),
            blame_data: Vec::new(),
        }
    }
}

/// Accountability record attached to a failed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: String,
    pub is_unicast: bool,
    pub round: String,
    pub blame_nodes: Vec<BlameNode>,
}

impl Blame {
    pub fn new(reason: &str, nodes: Vec<BlameNode>) -> Self {
        let mut blame = Blame {
            fail_reason: reason.to_string(),
            ..Default::default()
        };
        blame.add_blame_nodes(nodes);
        blame
    }

    pub fn set_blame(&mut self, reason: &str, nodes: Vec<BlameNode>, is_unicast: bool, round: &str) {
        self.fail_reason = reason.to_string();
        self.is_unicast = is_unicast;
        self.round = round.to_string();
        self.add_blame_nodes(nodes);
    }

    /// Append nodes not yet accused, keeping first-accused order.
    pub fn add_blame_nodes(&mut self, nodes: Vec<BlameNode>) {
        for node in nodes {
            if !self.blame_nodes.iter().any(|n| n.pub_key == node.pub_key) {
                self.blame_nodes.push(node);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_empty() && self.blame_nodes.is_empty()
    }

    pub fn pub_keys(&self) -> Vec<&str> {
        self.blame_nodes.iter().map(|n| n.pub_key.as_str()).collect()
    }
}

/// Last message the local engine emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub round: String,
    pub is_broadcast: bool,
}

pub struct BlameManager {
    blame: Mutex<Blame>,
    last_msg: Mutex<Option<LastMessage>>,
    shares: Mutex<HashMap<String, HashSet<u16>>>, // round -> senders seen
    candidates: Mutex<HashMap<String, BTreeSet<PeerId>>>,
    party_map: Arc<PartyIdMap>,
    local: PartyId,
    threshold: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Blame bookkeeping stays usable after a panicking writer.
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl BlameManager {
    pub fn new(party_map: Arc<PartyIdMap>, local: PartyId, threshold: usize) -> Self {
        BlameManager {
            blame: Mutex::new(Blame::default()),
            last_msg: Mutex::new(None),
            shares: Mutex::new(HashMap::new()),
            candidates: Mutex::new(HashMap::new()),
            party_map,
            local,
            threshold,
        }
    }

    /// Snapshot of the accumulated record.
    pub fn blame(&self) -> Blame {
        lock(&self.blame).clone()
    }

    pub fn set_last_msg(&self, round: &str, is_broadcast: bool) {
        *lock(&self.last_msg) = Some(LastMessage {
            round: round.to_string(),
            is_broadcast,
        });
    }

    pub fn last_msg(&self) -> Option<LastMessage> {
        lock(&self.last_msg).clone()
    }

    /// Note that `from` delivered its share for `round`.
    pub fn record_share(&self, round: &str, from: u16) {
        lock(&self.shares).entry(round.to_string()).or_default().insert(from);
    }

    pub fn candidates(&self, round: &str) -> Vec<PeerId> {
        lock(&self.candidates)
            .get(round)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Accuse `owner` of sending conflicting broadcasts for `round`.
    /// `dissenters` reported a hash different from ours and are kept as
    /// candidates, not accused.
    pub fn record_equivocation(&self, round: &str, owner: &PeerId, dissenters: &[PeerId], evidence: Vec<u8>) {
        if !dissenters.is_empty() {
            lock(&self.candidates)
                .entry(round.to_string())
                .or_default()
                .extend(dissenters.iter().cloned());
        }
        let Some(pub_key) = self.party_map.pub_key_of_peer(owner) else {
            warn!(peer = %owner, "equivocating peer is not in the party map");
            return;
        };
        let node = BlameNode {
            pub_key: pub_key.to_string(),
            blame_data: evidence,
        };
        warn!(peer = %owner, round, "broadcast equivocation detected");
        lock(&self.blame).set_blame(BLAME_HASH_CHECK, vec![node], false, round);
    }

    /// Accuse the party the engine caught sending a bad contribution in `round`.
    pub fn record_culprit(&self, round: &str, index: u16, is_unicast: bool) {
        let Some(peer) = self.party_map.peer_of(index).cloned() else {
            warn!(index, round, "engine blamed a party outside the roster");
            self.set_fail_reason(BLAME_ENGINE_FAILURE);
            return;
        };
        warn!(peer = %peer, round, "engine rejected a party's contribution");
        let nodes = self.to_nodes(&[peer]);
        lock(&self.blame).set_blame(BLAME_INVALID_SHARE, nodes, is_unicast, round);
    }

    /// Record a failure that names nobody (engine start, shutdown, verification).
    pub fn set_fail_reason(&self, reason: &str) {
        let mut blame = lock(&self.blame);
        if blame.blame_nodes.is_empty() {
            blame.fail_reason = reason.to_string();
        }
    }

    /// Blame everyone in the roster that did not make it into `online`.
    pub fn join_party_blame(&self, online: &[PeerId]) -> Blame {
        let online: HashSet<&PeerId> = online.iter().collect();
        let absent: Vec<PeerId> = self
            .party_map
            .peer_ids()
            .into_iter()
            .filter(|p| !online.contains(p) && self.party_map.party_of(p).map(|x| x.index) != Some(self.local.index))
            .collect();

        let nodes = self.to_nodes(&absent);
        let mut blame = lock(&self.blame);
        blame.set_blame(BLAME_FAIL_JOIN_PARTY, nodes, false, "");
        info!(absent = absent.len(), "join party blame computed");
        blame.clone()
    }

    /// Non-local parties that never delivered their `round` message to us.
    pub fn unicast_blame(&self, round: &str) -> Vec<PeerId> {
        let shares = lock(&self.shares);
        let seen = shares.get(round);
        self.remote_parties()
            .filter(|p| seen.is_none_or(|s| !s.contains(&p.index)))
            .filter_map(|p| self.party_map.peer_of(p.index).cloned())
            .collect()
    }

    /// Senders missing from `round`, plus peers that still owe a confirmation
    /// for one of its pending broadcasts.
    pub fn broadcast_blame(&self, round: &str, pending: &[PendingBroadcast]) -> Vec<PeerId> {
        let mut accused: BTreeSet<PeerId> = self.unicast_blame(round).into_iter().collect();

        for item in pending.iter().filter(|p| p.round == round && p.has_message) {
            for peer in self.party_map.peer_ids() {
                let is_owner = self.party_map.party_of(&peer).map(|p| p.index) == Some(item.owner);
                if !is_owner && !item.confirmed_by.contains(&peer) {
                    accused.insert(peer);
                }
            }
        }

        if let Some(local_peer) = self.party_map.peer_of(self.local.index) {
            accused.remove(local_peer);
        }
        self.in_roster_order(accused)
    }

    /// Walk the rounds in protocol order; the first with missing senders wins.
    pub fn missing_share_blame(&self, rounds: &[RoundSpec]) -> Option<(String, Vec<PeerId>)> {
        rounds.iter().find_map(|r| {
            let missing = self.unicast_blame(&r.label);
            (!missing.is_empty()).then(|| (r.label.clone(), missing))
        })
    }

    /// Verdict for a round timeout. Returns the accumulated record.
    pub fn on_timeout(&self, rounds: &[RoundSpec], pending: &[PendingBroadcast]) -> Blame {
        if !lock(&self.blame).blame_nodes.is_empty() {
            return self.blame();
        }

        let (mut round, mut is_unicast, mut accused) = match self.last_msg() {
            Some(last) if !last.is_broadcast => {
                let accused = self.unicast_blame(&last.round);
                (last.round, true, accused)
            }
            Some(last) => {
                let accused = self.broadcast_blame(&last.round, pending);
                (last.round, false, accused)
            }
            None => (String::new(), false, Vec::new()),
        };

        if accused.is_empty() {
            if let Some((scan_round, missing)) = self.missing_share_blame(rounds) {
                is_unicast = rounds.iter().any(|r| r.label == scan_round && !r.broadcast);
                round = scan_round;
                accused = missing;
            }
        }

        let nodes = if accused.len() > self.threshold {
            // Too many to attribute to individual peers.
            warn!(count = accused.len(), threshold = self.threshold, round = %round, "timeout not attributable");
            Vec::new()
        } else {
            self.to_nodes(&accused)
        };
        debug!(round = %round, accused = nodes.len(), "timeout blame computed");

        let mut blame = lock(&self.blame);
        blame.set_blame(BLAME_TSS_TIMEOUT, nodes, is_unicast, &round);
        blame.clone()
    }

    fn remote_parties(&self) -> impl Iterator<Item = &PartyId> {
        self.party_map.parties().iter().filter(|p| p.index != self.local.index)
    }

    fn in_roster_order(&self, set: BTreeSet<PeerId>) -> Vec<PeerId> {
        self.party_map.peer_ids().into_iter().filter(|p| set.contains(p)).collect()
    }

    fn to_nodes(&self, peers: &[PeerId]) -> Vec<BlameNode> {
        peers
            .iter()
            .filter_map(|p| self.party_map.pub_key_of_peer(p))
            .map(BlameNode::new)
            .collect()
    }
}
