//! Reliable-broadcast emulation on top of point-to-point delivery.
//!
//! Every broadcast payload is echoed as a hash to all other non-owner peers.
//! A payload reaches the engine only once every non-owner party has reported
//! the same hash for its (sender, round) slot; disagreeing hashes are
//! equivocation evidence against the owner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace, warn};

use crate::blame::BlameManager;
use crate::error::{TssError, TssResult};
use crate::messages::{BroadcastConfirmMessage, MessageType, ProtocolId, WireMessage, WrappedMessage};
use crate::transport::Transport;
use crate::types::{PartyId, PartyIdMap, PeerId};

/// Unconfirmed broadcast slot.
#[derive(Debug, Default)]
struct LocalCacheItem {
    round: String,
    owner: u16,
    msg: Option<WireMessage>,
    hash: Option<String>,                // hash of the payload we received
    confirmed: HashMap<PeerId, String>, // confirming peer -> hash it reports
}

/// Unconfirmed broadcast, as seen by the blame manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBroadcast {
    pub key: String,
    pub round: String,
    pub owner: u16,
    pub confirmed_by: Vec<PeerId>,
    pub has_message: bool,
}

pub struct MessageRouter {
    msg_id: String,
    message_type: MessageType,
    local: PartyId,
    local_peer: PeerId,
    party_map: Arc<PartyIdMap>,
    transport: Arc<dyn Transport>,
    cache: DashMap<String, Arc<Mutex<LocalCacheItem>>>,
    settled: DashSet<String>, // released or rejected keys
}

fn lock(item: &Mutex<LocalCacheItem>) -> MutexGuard<'_, LocalCacheItem> {
    match item.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Split a cache key `"{owner}-{round}"`.
fn parse_key(key: &str) -> Option<(u16, &str)> {
    let (owner, round) = key.split_once('-')?;
    Some((owner.parse().ok()?, round))
}

impl MessageRouter {
    pub fn new(
        msg_id: &str,
        message_type: MessageType,
        local: PartyId,
        party_map: Arc<PartyIdMap>,
        transport: Arc<dyn Transport>,
    ) -> TssResult<Self> {
        let local_peer = party_map
            .peer_of(local.index)
            .cloned()
            .ok_or_else(|| TssError::Internal("local party is not in the party map".into()))?;
        Ok(MessageRouter {
            msg_id: msg_id.to_string(),
            message_type,
            local,
            local_peer,
            party_map,
            transport,
            cache: DashMap::new(),
            settled: DashSet::new(),
        })
    }

    /// Wrap an engine message and send it to its recipients.
    ///
    /// A failed send to one peer is logged and does not stop delivery to the
    /// rest; the peer's silence surfaces later through blame.
    pub async fn process_outbound(&self, msg: &WireMessage) -> TssResult<()> {
        let wrapped = WrappedMessage::new(self.message_type, &self.msg_id, msg)?;
        let bytes = wrapped.encode()?;

        let targets: Vec<PeerId> = if msg.routing.is_broadcast {
            self.party_map.peers_except(&self.local_peer)
        } else {
            msg.routing
                .to
                .iter()
                .map(|p| {
                    self.party_map
                        .peer_of(p.index)
                        .cloned()
                        .ok_or_else(|| TssError::InvalidMessage(format!("unknown recipient party {}", p.index)))
                })
                .collect::<TssResult<_>>()?
        };

        for peer in &targets {
            if let Err(e) = self.transport.send(peer, ProtocolId::Tss, bytes.clone()).await {
                warn!(msg_id = %self.msg_id, peer = %peer, round = %msg.round_info, error = %e, "failed to send message");
            }
        }
        trace!(msg_id = %self.msg_id, round = %msg.round_info, recipients = targets.len(), "message routed");
        Ok(())
    }

    /// Handle one delivery. Returns a message when it is ready for the engine.
    pub async fn process_inbound(
        &self,
        from: &PeerId,
        wrapped: WrappedMessage,
        blame: &BlameManager,
    ) -> TssResult<Option<WireMessage>> {
        if wrapped.msg_id != self.msg_id {
            return Err(TssError::InvalidMessage(format!("foreign ceremony {}", wrapped.msg_id)));
        }
        let sender = self
            .party_map
            .party_of(from)
            .ok_or_else(|| TssError::InvalidMessage(format!("peer {from} is not a participant")))?;
        if sender.index == self.local.index {
            return Err(TssError::InvalidMessage("message from ourselves".into()));
        }

        if wrapped.message_type == self.message_type {
            let msg: WireMessage = wrapped.inner()?;
            if msg.routing.from.index != sender.index {
                return Err(TssError::InvalidMessage(format!(
                    "peer {from} claims to be party {}",
                    msg.routing.from.index
                )));
            }
            if msg.routing.is_broadcast {
                self.handle_broadcast(msg, blame).await
            } else {
                self.handle_unicast(msg, blame)
            }
        } else if wrapped.message_type == self.message_type.verification() {
            let confirm: BroadcastConfirmMessage = wrapped.inner()?;
            if &confirm.peer_id != from {
                return Err(TssError::InvalidMessage(format!(
                    "peer {from} confirms on behalf of {}",
                    confirm.peer_id
                )));
            }
            Ok(self.handle_confirm(confirm, sender.index, blame))
        } else {
            Err(TssError::InvalidMessage(format!(
                "unexpected message type {} in {} ceremony",
                wrapped.message_type, self.message_type
            )))
        }
    }

    fn handle_unicast(&self, msg: WireMessage, blame: &BlameManager) -> TssResult<Option<WireMessage>> {
        if !msg.routing.to.iter().any(|p| p.index == self.local.index) {
            return Err(TssError::InvalidMessage(format!(
                "unicast from party {} is not addressed to us",
                msg.routing.from.index
            )));
        }
        if !self.settled.insert(msg.cache_key()) {
            trace!(key = %msg.cache_key(), "duplicate unicast dropped");
            return Ok(None);
        }
        blame.record_share(&msg.round_info, msg.routing.from.index);
        Ok(Some(msg))
    }

    async fn handle_broadcast(&self, msg: WireMessage, blame: &BlameManager) -> TssResult<Option<WireMessage>> {
        let key = msg.cache_key();
        if self.settled.contains(&key) {
            trace!(key = %key, "late broadcast dropped");
            return Ok(None);
        }
        let hash = msg.content_hash();
        let round = msg.round_info.clone();
        let owner = msg.routing.from.index;
        let item = self.item(&key, &round, owner);

        {
            let mut item = lock(&item);
            match item.hash.clone() {
                Some(existing) if existing != hash => {
                    let evidence = format!("{existing},{hash}").into_bytes();
                    drop(item);
                    if let Some(owner_peer) = self.party_map.peer_of(owner) {
                        blame.record_equivocation(&round, owner_peer, &[], evidence);
                    }
                    self.settle(&key);
                    return Ok(None);
                }
                Some(_) => return Ok(None),
                None => {
                    item.msg = Some(msg);
                    item.hash = Some(hash.clone());
                    item.confirmed.insert(self.local_peer.clone(), hash.clone());
                }
            }
        }
        blame.record_share(&round, owner);

        self.send_confirmation(&key, &hash, owner).await?;
        Ok(self.try_release(&key, blame))
    }

    fn handle_confirm(&self, confirm: BroadcastConfirmMessage, from: u16, blame: &BlameManager) -> Option<WireMessage> {
        let Some((owner, round)) = parse_key(&confirm.key) else {
            warn!(key = %confirm.key, "malformed confirmation key");
            return None;
        };
        if owner == self.local.index || owner == from || self.party_map.peer_of(owner).is_none() {
            trace!(key = %confirm.key, from, "ignoring confirmation");
            return None;
        }
        if self.settled.contains(&confirm.key) {
            return None;
        }

        let item = self.item(&confirm.key, round, owner);
        lock(&item).confirmed.entry(confirm.peer_id).or_insert(confirm.hash);
        self.try_release(&confirm.key, blame)
    }

    async fn send_confirmation(&self, key: &str, hash: &str, owner: u16) -> TssResult<()> {
        let confirm = BroadcastConfirmMessage {
            peer_id: self.local_peer.clone(),
            key: key.to_string(),
            hash: hash.to_string(),
        };
        let bytes = WrappedMessage::new(self.message_type.verification(), &self.msg_id, &confirm)?.encode()?;
        let owner_peer = self.party_map.peer_of(owner);

        for peer in self.party_map.peers_except(&self.local_peer) {
            if Some(&peer) == owner_peer {
                continue;
            }
            if let Err(e) = self.transport.send(&peer, ProtocolId::Tss, bytes.clone()).await {
                warn!(msg_id = %self.msg_id, peer = %peer, key, error = %e, "failed to send confirmation");
            }
        }
        Ok(())
    }

    /// Release or reject the slot once every non-owner party has confirmed.
    fn try_release(&self, key: &str, blame: &BlameManager) -> Option<WireMessage> {
        let item = self.cache.get(key).map(|entry| entry.value().clone())?;
        let mut item = lock(&item);

        if item.msg.is_none() || item.confirmed.len() < self.party_map.len() - 1 {
            return None;
        }
        let local_hash = item.hash.clone()?;
        let dissenters: Vec<PeerId> = item
            .confirmed
            .iter()
            .filter(|(_, h)| **h != local_hash)
            .map(|(p, _)| p.clone())
            .collect();

        if dissenters.is_empty() {
            let released = item.msg.take();
            drop(item);
            self.settle(key);
            debug!(msg_id = %self.msg_id, key, "broadcast confirmed");
            return released;
        }

        let evidence = serde_json::to_vec(&item.confirmed).unwrap_or_default();
        let (round, owner) = (item.round.clone(), item.owner);
        item.msg = None;
        drop(item);
        self.settle(key);

        warn!(msg_id = %self.msg_id, key, dissenters = dissenters.len(), "confirmation hashes disagree");
        if let Some(owner_peer) = self.party_map.peer_of(owner) {
            blame.record_equivocation(&round, owner_peer, &dissenters, evidence);
        }
        None
    }

    fn item(&self, key: &str, round: &str, owner: u16) -> Arc<Mutex<LocalCacheItem>> {
        self.cache
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(LocalCacheItem {
                    round: round.to_string(),
                    owner,
                    ..Default::default()
                }))
            })
            .value()
            .clone()
    }

    fn settle(&self, key: &str) {
        self.settled.insert(key.to_string());
        self.cache.remove(key);
    }

    /// Unconfirmed broadcasts, for timeout blame.
    pub fn pending_snapshot(&self) -> Vec<PendingBroadcast> {
        let items: Vec<(String, Arc<Mutex<LocalCacheItem>>)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut pending: Vec<PendingBroadcast> = items
            .into_iter()
            .map(|(key, item)| {
                let item = lock(&item);
                PendingBroadcast {
                    key,
                    round: item.round.clone(),
                    owner: item.owner,
                    confirmed_by: item.confirmed.keys().cloned().collect(),
                    has_message: item.msg.is_some(),
                }
            })
            .collect();
        pending.sort_by(|a, b| a.key.cmp(&b.key));
        pending
    }

    pub fn is_settled(&self, key: &str) -> bool {
        self.settled.contains(key)
    }

    /// Drop all unconfirmed state at ceremony end.
    pub fn clear(&self) {
        self.cache.clear();
    }
}
