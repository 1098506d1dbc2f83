//! FROST(Ed25519) engine.
//!
//! Keygen is the three-part Pedersen DKG; keysign signs a batch of messages in
//! two rounds with every signer aggregating, so all signers end up with the
//! same standard Ed25519 signatures.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use frost_ed25519 as frost;
use frost_ed25519::keys::{KeyPackage, PublicKeyPackage, dkg};
use frost_ed25519::{Identifier, SigningPackage, round1, round2};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{EngineIo, KeygenOutput, MpcEngine, PartyParams, RoundSpec, SignatureData};
use crate::error::EngineError;
use crate::messages::WireMessage;
use crate::types::{CeremonyKind, PartyId};

pub const KEYGEN_ROUND1: &str = "KGRound1";
pub const KEYGEN_ROUND2: &str = "KGRound2";
pub const SIGN_ROUND1: &str = "SignRound1";
pub const SIGN_ROUND2: &str = "SignRound2";

/// Key material a node keeps after DKG.
#[derive(Serialize, Deserialize)]
struct FrostShare {
    key_package: KeyPackage,
    public_key_package: PublicKeyPackage,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrostEngine;

impl FrostEngine {
    pub fn new() -> Self {
        FrostEngine
    }
}

fn identifier(party: &PartyId) -> Result<Identifier, EngineError> {
    Identifier::try_from(party.index)
        .map_err(|e| EngineError::Start(format!("invalid party index {}: {e}", party.index)))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(|e| EngineError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Serialization(e.to_string()))
}

fn protocol<E: std::fmt::Display>(stage: &str) -> impl FnOnce(E) -> EngineError + '_ {
    move |e| EngineError::Protocol(format!("{stage}: {e}"))
}

/// Like [`protocol`], but names the party when frost's cheater detection
/// pinned the failure on one.
fn attributed<'a>(
    stage: &'a str,
    round: &'a str,
    index_of: impl Fn(&Identifier) -> Option<u16> + 'a,
) -> impl FnOnce(frost::Error) -> EngineError + 'a {
    move |e| match e.culprit().and_then(|culprit| index_of(&culprit)) {
        Some(party) => EngineError::Culprit {
            party,
            round: round.to_string(),
            reason: format!("{stage}: {e}"),
        },
        None => EngineError::Protocol(format!("{stage}: {e}")),
    }
}

/// Pulls confirmed messages off the inbound channel one round at a time,
/// holding on to anything that belongs to a later round.
struct RoundCollector<'a> {
    inbound: &'a mut mpsc::Receiver<WireMessage>,
    stash: Vec<WireMessage>,
}

impl<'a> RoundCollector<'a> {
    fn new(inbound: &'a mut mpsc::Receiver<WireMessage>) -> Self {
        RoundCollector {
            inbound,
            stash: Vec::new(),
        }
    }

    async fn collect(&mut self, round: &str, expected: &BTreeSet<u16>) -> Result<BTreeMap<u16, Vec<u8>>, EngineError> {
        let mut received = BTreeMap::new();

        let stashed = std::mem::take(&mut self.stash);
        for msg in stashed {
            if msg.round_info == round {
                self.accept(msg, expected, &mut received);
            } else {
                self.stash.push(msg);
            }
        }

        while received.len() < expected.len() {
            let msg = self.inbound.recv().await.ok_or(EngineError::ChannelClosed)?;
            if msg.round_info == round {
                self.accept(msg, expected, &mut received);
            } else {
                self.stash.push(msg);
            }
        }
        Ok(received)
    }

    fn accept(&self, msg: WireMessage, expected: &BTreeSet<u16>, received: &mut BTreeMap<u16, Vec<u8>>) {
        let from = msg.routing.from.index;
        if !expected.contains(&from) {
            warn!(from, round = %msg.round_info, "ignoring message from unexpected party");
            return;
        }
        received.entry(from).or_insert(msg.message);
    }
}

async fn emit(outbound: &mpsc::Sender<WireMessage>, msg: WireMessage) -> Result<(), EngineError> {
    outbound.send(msg).await.map_err(|_| EngineError::ChannelClosed)
}

#[async_trait]
impl MpcEngine for FrostEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        match kind {
            CeremonyKind::Keygen => vec![RoundSpec::new(KEYGEN_ROUND1, true), RoundSpec::new(KEYGEN_ROUND2, false)],
            CeremonyKind::Keysign => vec![RoundSpec::new(SIGN_ROUND1, true), RoundSpec::new(SIGN_ROUND2, true)],
        }
    }

    async fn keygen(&self, params: PartyParams, io: EngineIo) -> Result<KeygenOutput, EngineError> {
        let EngineIo { mut inbound, outbound } = io;
        let max_signers = u16::try_from(params.parties.len())
            .map_err(|_| EngineError::Start("too many parties".into()))?;
        let min_signers = u16::try_from(params.threshold + 1)
            .map_err(|_| EngineError::Start("threshold too large".into()))?;
        let local_id = identifier(&params.local)?;

        let mut ids = BTreeMap::new();
        for party in params.others() {
            ids.insert(party.index, (identifier(party)?, party.clone()));
        }
        let expected: BTreeSet<u16> = ids.keys().copied().collect();

        // STEP 1: commit to our polynomial and broadcast it
        let (r1_secret, r1_package) = dkg::part1(local_id, max_signers, min_signers, OsRng)
            .map_err(|e| EngineError::Start(format!("dkg part1: {e}")))?;
        emit(&outbound, WireMessage::broadcast(params.local.clone(), KEYGEN_ROUND1, encode(&r1_package)?)).await?;

        let mut collector = RoundCollector::new(&mut inbound);
        let raw_r1 = collector.collect(KEYGEN_ROUND1, &expected).await?;
        let mut r1_packages = BTreeMap::new();
        for (index, raw) in raw_r1 {
            let (id, _) = &ids[&index];
            r1_packages.insert(*id, decode::<dkg::round1::Package>(&raw)?);
        }
        debug!(party = params.local.index, "keygen round 1 complete");

        // STEP 2: send each peer its secret share privately
        let index_of = |c: &Identifier| ids.iter().find(|(_, (id, _))| id == c).map(|(index, _)| *index);
        let (r2_secret, r2_packages) =
            dkg::part2(r1_secret, &r1_packages).map_err(attributed("dkg part2", KEYGEN_ROUND1, index_of))?;
        for (index, (id, party)) in &ids {
            let package = r2_packages
                .get(id)
                .ok_or_else(|| EngineError::Protocol(format!("no round 2 package for party {index}")))?;
            let msg = WireMessage::unicast(params.local.clone(), party.clone(), KEYGEN_ROUND2, encode(package)?);
            emit(&outbound, msg).await?;
        }

        let raw_r2 = collector.collect(KEYGEN_ROUND2, &expected).await?;
        let mut received_r2 = BTreeMap::new();
        for (index, raw) in raw_r2 {
            let (id, _) = &ids[&index];
            received_r2.insert(*id, decode::<dkg::round2::Package>(&raw)?);
        }

        // STEP 3: derive our key package and the group key
        let (key_package, public_key_package) =
            dkg::part3(&r2_secret, &r1_packages, &received_r2).map_err(attributed("dkg part3", KEYGEN_ROUND2, index_of))?;
        let pub_key = public_key_package
            .verifying_key()
            .serialize()
            .map_err(|e| EngineError::Serialization(e.to_string()))?;

        let share = FrostShare {
            key_package,
            public_key_package,
        };
        Ok(KeygenOutput {
            pub_key,
            local_data: Zeroizing::new(encode(&share)?),
        })
    }

    async fn keysign(
        &self,
        params: PartyParams,
        local_data: Zeroizing<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        let EngineIo { mut inbound, outbound } = io;
        let share: FrostShare = decode(&local_data).map_err(|e| EngineError::Start(format!("bad key share: {e}")))?;
        if *share.key_package.identifier() != identifier(&params.local)? {
            return Err(EngineError::Start("key share does not belong to the local party".into()));
        }
        if params.parties.len() < params.threshold + 1 {
            return Err(EngineError::Start(format!(
                "{} signers cannot meet threshold {}",
                params.parties.len(),
                params.threshold
            )));
        }

        let mut ids = BTreeMap::new();
        for party in params.others() {
            ids.insert(party.index, identifier(party)?);
        }
        let expected: BTreeSet<u16> = ids.keys().copied().collect();
        let local_id = *share.key_package.identifier();

        // STEP 1: one nonce pair per message, commitments broadcast together
        let mut rng = OsRng;
        let mut nonces = Vec::with_capacity(messages.len());
        let mut commitments = Vec::with_capacity(messages.len());
        for _ in &messages {
            let (n, c) = round1::commit(share.key_package.signing_share(), &mut rng);
            nonces.push(n);
            commitments.push(c);
        }
        emit(&outbound, WireMessage::broadcast(params.local.clone(), SIGN_ROUND1, encode(&commitments)?)).await?;

        let mut collector = RoundCollector::new(&mut inbound);
        let raw_r1 = collector.collect(SIGN_ROUND1, &expected).await?;

        let mut packages = Vec::with_capacity(messages.len());
        let mut all_commitments: Vec<BTreeMap<Identifier, round1::SigningCommitments>> =
            (0..messages.len()).map(|_| BTreeMap::new()).collect();
        for (slot, own) in all_commitments.iter_mut().zip(commitments) {
            slot.insert(local_id, own);
        }
        for (index, raw) in &raw_r1 {
            let theirs: Vec<round1::SigningCommitments> = decode(raw)?;
            if theirs.len() != messages.len() {
                return Err(EngineError::Protocol(format!(
                    "party {index} committed to {} messages, expected {}",
                    theirs.len(),
                    messages.len()
                )));
            }
            for (slot, c) in all_commitments.iter_mut().zip(theirs) {
                slot.insert(ids[index], c);
            }
        }
        for (msg, commitments) in messages.iter().zip(all_commitments) {
            packages.push(SigningPackage::new(commitments, msg));
        }

        // STEP 2: sign every message, broadcast the shares, aggregate locally
        let mut own_shares = Vec::with_capacity(messages.len());
        for (package, nonce) in packages.iter().zip(&nonces) {
            own_shares.push(round2::sign(package, nonce, &share.key_package).map_err(protocol("sign"))?);
        }
        emit(&outbound, WireMessage::broadcast(params.local.clone(), SIGN_ROUND2, encode(&own_shares)?)).await?;

        let raw_r2 = collector.collect(SIGN_ROUND2, &expected).await?;
        let mut all_shares: Vec<BTreeMap<Identifier, round2::SignatureShare>> =
            (0..messages.len()).map(|_| BTreeMap::new()).collect();
        for (slot, own) in all_shares.iter_mut().zip(own_shares) {
            slot.insert(local_id, own);
        }
        for (index, raw) in &raw_r2 {
            let theirs: Vec<round2::SignatureShare> = decode(raw)?;
            if theirs.len() != messages.len() {
                return Err(EngineError::Protocol(format!("party {index} sent {} shares", theirs.len())));
            }
            for (slot, s) in all_shares.iter_mut().zip(theirs) {
                slot.insert(ids[index], s);
            }
        }

        let mut signatures = Vec::with_capacity(messages.len());
        for ((package, shares), message) in packages.iter().zip(all_shares).zip(messages) {
            let index_of = |c: &Identifier| ids.iter().find(|(_, id)| *id == c).map(|(index, _)| *index);
            let signature = frost::aggregate(package, &shares, &share.public_key_package)
                .map_err(attributed("aggregate", SIGN_ROUND2, index_of))?;
            signatures.push(SignatureData {
                message,
                signature: signature
                    .serialize()
                    .map_err(|e| EngineError::Serialization(e.to_string()))?,
            });
        }
        debug!(party = params.local.index, count = signatures.len(), "keysign complete");
        Ok(signatures)
    }
}
