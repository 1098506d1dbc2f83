//! End-to-end ceremonies over an in-memory four node cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use super::{TestNode, cluster, cluster_with, peer, sorted_keys, test_config};
use crate::blame::{
    BLAME_ENGINE_FAILURE, BLAME_ENGINE_START, BLAME_EXIT_SIGNAL, BLAME_FAIL_JOIN_PARTY, BLAME_HASH_CHECK, BLAME_INVALID_SHARE,
    BLAME_SIGNATURE_VERIFY, BLAME_TSS_TIMEOUT,
};
use crate::error::{EngineError, TransportError};
use crate::messages::{MessageType, ProtocolId, WireMessage, WrappedMessage};
use crate::mpc::frost::{FrostEngine, KEYGEN_ROUND1, SIGN_ROUND2};
use crate::mpc::{EngineIo, KeygenOutput, MpcEngine, PartyParams, RoundSpec, SignatureData};
use crate::request::{KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse};
use crate::storage::LocalStateManager;
use crate::transport::Transport;
use crate::types::{CeremonyKind, PeerId, Status};

const VERSION: &str = "0.1.0";

/// Counts keygen invocations on top of the real engine.
struct CountingEngine {
    inner: FrostEngine,
    keygens: AtomicUsize,
}

#[async_trait]
impl MpcEngine for CountingEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        self.inner.rounds(kind)
    }

    async fn keygen(&self, params: PartyParams, io: EngineIo) -> Result<KeygenOutput, EngineError> {
        self.keygens.fetch_add(1, Ordering::SeqCst);
        self.inner.keygen(params, io).await
    }

    async fn keysign(
        &self,
        params: PartyParams,
        local_data: Zeroizing<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        self.inner.keysign(params, local_data, messages, io).await
    }
}

/// Engine whose pre-parameters are never ready.
struct UnpreparedEngine;

#[async_trait]
impl MpcEngine for UnpreparedEngine {
    fn preflight(&self) -> Result<(), EngineError> {
        Err(EngineError::Start("pre-parameters not generated".into()))
    }

    fn rounds(&self, _kind: CeremonyKind) -> Vec<RoundSpec> {
        Vec::new()
    }

    async fn keygen(&self, _params: PartyParams, _io: EngineIo) -> Result<KeygenOutput, EngineError> {
        Err(EngineError::Protocol("keygen must not run".into()))
    }

    async fn keysign(
        &self,
        _params: PartyParams,
        _local_data: Zeroizing<Vec<u8>>,
        _messages: Vec<Vec<u8>>,
        _io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        Err(EngineError::Protocol("keysign must not run".into()))
    }
}

/// Engine whose protocol breaks without naming anyone.
struct BrokenEngine;

#[async_trait]
impl MpcEngine for BrokenEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        FrostEngine::new().rounds(kind)
    }

    async fn keygen(&self, _params: PartyParams, _io: EngineIo) -> Result<KeygenOutput, EngineError> {
        Err(EngineError::Protocol("commitment does not parse".into()))
    }

    async fn keysign(
        &self,
        _params: PartyParams,
        _local_data: Zeroizing<Vec<u8>>,
        _messages: Vec<Vec<u8>>,
        _io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        Err(EngineError::Protocol("nonce reuse".into()))
    }
}

/// Party `cheater` signs a slightly different batch than the rest, so its
/// signature shares do not fit anyone else's signing package.
struct CheatingEngine {
    inner: FrostEngine,
    cheater: u16,
}

#[async_trait]
impl MpcEngine for CheatingEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        self.inner.rounds(kind)
    }

    async fn keygen(&self, params: PartyParams, io: EngineIo) -> Result<KeygenOutput, EngineError> {
        self.inner.keygen(params, io).await
    }

    async fn keysign(
        &self,
        params: PartyParams,
        local_data: Zeroizing<Vec<u8>>,
        mut messages: Vec<Vec<u8>>,
        io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        if params.local.index == self.cheater {
            for message in &mut messages {
                message.push(0xff);
            }
        }
        self.inner.keysign(params, local_data, messages, io).await
    }
}

/// Hands back signatures with one bit flipped.
struct TamperingEngine {
    inner: FrostEngine,
}

#[async_trait]
impl MpcEngine for TamperingEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        self.inner.rounds(kind)
    }

    async fn keygen(&self, params: PartyParams, io: EngineIo) -> Result<KeygenOutput, EngineError> {
        self.inner.keygen(params, io).await
    }

    async fn keysign(
        &self,
        params: PartyParams,
        local_data: Zeroizing<Vec<u8>>,
        messages: Vec<Vec<u8>>,
        io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        let mut signatures = self.inner.keysign(params, local_data, messages, io).await?;
        for signature in &mut signatures {
            signature.signature[40] ^= 0x01;
        }
        Ok(signatures)
    }
}

/// Starts keygen and then never finishes.
struct StalledEngine {
    started: AtomicUsize,
}

#[async_trait]
impl MpcEngine for StalledEngine {
    fn rounds(&self, kind: CeremonyKind) -> Vec<RoundSpec> {
        FrostEngine::new().rounds(kind)
    }

    async fn keygen(&self, _params: PartyParams, _io: EngineIo) -> Result<KeygenOutput, EngineError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn keysign(
        &self,
        _params: PartyParams,
        _local_data: Zeroizing<Vec<u8>>,
        _messages: Vec<Vec<u8>>,
        _io: EngineIo,
    ) -> Result<Vec<SignatureData>, EngineError> {
        std::future::pending().await
    }
}

/// Gives `victim` a different keygen round 1 broadcast than every other peer.
struct EquivocatingTransport {
    inner: Arc<dyn Transport>,
    victim: PeerId,
}

impl EquivocatingTransport {
    fn tamper(payload: Vec<u8>) -> Vec<u8> {
        let wrapped = WrappedMessage::decode(&payload).unwrap();
        if wrapped.message_type != MessageType::KeygenMsg {
            return payload;
        }
        let mut msg: WireMessage = wrapped.inner().unwrap();
        if msg.round_info != KEYGEN_ROUND1 {
            return payload;
        }
        // trailing whitespace keeps the payload decodable
        msg.message.push(b' ');
        WrappedMessage::new(MessageType::KeygenMsg, &wrapped.msg_id, &msg)
            .unwrap()
            .encode()
            .unwrap()
    }
}

#[async_trait]
impl Transport for EquivocatingTransport {
    fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id()
    }

    async fn send(&self, to: &PeerId, protocol: ProtocolId, payload: Vec<u8>) -> Result<(), TransportError> {
        let payload = if protocol == ProtocolId::Tss && to == &self.victim {
            Self::tamper(payload)
        } else {
            payload
        };
        self.inner.send(to, protocol, payload).await
    }

    fn address_book(&self) -> HashMap<PeerId, String> {
        self.inner.address_book()
    }
}

fn encoded(messages: &[&[u8]]) -> Vec<String> {
    messages.iter().map(|m| STANDARD.encode(m)).collect()
}

fn keys_of(nodes: &[TestNode]) -> Vec<String> {
    nodes.iter().map(|n| n.pub_key.clone()).collect()
}

async fn keygen_on(nodes: &[&TestNode], keys: &[String]) -> Vec<KeygenResponse> {
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = node.server.clone();
            let req = KeygenRequest::new(keys.to_vec(), VERSION);
            tokio::spawn(async move { server.keygen(&req).await.unwrap() })
        })
        .collect();
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    responses
}

async fn keysign_on(nodes: &[TestNode], req: &KeysignRequest) -> Vec<KeysignResponse> {
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = node.server.clone();
            let req = req.clone();
            tokio::spawn(async move { server.keysign(&req).await.unwrap() })
        })
        .collect();
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    responses
}

/// The first `split` nodes submit `first`, the rest submit `second`.
async fn keysign_split(
    nodes: &[TestNode],
    split: usize,
    first: &KeysignRequest,
    second: &KeysignRequest,
) -> Vec<KeysignResponse> {
    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let server = node.server.clone();
            let req = if i < split { first.clone() } else { second.clone() };
            tokio::spawn(async move { server.keysign(&req).await.unwrap() })
        })
        .collect();
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap());
    }
    responses
}

/// Run a successful keygen on the whole cluster and return the pool key.
async fn pool_key(nodes: &[TestNode]) -> String {
    let all: Vec<&TestNode> = nodes.iter().collect();
    let responses = keygen_on(&all, &keys_of(nodes)).await;
    for response in &responses {
        assert_eq!(response.status, Status::Success, "keygen failed: {:?}", response.blame);
    }
    responses[0].pub_key.clone()
}

fn verify_all(pool_pub_key: &str, response: &KeysignResponse, messages: &[&[u8]]) {
    let key_bytes: [u8; 32] = hex::decode(pool_pub_key).unwrap().try_into().unwrap();
    let key = VerifyingKey::from_bytes(&key_bytes).unwrap();
    assert_eq!(response.signatures.len(), messages.len());
    for (sig, expected) in response.signatures.iter().zip(messages) {
        let msg = STANDARD.decode(&sig.msg).unwrap();
        assert_eq!(msg.as_slice(), *expected);
        let signature = Signature::from_slice(&STANDARD.decode(&sig.signature).unwrap()).unwrap();
        key.verify(&msg, &signature).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_nodes_keygen_and_keysign() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());

    // STEP 1: keygen converges on one pool key
    let all: Vec<&TestNode> = nodes.iter().collect();
    let responses = keygen_on(&all, &keys_of(&nodes)).await;
    let pool = responses[0].pub_key.clone();
    assert_eq!(pool.len(), 64);
    for response in &responses {
        assert_eq!(response.status, Status::Success);
        assert_eq!(response.pub_key, pool);
        assert!(response.blame.is_empty());
    }

    // STEP 2: every node persisted its share against the pool key
    for node in &nodes {
        let state = node.storage.get_local_state(&pool).unwrap();
        assert_eq!(state.participant_keys, keys_of(&nodes));
        assert_eq!(state.local_party_key, node.pub_key);
        assert_eq!(node.server.status().keygen_success, 1);
    }

    // STEP 3: two messages signed in one ceremony
    let messages: [&[u8]; 2] = [b"transfer 10 to alice", b"transfer 20 to bob"];
    let req = KeysignRequest::new(
        &pool,
        messages.iter().map(|m| STANDARD.encode(m)).collect(),
        keys_of(&nodes),
        VERSION,
    );
    let responses = keysign_on(&nodes, &req).await;
    for response in &responses {
        assert_eq!(response.status, Status::Success, "keysign failed: {:?}", response.blame);
        assert_eq!(response.signatures, responses[0].signatures);
        verify_all(&pool, response, &messages);
    }

    // STEP 4: the address book was saved after signing
    for node in &nodes {
        assert_eq!(node.storage.retrieve_address_book().unwrap().len(), 3);
        assert_eq!(node.server.status().keysign_success, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_threshold_subset_signs() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let pool = pool_key(&nodes).await;

    // threshold is 2, so three signers are enough; the first node sits out
    let signers: Vec<String> = keys_of(&nodes[1..]);
    let message: &[u8] = b"subset";
    let req = KeysignRequest::new(&pool, vec![STANDARD.encode(message)], signers, VERSION);
    let responses = keysign_on(&nodes, &req).await;

    assert_eq!(responses[0].status, Status::Success);
    assert!(responses[0].signatures.is_empty());
    for response in &responses[1..] {
        assert_eq!(response.status, Status::Success, "keysign failed: {:?}", response.blame);
        verify_all(&pool, response, &[message]);
    }

    // two signers cannot meet the threshold
    let req = KeysignRequest::new(&pool, vec![STANDARD.encode(message)], keys_of(&nodes[2..]), VERSION);
    assert!(nodes[2].server.keysign(&req).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_member_gets_empty_success() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let (_other_network, outsiders) = cluster(3, Arc::new(FrostEngine::new()), test_config());

    let response = nodes[0]
        .server
        .keygen(&KeygenRequest::new(keys_of(&outsiders), VERSION))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Success);
    assert!(response.pub_key.is_empty());
    assert!(response.blame.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_absent_party_blamed_for_join() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let keys = keys_of(&nodes);

    // the last node never submits the request
    let present: Vec<&TestNode> = nodes[..3].iter().collect();
    let responses = keygen_on(&present, &keys).await;
    for response in &responses {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_FAIL_JOIN_PARTY);
        assert_eq!(response.blame.pub_keys(), vec![nodes[3].pub_key.as_str()]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_request_runs_once() {
    let engine = Arc::new(CountingEngine {
        inner: FrostEngine::new(),
        keygens: AtomicUsize::new(0),
    });
    let (_network, nodes) = cluster(4, engine.clone(), test_config());
    let keys = keys_of(&nodes);

    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = node.server.clone();
            let req = KeygenRequest::new(keys.clone(), VERSION);
            tokio::spawn(async move {
                let (a, b) = tokio::join!(server.keygen(&req), server.keygen(&req));
                (a.unwrap(), b.unwrap())
            })
        })
        .collect();

    for handle in handles {
        let (first, second) = handle.await.unwrap();
        assert_eq!(first.status, Status::Success);
        assert_eq!(first.pub_key, second.pub_key);
        assert_eq!(first.status, second.status);
    }
    assert_eq!(engine.keygens.load(Ordering::SeqCst), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_blamed_on_timeout() {
    let (network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let keys = keys_of(&nodes);

    // STEP 1: node 4 joins the party but none of its ceremony traffic gets out
    network.mute(&peer(&nodes[3].pub_key), ProtocolId::Tss);
    let honest: Vec<&TestNode> = nodes[..3].iter().collect();
    let silent = {
        let server = nodes[3].server.clone();
        let req = KeygenRequest::new(keys.clone(), VERSION);
        tokio::spawn(async move { server.keygen(&req).await })
    };

    // STEP 2: the honest nodes time out and all name the silent one
    let responses = keygen_on(&honest, &keys).await;
    for response in &responses {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_TSS_TIMEOUT);
        assert_eq!(response.blame.pub_keys(), vec![nodes[3].pub_key.as_str()]);
        assert!(!response.blame.is_unicast);
    }
    assert_eq!(silent.await.unwrap().unwrap().status, Status::Fail);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_beyond_threshold_blames_nobody() {
    let (network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    for node in &nodes[1..] {
        network.mute(&peer(&node.pub_key), ProtocolId::Tss);
    }

    let all: Vec<&TestNode> = nodes.iter().collect();
    let responses = keygen_on(&all, &keys_of(&nodes)).await;
    let first = &responses[0];
    assert_eq!(first.status, Status::Fail);
    assert_eq!(first.blame.fail_reason, BLAME_TSS_TIMEOUT);
    assert!(first.blame.blame_nodes.is_empty());
    for response in &responses {
        assert_eq!(response.status, Status::Fail);
    }
}

#[tokio::test]
async fn test_engine_start_failure() {
    let (_network, nodes) = cluster(4, Arc::new(UnpreparedEngine), test_config());

    let response = nodes[0]
        .server
        .keygen(&KeygenRequest::new(keys_of(&nodes), VERSION))
        .await
        .unwrap();
    assert_eq!(response.status, Status::Fail);
    assert_eq!(response.blame.fail_reason, BLAME_ENGINE_START);
    assert!(response.blame.blame_nodes.is_empty());
    assert_eq!(nodes[0].server.status().keygen_fail, 1);
}

#[tokio::test]
async fn test_stop_aborts_ceremony_in_join() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let server = nodes[0].server.clone();
    let req = KeygenRequest::new(keys_of(&nodes), VERSION);
    let handle = tokio::spawn(async move { server.keygen(&req).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    nodes[0].server.stop();

    let response = handle.await.unwrap().unwrap();
    assert_eq!(response.status, Status::Fail);
    assert_eq!(response.blame.fail_reason, BLAME_EXIT_SIGNAL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_message_order_does_not_matter() {
    let (_network, nodes) = cluster(4, Arc::new(FrostEngine::new()), test_config());
    let pool = pool_key(&nodes).await;
    let keys = keys_of(&nodes);
    let (alpha, beta): (&[u8], &[u8]) = (b"alpha", b"beta");

    // STEP 1: half the nodes list the batch the other way round
    let forward = KeysignRequest::new(&pool, encoded(&[alpha, beta]), keys.clone(), VERSION);
    let reverse = KeysignRequest::new(&pool, encoded(&[beta, alpha]), keys.clone(), VERSION);
    let responses = keysign_split(&nodes, 2, &forward, &reverse).await;
    for response in &responses {
        assert_eq!(response.status, Status::Success, "keysign failed: {:?}", response.blame);
    }
    verify_all(&pool, &responses[0], &[alpha, beta]);
    verify_all(&pool, &responses[2], &[beta, alpha]);
    assert_eq!(responses[0].signatures, responses[1].signatures);
    assert_eq!(responses[0].signatures[0], responses[2].signatures[1]);
    assert_eq!(responses[0].signatures[1], responses[2].signatures[0]);

    // STEP 2: a repeated message is signed once and returned at every position
    let repeated = KeysignRequest::new(&pool, encoded(&[alpha, alpha]), keys.clone(), VERSION);
    let single = KeysignRequest::new(&pool, encoded(&[alpha]), keys, VERSION);
    let responses = keysign_split(&nodes, 2, &repeated, &single).await;
    verify_all(&pool, &responses[0], &[alpha, alpha]);
    verify_all(&pool, &responses[3], &[alpha]);
    assert_eq!(responses[0].signatures[0], responses[3].signatures[0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_share_blames_its_sender() {
    let engine = Arc::new(CheatingEngine {
        inner: FrostEngine::new(),
        cheater: 4,
    });
    let (_network, nodes) = cluster(4, engine, test_config());
    let pool = pool_key(&nodes).await;

    let req = KeysignRequest::new(&pool, encoded(&[b"pay".as_slice()]), keys_of(&nodes), VERSION);
    let responses = keysign_on(&nodes, &req).await;
    for response in &responses[..3] {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_INVALID_SHARE);
        assert_eq!(response.blame.round, SIGN_ROUND2);
        assert!(!response.blame.is_unicast);
        assert_eq!(response.blame.pub_keys(), vec![nodes[3].pub_key.as_str()]);
    }
    assert_eq!(responses[3].status, Status::Fail);
    assert!(!responses[3].blame.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_failure_carries_reason() {
    let (_network, nodes) = cluster(4, Arc::new(BrokenEngine), test_config());
    let all: Vec<&TestNode> = nodes.iter().collect();
    for response in keygen_on(&all, &keys_of(&nodes)).await {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_ENGINE_FAILURE);
        assert!(!response.blame.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bad_signature_fails_verification() {
    let (_network, nodes) = cluster(4, Arc::new(TamperingEngine { inner: FrostEngine::new() }), test_config());
    let pool = pool_key(&nodes).await;

    let req = KeysignRequest::new(&pool, encoded(&[b"pay".as_slice()]), keys_of(&nodes), VERSION);
    for response in keysign_on(&nodes, &req).await {
        assert_eq!(response.status, Status::Fail);
        assert!(response.signatures.is_empty());
        assert_eq!(response.blame.fail_reason, BLAME_SIGNATURE_VERIFY);
        assert!(response.blame.blame_nodes.is_empty());
    }
    assert_eq!(nodes[0].server.status().keysign_fail, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_aborts_running_ceremony() {
    let engine = Arc::new(StalledEngine {
        started: AtomicUsize::new(0),
    });
    let (_network, nodes) = cluster(4, engine.clone(), test_config());
    let keys = keys_of(&nodes);
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = node.server.clone();
            let req = KeygenRequest::new(keys.clone(), VERSION);
            tokio::spawn(async move { server.keygen(&req).await })
        })
        .collect();

    // STEP 1: wait until every node is past join party and inside the engine
    for _ in 0..100 {
        if engine.started.load(Ordering::SeqCst) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.started.load(Ordering::SeqCst), 4);

    // STEP 2: stop every node
    for node in &nodes {
        node.server.stop();
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_EXIT_SIGNAL);
        assert!(response.blame.blame_nodes.is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_equivocating_peer_named_by_honest_nodes() {
    let mut config = test_config();
    config.keygen_timeout = Duration::from_secs(3);
    let keys = sorted_keys(4);
    let victim = peer(&keys[2]);

    // node 0 sends node 2 a different round 1 broadcast
    let (_network, nodes) = cluster_with(keys.clone(), Arc::new(FrostEngine::new()), config, |i, transport| {
        if i == 0 {
            let equivocating: Arc<dyn Transport> = Arc::new(EquivocatingTransport {
                inner: transport,
                victim: victim.clone(),
            });
            equivocating
        } else {
            transport
        }
    });

    let all: Vec<&TestNode> = nodes.iter().collect();
    let responses = keygen_on(&all, &keys).await;
    for response in &responses[1..] {
        assert_eq!(response.status, Status::Fail);
        assert_eq!(response.blame.fail_reason, BLAME_HASH_CHECK);
        assert_eq!(response.blame.round, KEYGEN_ROUND1);
        assert_eq!(response.blame.pub_keys(), vec![nodes[0].pub_key.as_str()]);
        assert!(!response.blame.blame_nodes[0].blame_data.is_empty());
    }
    assert_eq!(responses[0].status, Status::Fail);
}
