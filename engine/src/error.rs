//! Centralized error types for the TSS coordination layer.

use thiserror::Error;

use crate::types::PeerId;

/// Ceremony-level error surfaced by the server and the round runner.
#[derive(Error, Debug)]
pub enum TssError {
    /// Malformed caller request (bad encoding, unknown keys, empty payload).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Quorum was not formed before the join-party deadline.
    #[error("Join party timed out, absent peers: {0:?}")]
    JoinTimeout(Vec<String>),
    /// The engine started but a round never completed.
    #[error("Ceremony round timed out")]
    RoundTimeout,
    /// The MPC engine rejected its own preconditions.
    #[error("Engine failed to start: {0}")]
    EngineStart(String),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    /// A structurally complete signature failed verification.
    #[error("Signature verification failed: {0}")]
    Verification(String),
    /// Process-wide stop signal.
    #[error("Received exit signal")]
    ExternalAbort,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Inbound message failed validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for TssError {
    fn from(err: bincode::Error) -> Self {
        TssError::Serialization(err.to_string())
    }
}

impl From<NotifierError> for TssError {
    fn from(err: NotifierError) -> Self {
        match err {
            NotifierError::VerificationFailed(reason) => TssError::Verification(reason),
            other => TssError::Internal(other.to_string()),
        }
    }
}

/// Errors raised by an MPC engine implementation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Preconditions rejected before any round ran (invalid parameters, missing pre-parameters).
    #[error("Engine start failure: {0}")]
    Start(String),
    #[error("Protocol failure: {0}")]
    Protocol(String),
    /// The protocol named the party whose contribution broke it.
    #[error("Party {party} misbehaved in {round}: {reason}")]
    Culprit { party: u16, round: String, reason: String },
    #[error("Engine serialization error: {0}")]
    Serialization(String),
    /// The inbound or outbound channel closed underneath the engine.
    #[error("Engine channel closed")]
    ChannelClosed,
}

/// Errors raised by a transport implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid peer key: {0}")]
    InvalidKey(String),
}

/// Errors raised by the key-share storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Local state not found for {0}")]
    NotFound(String),
    /// Stored data exists but cannot be decoded.
    #[error("Corrupt local state: {0}")]
    Corrupt(String),
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Errors raised by the keysign result notifier.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NotifierError {
    #[error("Invalid notifier input: {0}")]
    InvalidInput(String),
    #[error("Signature verification failed: {0}")]
    VerificationFailed(String),
    /// The one-shot slot was already settled; late calls are no-ops.
    #[error("Notifier already settled")]
    AlreadySettled,
    /// The result was already taken by another waiter.
    #[error("Notifier result already consumed")]
    AlreadyConsumed,
}

/// Errors raised by the join-party protocol.
#[derive(Error, Debug)]
pub enum JoinPartyError {
    /// Quorum not reached; `online` is the standby roster, `absent` the peers that never joined.
    #[error("Join party timeout, absent peers: {absent:?}")]
    Timeout {
        online: Vec<PeerId>,
        absent: Vec<PeerId>,
    },
    #[error("Join party aborted by shutdown")]
    Aborted,
    #[error("Join party message error: {0}")]
    Message(String),
}

/// Result type for ceremony operations
pub type TssResult<T> = Result<T, TssError>;
