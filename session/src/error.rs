//! Error types for the session engine

use shared::PlayerIndex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Every slot is occupied
    #[error("Session full, all {0} slots are occupied")]
    SessionFull(usize),

    /// Operation on an index that is not currently admitted
    #[error("Unknown slot {0}")]
    UnknownSlot(PlayerIndex),

    /// Role and identity supplied at creation disagree
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Malformed or out-of-sequence inbound message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Event about a participant that already left
    #[error("Stale event for evicted slot {0}")]
    StaleEvent(PlayerIndex),

    /// Client has not been admitted by the master yet
    #[error("Not joined to a master yet")]
    NotJoined,

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
