//! Protocol fault taxonomy.

use std::fmt;

use crate::NodeId;

/// Why a peer is being blamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Reason {
    BadSignature,
    RoundMismatch,
    MissingCiphertext,
    BadHash,
    GoFalse,
    MalformedPayload,
    DuplicateCiphertext,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::BadSignature => "bad signature",
            Reason::RoundMismatch => "round mismatch",
            Reason::MissingCiphertext => "missing ciphertext",
            Reason::BadHash => "bad hash",
            Reason::GoFalse => "reported go=false",
            Reason::MalformedPayload => "malformed payload",
            Reason::DuplicateCiphertext => "duplicate ciphertext",
        };
        f.write_str(s)
    }
}

/// A blamable deviation from the protocol. Always fatal to the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolViolation {
    /// The peer the deviation is attributed to.
    pub peer: NodeId,
    /// What the peer did.
    pub reason: Reason,
    /// The transmission slot involved, where one applies.
    pub slot: Option<usize>,
}

impl ProtocolViolation {
    /// A violation with no slot context.
    pub fn new(peer: NodeId, reason: Reason) -> Self {
        Self {
            peer,
            reason,
            slot: None,
        }
    }

    /// Attaches the transmission slot the violation was observed in.
    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = Some(slot);
        self
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{}: {} (slot {slot})", self.peer, self.reason),
            None => write!(f, "{}: {}", self.peer, self.reason),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// A failure in the local cryptographic machinery. Fatal, but not blamable
/// on any peer.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum CryptoError {
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("key encoding: {0}")]
    KeyEncoding(String),
    #[error("canonical encoding: {0}")]
    Encoding(#[from] bcs::Error),
    #[error("ciphertext too short")]
    Truncated,
    #[error("bad filler length {0}")]
    BadFiller(u8),
    #[error("seed of {0} bytes is too short")]
    ShortSeed(usize),
    #[error("message of {len} bytes exceeds the {max}-byte slot")]
    MessageTooLong { len: usize, max: usize },
    #[error("undecodable anonymous payload")]
    AnonymousPayload,
}

/// A fatal round fault: either a blamable violation or a local failure.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Fault {
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
