//! Core types and primitives for the accountable-anonymity round protocols.
//!
//! This crate is sans-io: it holds the cryptographic primitives, the typed
//! wire messages with their canonical encoding, and the pure step functions
//! of the shuffle and bulk engines. Socket choreography lives in the
//! `dissent` crate.
#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]

pub mod bulk;
pub mod error;
pub mod hybrid;
pub mod keys;
pub mod msgs;
pub mod onion;
pub mod padding;
pub mod prg;
pub mod shuffle;
pub mod sign;
pub mod wire;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a participant in the fixed ring `0..n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The participant's position as a collection index.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this participant coordinates the round.
    pub fn is_leader(self) -> bool {
        self == LEADER
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// The coordinator's id.
pub const LEADER: NodeId = NodeId(0);

/// Round identifier carried by every envelope of a session.
pub type RoundId = u64;
