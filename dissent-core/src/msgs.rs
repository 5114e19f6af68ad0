//! Typed protocol messages.
//!
//! One struct per wire shape, each carrying the round id it belongs to, so
//! malformed or replayed traffic surfaces at parse time rather than deep in
//! a phase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{NodeId, RoundId};

/// Connection preamble, sent once on every freshly opened socket so the
/// accepting side can order its sockets by participant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// The connecting participant.
    pub id: NodeId,
    /// The round the connection belongs to.
    pub round: RoundId,
}

/// A payload signed by its sender's primary key.
///
/// The signature covers `SHA1(payload)` under PKCS#1 v1.5.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Claimed signer, resolved against the key book on verification.
    pub sender: NodeId,
    /// The signed bytes.
    pub payload: Vec<u8>,
    /// PKCS#1 v1.5 signature over the payload digest.
    pub sig: Vec<u8>,
}

/// Key-exchange report, node to leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyReport {
    /// The reporting participant.
    pub id: NodeId,
    /// The round being keyed.
    pub round: RoundId,
    /// Announced address of the reporting participant.
    pub ip: String,
    /// Announced port.
    pub port: u16,
    /// Primary public key, PKCS#1 PEM. Trusted on first use.
    pub primary_pem: String,
    /// Secondary public key PEM, signed under the sender's primary key.
    pub secondary: SignedEnvelope,
}

/// One participant's entry in the announced key book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBookEntry {
    /// Primary public key, PKCS#1 PEM.
    pub primary_pem: String,
    /// The owner's original signed secondary-key envelope.
    pub secondary: SignedEnvelope,
}

/// Key-exchange announcement, leader to all. Travels inside a
/// [`SignedEnvelope`] under the leader's primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBookAnnounce {
    /// The round being keyed.
    pub round: RoundId,
    /// Entries for every participant, keyed by id.
    pub entries: BTreeMap<NodeId, KeyBookEntry>,
}

/// A round-tagged onion element. The bag passed around the ring is a
/// `Vec<TaggedCipher>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedCipher {
    /// The round the element belongs to.
    pub round: RoundId,
    /// The (possibly still layered) ciphertext.
    pub bytes: Vec<u8>,
}

/// A participant's verdict on the final bag. Travels signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoVote {
    /// The voter.
    pub id: NodeId,
    /// The round voted on.
    pub round: RoundId,
    /// Whether the voter found its own inner ciphertext in the bag.
    pub go: bool,
    /// SHA-1 of the canonical encoding of the bag the voter saw.
    pub digest: [u8; 20],
}

/// The full vector of signed votes, leader to all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoVector {
    /// One signed [`GoVote`] per participant, ordered by id.
    pub votes: Vec<SignedEnvelope>,
}

/// Disclosure of a secondary private key. Travels signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyReveal {
    /// The disclosing participant.
    pub id: NodeId,
    /// The round the key was used in.
    pub round: RoundId,
    /// Secondary private key, PKCS#1 PEM.
    pub secondary_priv_pem: String,
}

/// A bulk transmission-slot descriptor, disseminated anonymously through a
/// hosted shuffle round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The slot's author.
    pub author: NodeId,
    /// The round the slot belongs to.
    pub round: RoundId,
    /// Length of the author's plaintext.
    pub msg_len: u64,
    /// Per-recipient pad seeds, each sealed under that recipient's primary
    /// public key.
    pub enc_seeds: Vec<Vec<u8>>,
    /// Per-recipient rolling digests of the expected slot contributions.
    /// The author's own entry covers its cheating pad.
    pub hashes: Vec<[u8; 20]>,
}

/// One participant's contributions to every transmission slot, node to
/// leader. Slot order follows the shuffled descriptor order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PadSet {
    /// The contributor.
    pub id: NodeId,
    /// One byte file per slot.
    pub slots: Vec<Vec<u8>>,
}

/// All participants' pad sets, leader to all, ordered by contributor id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterPads {
    /// One [`PadSet`] per participant.
    pub sets: Vec<PadSet>,
}
