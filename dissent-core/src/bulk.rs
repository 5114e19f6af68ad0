//! Sans-io steps of the bulk transport.
//!
//! Each author turns its plaintext into a slot descriptor plus a cheating
//! pad: the pad is the plaintext XORed with one pseudo-random stream per
//! other participant, and the descriptor carries each participant's sealed
//! stream seed together with the rolling digest its expansion must match.
//! The descriptor's digest entry for the author itself covers the cheating
//! pad, so recipients validate every slot file the same way. Descriptors
//! are disseminated through a hosted shuffle round; the pads travel in the
//! clear and XOR back to the plaintext.

use rand::{CryptoRng, RngCore};
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};

use crate::{
    error::{CryptoError, Fault, ProtocolViolation, Reason},
    hybrid,
    keys::KeyBook,
    msgs::Descriptor,
    prg::{self, Prg},
    wire, NodeId, RoundId, LEADER,
};

/// Streaming block size for pad generation and expansion.
pub const XOR_BLOCK: usize = 8192;

/// Upper bound accepted for a slot's plaintext length.
pub const MAX_SLOT_LEN: u64 = 1 << 30;

/// The bulk state machine. Advances monotonically; descriptor
/// dissemination hosts a complete shuffle round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPhase {
    /// Connections are being wired up.
    Init,
    /// Keypairs generated and the key book distributed.
    KeyExchange,
    /// Seeds drawn, pads streamed, descriptors built.
    DescriptorGen,
    /// Descriptors disseminated through a hosted shuffle.
    DescriptorShuffle,
    /// Per-slot contributions expanded, checked, and exchanged.
    Transmit,
    /// Slot files cross-checked and plaintexts delivered.
    Verify,
    /// The round delivered its outputs.
    Done,
    /// The round failed.
    Aborted,
}

impl BulkPhase {
    /// The phase number reported in failure records.
    pub fn number(self) -> u8 {
        match self {
            BulkPhase::Init | BulkPhase::KeyExchange => 0,
            BulkPhase::DescriptorGen => 1,
            BulkPhase::DescriptorShuffle => 2,
            BulkPhase::Transmit => 3,
            BulkPhase::Verify => 4,
            BulkPhase::Done | BulkPhase::Aborted => 5,
        }
    }
}

/// Everything an author derives from its own plaintext.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The slot descriptor to disseminate anonymously.
    pub descriptor: Descriptor,
    /// The file this author will contribute for its own slot.
    pub cheating_pad: Vec<u8>,
    /// The sealed seed addressed to the author itself; its reappearance in
    /// a shuffled descriptor marks the author's own slot.
    pub own_seed_cipher: Vec<u8>,
}

/// Builds the author's descriptor and cheating pad from its plaintext.
pub fn prepare_submission<R: RngCore + CryptoRng>(
    rng: &mut R,
    book: &KeyBook,
    id: NodeId,
    round: RoundId,
    msg: &[u8],
) -> Result<Submission, CryptoError> {
    let n = book.len();
    let seeds: Vec<Vec<u8>> = (0..n).map(|_| prg::random_seed(rng)).collect();
    let mut gens = seeds
        .iter()
        .map(|s| Prg::from_seed(s))
        .collect::<Result<Vec<_>, _>>()?;

    let mut pad = Vec::with_capacity(msg.len());
    let mut pad_digest = Sha1::new();
    for chunk in msg.chunks(XOR_BLOCK) {
        let mut block = chunk.to_vec();
        for (j, gen) in gens.iter_mut().enumerate() {
            if j == id.index() {
                continue;
            }
            let stream = gen.next_bytes(block.len());
            for (b, s) in block.iter_mut().zip(stream.iter()) {
                *b ^= *s;
            }
        }
        pad_digest.update(&block);
        pad.extend_from_slice(&block);
    }

    let mut hashes: Vec<[u8; 20]> = gens.iter().map(|g| g.hash()).collect();
    hashes[id.index()] = pad_digest.finalize().into();

    let enc_seeds = book
        .primaries()
        .zip(&seeds)
        .map(|(key, seed)| hybrid::seal(rng, key, seed))
        .collect::<Result<Vec<_>, _>>()?;
    let own_seed_cipher = enc_seeds[id.index()].clone();

    Ok(Submission {
        descriptor: Descriptor {
            author: id,
            round,
            msg_len: msg.len() as u64,
            enc_seeds,
            hashes,
        },
        cheating_pad: pad,
        own_seed_cipher,
    })
}

/// The slot size every participant must use for the hosted descriptor
/// shuffle: the next power of two at or above the canonical descriptor
/// size. Descriptor encodings have one size per session, so every
/// participant derives the same value independently.
pub fn shuffle_slot_len(descriptor: &Descriptor) -> Result<usize, CryptoError> {
    Ok(wire::encode(descriptor)?.len().next_power_of_two())
}

/// Parses and validates the shuffled descriptor payloads.
pub fn parse_descriptors(
    slots: &[Vec<u8>],
    round: RoundId,
    n: usize,
) -> Result<Vec<Descriptor>, Fault> {
    let mut descriptors = Vec::with_capacity(slots.len());
    for bytes in slots {
        let desc: Descriptor =
            wire::decode(bytes).map_err(|_| CryptoError::AnonymousPayload)?;
        if desc.author.index() >= n {
            return Err(CryptoError::AnonymousPayload.into());
        }
        if desc.round != round {
            return Err(ProtocolViolation::new(desc.author, Reason::RoundMismatch).into());
        }
        if desc.enc_seeds.len() != n || desc.hashes.len() != n || desc.msg_len > MAX_SLOT_LEN {
            return Err(ProtocolViolation::new(desc.author, Reason::MalformedPayload).into());
        }
        descriptors.push(desc);
    }
    Ok(descriptors)
}

/// Produces this participant's file for one slot.
///
/// The author's own slot is recognized purely by the sealed seed matching
/// the one this participant produced for itself — the construction is
/// broken if this is ever decided any other way — and is answered with the
/// cheating pad. Every other slot is answered by expanding the seed sealed
/// for this participant and cross-checking the descriptor's digest, with a
/// mismatch blamed on the slot's author.
///
/// Returns the file and whether it was the participant's own slot.
pub fn slot_contribution(
    desc: &Descriptor,
    slot: usize,
    me: NodeId,
    key: &RsaPrivateKey,
    own: &Submission,
) -> Result<(Vec<u8>, bool), Fault> {
    let seed_cipher = &desc.enc_seeds[me.index()];
    if *seed_cipher == own.own_seed_cipher {
        return Ok((own.cheating_pad.clone(), true));
    }

    let blame = |reason: Reason| ProtocolViolation::new(desc.author, reason).with_slot(slot);
    let seed = hybrid::open(key, seed_cipher).map_err(|_| blame(Reason::MalformedPayload))?;
    let mut gen = Prg::from_seed(&seed).map_err(|_| blame(Reason::MalformedPayload))?;

    let len = desc.msg_len as usize;
    let mut out = Vec::with_capacity(len);
    let mut left = len;
    while left > 0 {
        let take = left.min(XOR_BLOCK);
        out.extend(gen.next_bytes(take));
        left -= take;
    }
    if gen.hash() != desc.hashes[me.index()] {
        return Err(blame(Reason::BadHash).into());
    }
    Ok((out, false))
}

/// Recovers one slot's plaintext from all participants' files, checking
/// every file against the descriptor's digest for its contributor.
pub fn combine_slot(
    desc: &Descriptor,
    slot: usize,
    contributions: &[Vec<u8>],
) -> Result<Vec<u8>, ProtocolViolation> {
    if contributions.len() != desc.hashes.len() {
        return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload).with_slot(slot));
    }
    let len = desc.msg_len as usize;
    let mut out = vec![0u8; len];
    for (j, bytes) in contributions.iter().enumerate() {
        let blame = |reason: Reason| ProtocolViolation::new(NodeId(j as u32), reason).with_slot(slot);
        if bytes.len() != len {
            return Err(blame(Reason::MalformedPayload));
        }
        let digest: [u8; 20] = Sha1::digest(bytes).into();
        if digest != desc.hashes[j] {
            return Err(blame(Reason::BadHash));
        }
        for (o, b) in out.iter_mut().zip(bytes.iter()) {
            *o ^= *b;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::keys::tests::test_book;

    const ROUND: RoundId = 42;

    fn messages() -> Vec<Vec<u8>> {
        let mut rng = ChaCha20Rng::seed_from_u64(31);
        let mut long = vec![0u8; 10_000];
        rng.fill_bytes(&mut long);
        vec![long, b"short".to_vec(), Vec::new()]
    }

    fn submissions() -> Vec<Submission> {
        let mut rng = ChaCha20Rng::seed_from_u64(32);
        let (_, _, book) = test_book();
        messages()
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                prepare_submission(&mut rng, book, NodeId(i as u32), ROUND, msg).unwrap()
            })
            .collect()
    }

    #[test]
    fn slots_reassemble_to_the_plaintexts() {
        let (primaries, _, _) = test_book();
        let subs = submissions();
        let msgs = messages();

        // Descriptors arrive in shuffled order.
        let order = [2usize, 0, 1];
        let mut own_matches = vec![0usize; 3];
        for (slot, &author) in order.iter().enumerate() {
            let desc = &subs[author].descriptor;
            let contributions: Vec<Vec<u8>> = (0..3)
                .map(|j| {
                    let (bytes, own) = slot_contribution(
                        desc,
                        slot,
                        NodeId(j as u32),
                        &primaries[j],
                        &subs[j],
                    )
                    .unwrap();
                    if own {
                        own_matches[j] += 1;
                    }
                    bytes
                })
                .collect();
            assert_eq!(combine_slot(desc, slot, &contributions).unwrap(), msgs[author]);
        }
        // Exactly one own-slot match per participant.
        assert_eq!(own_matches, vec![1, 1, 1]);
    }

    #[test]
    fn descriptor_sizes_agree_across_authors() {
        let subs = submissions();
        let lens: Vec<_> = subs
            .iter()
            .map(|s| shuffle_slot_len(&s.descriptor).unwrap())
            .collect();
        assert_eq!(lens[0], lens[1]);
        assert_eq!(lens[1], lens[2]);
    }

    #[test]
    fn bad_stream_hash_blames_the_author_and_slot() {
        let (primaries, _, _) = test_book();
        let mut subs = submissions();
        // Author 1 publishes a digest that its sealed seed cannot produce.
        subs[1].descriptor.hashes[0] = [0u8; 20];

        let err = match slot_contribution(&subs[1].descriptor, 1, NodeId(0), &primaries[0], &subs[0])
        {
            Err(Fault::Violation(v)) => v,
            other => panic!("expected a violation, got {other:?}"),
        };
        assert_eq!(err.peer, NodeId(1));
        assert_eq!(err.reason, Reason::BadHash);
        assert_eq!(err.slot, Some(1));
    }

    #[test]
    fn censored_descriptor_never_matches_own_slot() {
        let (primaries, _, _) = test_book();
        let subs = submissions();
        // Node 1's descriptor was censored: only 0's and 2's survive.
        let mut own = 0;
        for (slot, author) in [0usize, 2].into_iter().enumerate() {
            let desc = &subs[author].descriptor;
            let (_, is_own) =
                slot_contribution(desc, slot, NodeId(1), &primaries[1], &subs[1]).unwrap();
            if is_own {
                own += 1;
            }
        }
        assert_eq!(own, 0);
    }

    #[test]
    fn corrupted_contribution_blames_the_contributor() {
        let (primaries, _, _) = test_book();
        let subs = submissions();
        let desc = &subs[1].descriptor;
        let mut contributions: Vec<Vec<u8>> = (0..3)
            .map(|j| {
                slot_contribution(desc, 0, NodeId(j as u32), &primaries[j], &subs[j])
                    .unwrap()
                    .0
            })
            .collect();
        contributions[2][0] ^= 1;

        let err = combine_slot(desc, 0, &contributions).unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::BadHash);
        assert_eq!(err.slot, Some(0));
    }

    #[test]
    fn mistagged_descriptor_blames_its_author() {
        let subs = submissions();
        let mut desc = subs[2].descriptor.clone();
        desc.round = 41;
        let encoded = wire::encode(&desc).unwrap();
        let err = match parse_descriptors(&[encoded], ROUND, 3) {
            Err(Fault::Violation(v)) => v,
            other => panic!("expected a violation, got {other:?}"),
        };
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::RoundMismatch);
    }
}
