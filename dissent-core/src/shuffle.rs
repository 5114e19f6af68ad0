//! Sans-io steps of the verifiable shuffle.
//!
//! The five phases — key exchange, submission, anonymization, verification,
//! reveal — each reduce to a handful of pure functions here; the socket
//! choreography around them lives in the driver crate.

use rand::{seq::SliceRandom, Rng};
use rsa::RsaPrivateKey;
use sha1::{Digest, Sha1};

use crate::{
    error::{CryptoError, Fault, ProtocolViolation, Reason},
    hybrid,
    keys::{self, KeyBook},
    msgs::{GoVote, KeyReveal, SignedEnvelope, TaggedCipher},
    onion, padding, wire, NodeId, RoundId, LEADER,
};

/// The shuffle state machine. Advances monotonically; any fatal fault moves
/// to `Aborted` and no backward edges exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShufflePhase {
    /// Connections are being wired up.
    Init,
    /// Keypairs generated and the key book distributed.
    KeyExchange,
    /// Onion ciphertexts submitted to the leader.
    Submit,
    /// The bag travels the ring, shuffled and peeled at every stop.
    Anonymize,
    /// Membership checked and go votes exchanged.
    Verify,
    /// Secondary keys disclosed and plaintexts recovered.
    Reveal,
    /// The round delivered its outputs.
    Done,
    /// The round failed.
    Aborted,
}

impl ShufflePhase {
    /// The phase number reported in failure records.
    pub fn number(self) -> u8 {
        match self {
            ShufflePhase::Init => 0,
            ShufflePhase::KeyExchange => 1,
            ShufflePhase::Submit => 2,
            ShufflePhase::Anonymize => 3,
            ShufflePhase::Verify => 4,
            ShufflePhase::Reveal => 5,
            ShufflePhase::Done | ShufflePhase::Aborted => 6,
        }
    }
}

/// Leader-side bag assembly from the collected submissions plus its own.
///
/// Rejects mistagged and duplicate ciphertexts, blaming the submitter.
pub fn collect_bag(
    own: TaggedCipher,
    others: Vec<(NodeId, TaggedCipher)>,
    round: RoundId,
) -> Result<Vec<TaggedCipher>, ProtocolViolation> {
    let mut bag = Vec::with_capacity(others.len() + 1);
    for (from, cipher) in others {
        if cipher.round != round {
            return Err(ProtocolViolation::new(from, Reason::RoundMismatch));
        }
        if bag.contains(&cipher) || cipher == own {
            return Err(ProtocolViolation::new(from, Reason::DuplicateCiphertext));
        }
        bag.push(cipher);
    }
    bag.push(own);
    Ok(bag)
}

/// One anonymization stop: permute the bag uniformly at random and remove
/// this node's primary layer from every element.
///
/// `from` identifies the peer that handed the bag over and takes the blame
/// for any defect in it.
pub fn shuffle_and_peel<R: Rng>(
    rng: &mut R,
    key: &RsaPrivateKey,
    round: RoundId,
    expected: usize,
    mut bag: Vec<TaggedCipher>,
    from: NodeId,
) -> Result<Vec<TaggedCipher>, ProtocolViolation> {
    if bag.len() != expected {
        return Err(ProtocolViolation::new(from, Reason::MissingCiphertext));
    }
    bag.shuffle(rng);
    bag.iter()
        .map(|elem| onion::peel(key, elem, round, from))
        .collect()
}

/// SHA-1 over the canonical encoding of the bag.
pub fn bag_digest(bag: &[TaggedCipher]) -> Result<[u8; 20], CryptoError> {
    let bytes = wire::encode(&bag)?;
    Ok(Sha1::digest(&bytes).into())
}

/// Builds this node's verdict on the broadcast bag: go iff its own
/// inner-form ciphertext is a member.
pub fn make_vote(
    id: NodeId,
    round: RoundId,
    bag: &[TaggedCipher],
    own_inner: &TaggedCipher,
) -> Result<GoVote, CryptoError> {
    Ok(GoVote {
        id,
        round,
        go: bag.contains(own_inner),
        digest: bag_digest(bag)?,
    })
}

/// Checks the full vote vector: every vote signed, round-tagged, go, and
/// agreeing with this node's own digest; exactly one vote per participant.
pub fn check_votes(
    votes: &[SignedEnvelope],
    book: &KeyBook,
    round: RoundId,
    digest: [u8; 20],
) -> Result<(), ProtocolViolation> {
    if votes.len() != book.len() {
        return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload));
    }
    let mut seen = vec![false; book.len()];
    for env in votes {
        let payload = book.verify(env)?;
        let vote: GoVote = wire::decode(payload)
            .map_err(|_| ProtocolViolation::new(env.sender, Reason::MalformedPayload))?;
        if vote.id != env.sender || std::mem::replace(&mut seen[vote.id.index()], true) {
            return Err(ProtocolViolation::new(env.sender, Reason::MalformedPayload));
        }
        if vote.round != round {
            return Err(ProtocolViolation::new(vote.id, Reason::RoundMismatch));
        }
        if !vote.go {
            return Err(ProtocolViolation::new(vote.id, Reason::GoFalse));
        }
        if vote.digest != digest {
            return Err(ProtocolViolation::new(vote.id, Reason::BadHash));
        }
    }
    Ok(())
}

/// Validates the disclosed secondary private keys and returns them in id
/// order.
///
/// Each reveal must be signed by its sender and the disclosed private key
/// must match the secondary public key that sender announced during key
/// exchange; a reveal that fails the match is blamed on its sender rather
/// than surfacing later as an unattributable decryption failure.
pub fn collect_reveals(
    reveals: &[SignedEnvelope],
    book: &KeyBook,
    round: RoundId,
) -> Result<Vec<RsaPrivateKey>, ProtocolViolation> {
    if reveals.len() != book.len() {
        return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload));
    }
    let mut keys: Vec<Option<RsaPrivateKey>> = (0..book.len()).map(|_| None).collect();
    for env in reveals {
        let payload = book.verify(env)?;
        let malformed = || ProtocolViolation::new(env.sender, Reason::MalformedPayload);
        let reveal: KeyReveal = wire::decode(payload).map_err(|_| malformed())?;
        if reveal.id != env.sender || reveal.id.index() >= book.len() {
            return Err(malformed());
        }
        if reveal.round != round {
            return Err(ProtocolViolation::new(reveal.id, Reason::RoundMismatch));
        }
        let key = keys::private_from_pem(&reveal.secondary_priv_pem).map_err(|_| malformed())?;
        if Some(&key.to_public_key()) != book.secondary(reveal.id) {
            return Err(malformed());
        }
        if keys[reveal.id.index()].replace(key).is_some() {
            return Err(malformed());
        }
    }
    keys.into_iter()
        .map(|k| k.ok_or_else(|| ProtocolViolation::new(LEADER, Reason::MalformedPayload)))
        .collect()
}

/// Peels the secondary layers off every element of the verified bag, in id
/// order, and strips the submission padding.
pub fn open_bag(
    bag: &[TaggedCipher],
    keys: &[RsaPrivateKey],
    round: RoundId,
) -> Result<Vec<Vec<u8>>, Fault> {
    let mut slots = Vec::with_capacity(bag.len());
    for elem in bag {
        if elem.round != round {
            return Err(ProtocolViolation::new(LEADER, Reason::RoundMismatch).into());
        }
        let mut bytes = elem.bytes.clone();
        for (i, key) in keys.iter().enumerate() {
            bytes = hybrid::open(key, &bytes).map_err(|_| {
                ProtocolViolation::new(NodeId(i as u32), Reason::MalformedPayload)
            })?;
        }
        let msg = padding::unpad(&bytes).ok_or(CryptoError::AnonymousPayload)?;
        slots.push(msg);
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{keys::tests::test_book, sign::sign_envelope};

    const ROUND: RoundId = 42;

    fn submissions(rng: &mut ChaCha20Rng) -> Vec<onion::Onion> {
        let (_, _, book) = test_book();
        [b"hello".as_slice(), b"world", b"!"]
            .iter()
            .map(|msg| {
                let padded = padding::pad(msg, 16).unwrap();
                onion::build(rng, book, ROUND, &padded).unwrap()
            })
            .collect()
    }

    fn run_ring(rng: &mut ChaCha20Rng, onions: &[onion::Onion]) -> Vec<TaggedCipher> {
        let (primaries, _, _) = test_book();
        let mut bag = collect_bag(
            onions[0].outer.clone(),
            vec![
                (NodeId(1), onions[1].outer.clone()),
                (NodeId(2), onions[2].outer.clone()),
            ],
            ROUND,
        )
        .unwrap();
        for (i, key) in primaries.iter().enumerate() {
            let from = NodeId(((i + 2) % 3) as u32);
            bag = shuffle_and_peel(rng, key, ROUND, 3, bag, from).unwrap();
        }
        bag
    }

    #[test]
    fn ring_peel_yields_inner_forms() {
        let mut rng = ChaCha20Rng::seed_from_u64(21);
        let onions = submissions(&mut rng);
        let bag = run_ring(&mut rng, &onions);
        for onion in &onions {
            assert!(bag.contains(&onion.inner));
        }
    }

    #[test]
    fn full_round_recovers_all_messages() {
        let mut rng = ChaCha20Rng::seed_from_u64(22);
        let (_, secondaries, _) = test_book();
        let onions = submissions(&mut rng);
        let bag = run_ring(&mut rng, &onions);

        let digest = bag_digest(&bag).unwrap();
        for (i, onion) in onions.iter().enumerate() {
            let vote = make_vote(NodeId(i as u32), ROUND, &bag, &onion.inner).unwrap();
            assert!(vote.go);
            assert_eq!(vote.digest, digest);
        }

        let mut slots = open_bag(&bag, secondaries, ROUND).unwrap();
        slots.sort();
        assert_eq!(slots, vec![b"!".to_vec(), b"hello".to_vec(), b"world".to_vec()]);
    }

    #[test]
    fn permutations_cover_all_orders() {
        let mut rng = ChaCha20Rng::seed_from_u64(23);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let mut order = [0u8, 1, 2];
            order.shuffle(&mut rng);
            seen.insert(order);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn dropped_own_cipher_votes_no_go() {
        let mut rng = ChaCha20Rng::seed_from_u64(24);
        let onions = submissions(&mut rng);
        let mut bag = run_ring(&mut rng, &onions);
        // The last stop censored node 1's submission.
        bag.retain(|elem| *elem != onions[1].inner);
        bag.push(TaggedCipher {
            round: ROUND,
            bytes: vec![0; 16],
        });

        let vote = make_vote(NodeId(1), ROUND, &bag, &onions[1].inner).unwrap();
        assert!(!vote.go);
    }

    #[test]
    fn no_go_vote_aborts_with_the_voter_blamed() {
        let mut rng = ChaCha20Rng::seed_from_u64(25);
        let (primaries, _, book) = test_book();
        let onions = submissions(&mut rng);
        let bag = run_ring(&mut rng, &onions);
        let digest = bag_digest(&bag).unwrap();

        let votes: Vec<_> = (0..3)
            .map(|i| {
                let mut vote = make_vote(NodeId(i), ROUND, &bag, &onions[i as usize].inner).unwrap();
                if i == 1 {
                    vote.go = false;
                }
                sign_envelope(NodeId(i), &primaries[i as usize], wire::encode(&vote).unwrap())
                    .unwrap()
            })
            .collect();

        let err = check_votes(&votes, book, ROUND, digest).unwrap_err();
        assert_eq!(err.peer, NodeId(1));
        assert_eq!(err.reason, Reason::GoFalse);
    }

    #[test]
    fn tampered_bag_aborts_with_bad_hash() {
        let mut rng = ChaCha20Rng::seed_from_u64(26);
        let (primaries, _, book) = test_book();
        let onions = submissions(&mut rng);
        let bag = run_ring(&mut rng, &onions);

        // The leader tampered with one element after shuffling, so its
        // broadcast digest differs from what honest nodes compute.
        let mut tampered = bag.clone();
        tampered[0].bytes[0] ^= 1;
        let leader_digest = bag_digest(&tampered).unwrap();
        let honest_digest = bag_digest(&bag).unwrap();

        let votes: Vec<_> = (0..3)
            .map(|i| {
                let digest = if i == 0 { leader_digest } else { honest_digest };
                let vote = GoVote {
                    id: NodeId(i),
                    round: ROUND,
                    go: true,
                    digest,
                };
                sign_envelope(NodeId(i), &primaries[i as usize], wire::encode(&vote).unwrap())
                    .unwrap()
            })
            .collect();

        let err = check_votes(&votes, book, ROUND, honest_digest).unwrap_err();
        assert_eq!(err.peer, NodeId(0));
        assert_eq!(err.reason, Reason::BadHash);
    }

    #[test]
    fn forged_vote_signature_is_blamed() {
        let mut rng = ChaCha20Rng::seed_from_u64(27);
        let (primaries, _, book) = test_book();
        let onions = submissions(&mut rng);
        let bag = run_ring(&mut rng, &onions);
        let digest = bag_digest(&bag).unwrap();

        let mut votes: Vec<_> = (0..3)
            .map(|i| {
                let vote = make_vote(NodeId(i), ROUND, &bag, &onions[i as usize].inner).unwrap();
                sign_envelope(NodeId(i), &primaries[i as usize], wire::encode(&vote).unwrap())
                    .unwrap()
            })
            .collect();
        votes[2].sig[4] ^= 0xff;

        let err = check_votes(&votes, book, ROUND, digest).unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::BadSignature);
    }

    #[test]
    fn mismatched_reveal_key_is_blamed() {
        let (primaries, secondaries, book) = test_book();
        let reveals: Vec<_> = (0..3u32)
            .map(|i| {
                // Node 2 discloses a key that is not the one it announced.
                let disclosed = if i == 2 { &primaries[2] } else { &secondaries[i as usize] };
                let reveal = KeyReveal {
                    id: NodeId(i),
                    round: ROUND,
                    secondary_priv_pem: keys::private_to_pem(disclosed).unwrap(),
                };
                sign_envelope(
                    NodeId(i),
                    &primaries[i as usize],
                    wire::encode(&reveal).unwrap(),
                )
                .unwrap()
            })
            .collect();

        let err = collect_reveals(&reveals, book, ROUND).unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::MalformedPayload);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(28);
        let onions = submissions(&mut rng);
        let err = collect_bag(
            onions[0].outer.clone(),
            vec![
                (NodeId(1), onions[1].outer.clone()),
                (NodeId(2), onions[1].outer.clone()),
            ],
            ROUND,
        )
        .unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::DuplicateCiphertext);
    }
}
