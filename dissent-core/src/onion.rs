//! Double-layer onion construction and single-layer peeling.
//!
//! A submission is encrypted first under every secondary public key and
//! then under every primary public key, both applied in id order
//! `n-1, n-2, …, 0`, so the layer owned by node 0 is outermost and peeling
//! proceeds in ascending id order.

use rand::{CryptoRng, RngCore};
use rsa::RsaPrivateKey;

use crate::{
    error::{CryptoError, ProtocolViolation, Reason},
    hybrid,
    keys::KeyBook,
    msgs::TaggedCipher,
    NodeId, RoundId,
};

/// A participant's submission in both of its onion forms.
#[derive(Debug, Clone)]
pub struct Onion {
    /// The fully layered ciphertext `C`, carrying primary and secondary
    /// layers. Submitted to the leader.
    pub outer: TaggedCipher,
    /// The inner-only form `C'`, carrying just the secondary layers. Kept
    /// private for the membership check after anonymization.
    pub inner: TaggedCipher,
}

/// Builds the two onion forms of `payload`.
pub fn build<R: RngCore + CryptoRng>(
    rng: &mut R,
    book: &KeyBook,
    round: RoundId,
    payload: &[u8],
) -> Result<Onion, CryptoError> {
    let mut inner = payload.to_vec();
    for key in book.secondaries().rev() {
        inner = hybrid::seal(rng, key, &inner)?;
    }

    let mut outer = inner.clone();
    for key in book.primaries().rev() {
        outer = hybrid::seal(rng, key, &outer)?;
    }

    Ok(Onion {
        outer: TaggedCipher {
            round,
            bytes: outer,
        },
        inner: TaggedCipher {
            round,
            bytes: inner,
        },
    })
}

/// Removes one layer from a round-tagged element and re-tags the result.
///
/// Failures are attributed to `from`, the peer that handed the element
/// over.
pub fn peel(
    key: &RsaPrivateKey,
    elem: &TaggedCipher,
    round: RoundId,
    from: NodeId,
) -> Result<TaggedCipher, ProtocolViolation> {
    if elem.round != round {
        return Err(ProtocolViolation::new(from, Reason::RoundMismatch));
    }
    let bytes = hybrid::open(key, &elem.bytes)
        .map_err(|_| ProtocolViolation::new(from, Reason::MalformedPayload))?;
    Ok(TaggedCipher { round, bytes })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::keys::tests::test_book;

    #[test]
    fn full_peel_recovers_the_payload() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let (primaries, secondaries, book) = test_book();
        let onion = build(&mut rng, book, 42, b"peel me").unwrap();

        // Primary layers in id order, as the anonymize phase does.
        let mut elem = onion.outer.clone();
        for (i, key) in primaries.iter().enumerate() {
            elem = peel(key, &elem, 42, NodeId(i as u32)).unwrap();
        }
        assert_eq!(elem, onion.inner);

        // Then the revealed secondary layers.
        for (i, key) in secondaries.iter().enumerate() {
            elem = peel(key, &elem, 42, NodeId(i as u32)).unwrap();
        }
        assert_eq!(elem.bytes, b"peel me");
    }

    #[test]
    fn mistagged_element_blames_the_forwarder() {
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let (primaries, _, book) = test_book();
        let onion = build(&mut rng, book, 42, b"x").unwrap();
        let stale = TaggedCipher {
            round: 41,
            ..onion.outer
        };
        let err = peel(&primaries[0], &stale, 42, NodeId(2)).unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::RoundMismatch);
    }
}
