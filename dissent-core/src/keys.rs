//! Keypairs and the per-round key book.
//!
//! Every participant holds two RSA keypairs: a primary pair that signs
//! protocol messages and carries the outer onion layer, and a per-round
//! secondary pair whose private half is disclosed in the reveal phase.
//! Primary public keys are trusted on first use; secondary public keys must
//! arrive signed by their owner's primary key.

use std::collections::BTreeMap;

use rand::{CryptoRng, RngCore};
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey},
    pkcs8::LineEnding,
    RsaPrivateKey, RsaPublicKey,
};

use crate::{
    error::{CryptoError, ProtocolViolation, Reason},
    msgs::{KeyBookAnnounce, KeyBookEntry, KeyReport, SignedEnvelope},
    sign, wire, NodeId, RoundId, LEADER,
};

/// Generates a fresh RSA keypair with public exponent 65537.
pub fn generate<R: RngCore + CryptoRng>(
    rng: &mut R,
    bits: usize,
) -> Result<RsaPrivateKey, CryptoError> {
    Ok(RsaPrivateKey::new(rng, bits)?)
}

/// Encodes a public key as PKCS#1 PEM.
pub fn public_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// Decodes a PKCS#1 PEM public key.
pub fn public_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// Encodes a private key as PKCS#1 PEM.
pub fn private_to_pem(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// Decodes a PKCS#1 PEM private key.
pub fn private_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

#[derive(Debug, Clone)]
struct BookEntry {
    primary: RsaPublicKey,
    secondary: RsaPublicKey,
}

/// The validated mapping from participant id to its two public keys.
///
/// Built once during key exchange, read-only afterwards. A book always
/// covers the contiguous id range `0..n`.
#[derive(Debug, Clone)]
pub struct KeyBook {
    entries: Vec<BookEntry>,
}

impl KeyBook {
    /// Number of participants covered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the book is empty. A usable book never is.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The primary public key of `id`, if `id` is in range.
    pub fn primary(&self, id: NodeId) -> Option<&RsaPublicKey> {
        self.entries.get(id.index()).map(|e| &e.primary)
    }

    /// The secondary public key of `id`, if `id` is in range.
    pub fn secondary(&self, id: NodeId) -> Option<&RsaPublicKey> {
        self.entries.get(id.index()).map(|e| &e.secondary)
    }

    /// All primary public keys, in id order.
    pub fn primaries(&self) -> impl DoubleEndedIterator<Item = &RsaPublicKey> {
        self.entries.iter().map(|e| &e.primary)
    }

    /// All secondary public keys, in id order.
    pub fn secondaries(&self) -> impl DoubleEndedIterator<Item = &RsaPublicKey> {
        self.entries.iter().map(|e| &e.secondary)
    }

    /// Verifies an envelope under its claimed sender's primary key and
    /// returns the signed payload.
    pub fn verify<'a>(&self, env: &'a SignedEnvelope) -> Result<&'a [u8], ProtocolViolation> {
        let key = self
            .primary(env.sender)
            .ok_or_else(|| ProtocolViolation::new(env.sender, Reason::MalformedPayload))?;
        sign::verify_envelope(env, key)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(parts: Vec<(RsaPublicKey, RsaPublicKey)>) -> Self {
        Self {
            entries: parts
                .into_iter()
                .map(|(primary, secondary)| BookEntry { primary, secondary })
                .collect(),
        }
    }
}

/// Leader-side assembly: validates every report (round tag, id range,
/// signed secondary attestation) and produces both the broadcastable
/// announcement and the leader's own book.
pub fn build_announce(
    round: RoundId,
    n: usize,
    reports: &[KeyReport],
) -> Result<(KeyBookAnnounce, KeyBook), ProtocolViolation> {
    if reports.len() != n {
        return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload));
    }

    let mut entries = BTreeMap::new();
    let mut slots: Vec<Option<BookEntry>> = (0..n).map(|_| None).collect();
    for report in reports {
        let id = report.id;
        if report.round != round {
            return Err(ProtocolViolation::new(id, Reason::RoundMismatch));
        }
        if id.index() >= n || slots[id.index()].is_some() {
            return Err(ProtocolViolation::new(id, Reason::MalformedPayload));
        }
        let (primary, secondary) = validate_entry(id, &report.primary_pem, &report.secondary)?;
        slots[id.index()] = Some(BookEntry { primary, secondary });
        entries.insert(
            id,
            KeyBookEntry {
                primary_pem: report.primary_pem.clone(),
                secondary: report.secondary.clone(),
            },
        );
    }

    let entries_vec = slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| ProtocolViolation::new(LEADER, Reason::MalformedPayload)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        KeyBookAnnounce { round, entries },
        KeyBook {
            entries: entries_vec,
        },
    ))
}

/// Member-side validation of the leader's signed announcement.
///
/// The leader's own primary key is taken from the announcement itself, so
/// the outer signature is checked only after the inner entries validate.
pub fn verify_announce(
    env: &SignedEnvelope,
    round: RoundId,
    n: usize,
) -> Result<KeyBook, ProtocolViolation> {
    if env.sender != LEADER {
        return Err(ProtocolViolation::new(env.sender, Reason::MalformedPayload));
    }
    let announce: KeyBookAnnounce = wire::decode(&env.payload)
        .map_err(|_| ProtocolViolation::new(LEADER, Reason::MalformedPayload))?;
    let book = book_from_announce(&announce, round, n)?;
    book.verify(env)?;
    Ok(book)
}

fn book_from_announce(
    announce: &KeyBookAnnounce,
    round: RoundId,
    n: usize,
) -> Result<KeyBook, ProtocolViolation> {
    if announce.round != round {
        return Err(ProtocolViolation::new(LEADER, Reason::RoundMismatch));
    }
    if announce.entries.len() != n {
        return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload));
    }

    let mut entries = Vec::with_capacity(n);
    for (expected, (id, entry)) in announce.entries.iter().enumerate() {
        if id.index() != expected {
            return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload));
        }
        let (primary, secondary) = validate_entry(*id, &entry.primary_pem, &entry.secondary)?;
        entries.push(BookEntry { primary, secondary });
    }
    Ok(KeyBook { entries })
}

fn validate_entry(
    id: NodeId,
    primary_pem: &str,
    secondary: &SignedEnvelope,
) -> Result<(RsaPublicKey, RsaPublicKey), ProtocolViolation> {
    let malformed = || ProtocolViolation::new(id, Reason::MalformedPayload);
    let primary = public_from_pem(primary_pem).map_err(|_| malformed())?;
    if secondary.sender != id {
        return Err(malformed());
    }
    let payload = sign::verify_envelope(secondary, &primary)?;
    let pem = std::str::from_utf8(payload).map_err(|_| malformed())?;
    let secondary = public_from_pem(pem).map_err(|_| malformed())?;
    Ok((primary, secondary))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::sign::sign_envelope;

    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    static BOOK: OnceLock<(Vec<RsaPrivateKey>, Vec<RsaPrivateKey>, KeyBook)> = OnceLock::new();

    /// One shared 1024-bit key; generation is slow enough to amortize.
    pub(crate) fn test_keypair() -> &'static RsaPrivateKey {
        KEY.get_or_init(|| generate(&mut ChaCha20Rng::seed_from_u64(0xd15), 1024).unwrap())
    }

    /// Three participants' worth of primary/secondary keys plus their book.
    pub(crate) fn test_book() -> &'static (Vec<RsaPrivateKey>, Vec<RsaPrivateKey>, KeyBook) {
        BOOK.get_or_init(|| {
            let primaries: Vec<_> = (0..3)
                .map(|i| generate(&mut ChaCha20Rng::seed_from_u64(100 + i), 1024).unwrap())
                .collect();
            let secondaries: Vec<_> = (0..3)
                .map(|i| generate(&mut ChaCha20Rng::seed_from_u64(200 + i), 1024).unwrap())
                .collect();
            let parts = primaries
                .iter()
                .zip(&secondaries)
                .map(|(p, s)| (p.to_public_key(), s.to_public_key()))
                .collect();
            (primaries, secondaries, KeyBook::from_parts(parts))
        })
    }

    fn report_for(id: u32, round: RoundId) -> KeyReport {
        let (primaries, secondaries, _) = test_book();
        let primary = &primaries[id as usize];
        let secondary_pem = public_to_pem(&secondaries[id as usize].to_public_key()).unwrap();
        let secondary =
            sign_envelope(NodeId(id), primary, secondary_pem.into_bytes()).unwrap();
        KeyReport {
            id: NodeId(id),
            round,
            ip: "127.0.0.1".into(),
            port: 7000 + id as u16,
            primary_pem: public_to_pem(&primary.to_public_key()).unwrap(),
            secondary,
        }
    }

    #[test]
    fn announce_roundtrip() {
        let round = 42;
        let reports: Vec<_> = (0..3).map(|i| report_for(i, round)).collect();
        let (announce, leader_book) = build_announce(round, 3, &reports).unwrap();
        assert_eq!(leader_book.len(), 3);

        let (primaries, secondaries, _) = test_book();
        let env = sign_envelope(LEADER, &primaries[0], wire::encode(&announce).unwrap()).unwrap();
        let book = verify_announce(&env, round, 3).unwrap();
        for i in 0..3u32 {
            assert_eq!(
                book.secondary(NodeId(i)).unwrap(),
                &secondaries[i as usize].to_public_key()
            );
        }
    }

    #[test]
    fn mismatched_report_round_is_blamed() {
        let reports = vec![report_for(0, 42), report_for(1, 41), report_for(2, 42)];
        let err = build_announce(42, 3, &reports).unwrap_err();
        assert_eq!(err.peer, NodeId(1));
        assert_eq!(err.reason, Reason::RoundMismatch);
    }

    #[test]
    fn unsigned_secondary_is_blamed() {
        let mut reports: Vec<_> = (0..3).map(|i| report_for(i, 42)).collect();
        reports[2].secondary.sig[0] ^= 1;
        let err = build_announce(42, 3, &reports).unwrap_err();
        assert_eq!(err.peer, NodeId(2));
        assert_eq!(err.reason, Reason::BadSignature);
    }

    #[test]
    fn announce_signed_by_non_leader_is_rejected() {
        let round = 42;
        let reports: Vec<_> = (0..3).map(|i| report_for(i, round)).collect();
        let (announce, _) = build_announce(round, 3, &reports).unwrap();
        let (primaries, _, _) = test_book();
        // Signed by node 1 instead of the leader.
        let env = sign_envelope(LEADER, &primaries[1], wire::encode(&announce).unwrap()).unwrap();
        let err = verify_announce(&env, round, 3).unwrap_err();
        assert_eq!(err.reason, Reason::BadSignature);
    }

    #[test]
    fn pem_roundtrip() {
        let key = test_keypair();
        let public = key.to_public_key();
        assert_eq!(
            public_from_pem(&public_to_pem(&public).unwrap()).unwrap(),
            public
        );
        let recovered = private_from_pem(&private_to_pem(key).unwrap()).unwrap();
        assert_eq!(recovered.to_public_key(), public);
    }
}
