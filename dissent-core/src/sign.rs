//! Signed envelopes.

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::{
    error::{CryptoError, ProtocolViolation, Reason},
    msgs::SignedEnvelope,
    NodeId,
};

/// Signs `payload` with the sender's primary key: a PKCS#1 v1.5 signature
/// over `SHA1(payload)`.
pub fn sign_envelope(
    sender: NodeId,
    key: &RsaPrivateKey,
    payload: Vec<u8>,
) -> Result<SignedEnvelope, CryptoError> {
    let digest = Sha1::digest(&payload);
    let sig = key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)?;
    Ok(SignedEnvelope {
        sender,
        payload,
        sig,
    })
}

/// Verifies an envelope under the given primary public key and returns the
/// signed payload.
pub fn verify_envelope<'a>(
    env: &'a SignedEnvelope,
    key: &RsaPublicKey,
) -> Result<&'a [u8], ProtocolViolation> {
    let digest = Sha1::digest(&env.payload);
    key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &env.sig)
        .map_err(|_| ProtocolViolation::new(env.sender, Reason::BadSignature))?;
    Ok(&env.payload)
}
