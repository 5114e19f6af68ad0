//! Hybrid RSA/AES encryption.
//!
//! The standard construction: the message body is encrypted under a fresh
//! 32-byte session key with AES-256-CBC, and the session key is wrapped
//! with RSA-OAEP. The ciphertext is `wrapped_key || aes_body`, with the
//! wrapped key taking exactly one modulus width.

use aes::Aes256;
use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use rand::{CryptoRng, RngCore};
use rsa::{traits::PublicKeyParts, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

use crate::error::CryptoError;

/// Fixed CBC initialization vector, zero-extended to the AES block size.
///
/// Reused across messages as part of the wire contract; each message is
/// encrypted under a fresh session key.
pub const FIXED_IV: [u8; 16] = *b"al*73lf9)982\0\0\0\0";

/// Width of the AES session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Encrypts `msg` for the holder of `key`.
///
/// The body is prefixed with a single byte holding the filler length, so
/// one byte less filler is needed to reach a whole number of blocks.
pub fn seal<R: RngCore + CryptoRng>(
    rng: &mut R,
    key: &RsaPublicKey,
    msg: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut session_key = [0u8; SESSION_KEY_LEN];
    rng.fill_bytes(&mut session_key);

    let filler = ((16 - (msg.len() % 16)) - 1) % 16;
    let mut body = Vec::with_capacity(1 + msg.len() + filler);
    body.push(filler as u8);
    body.extend_from_slice(msg);
    body.resize(1 + msg.len() + filler, 0);
    cbc_encrypt(&session_key, &mut body);

    let mut out = key.encrypt(rng, Oaep::new::<Sha1>(), &session_key)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverts [`seal`] under the matching private key.
pub fn open(key: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let wrapped_len = key.size();
    if cipher.len() <= wrapped_len {
        return Err(CryptoError::Truncated);
    }
    let (wrapped, body) = cipher.split_at(wrapped_len);
    if body.len() % 16 != 0 {
        return Err(CryptoError::Truncated);
    }

    let session_key: [u8; SESSION_KEY_LEN] = key
        .decrypt(Oaep::new::<Sha1>(), wrapped)?
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::Truncated)?;

    let mut body = body.to_vec();
    cbc_decrypt(&session_key, &mut body);

    let filler = body[0] as usize;
    if filler > 15 || 1 + filler > body.len() {
        return Err(CryptoError::BadFiller(body[0]));
    }
    Ok(body[1..body.len() - filler].to_vec())
}

fn cbc_encrypt(key: &[u8; SESSION_KEY_LEN], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let aes = Aes256::new(GenericArray::from_slice(key));
    let mut prev = FIXED_IV;
    for block in data.chunks_exact_mut(16) {
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= *p;
        }
        aes.encrypt_block(GenericArray::from_mut_slice(block));
        prev.copy_from_slice(block);
    }
}

fn cbc_decrypt(key: &[u8; SESSION_KEY_LEN], data: &mut [u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    let aes = Aes256::new(GenericArray::from_slice(key));
    let mut prev = FIXED_IV;
    for block in data.chunks_exact_mut(16) {
        let mut saved = [0u8; 16];
        saved.copy_from_slice(block);
        aes.decrypt_block(GenericArray::from_mut_slice(block));
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= *p;
        }
        prev = saved;
    }
}
