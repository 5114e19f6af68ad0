//! Fixed-length message padding for shuffle submissions.
//!
//! All participants of one shuffle instance must agree on `max_len`; the
//! padded form carries the true length so delivery can strip the filler.

use serde::{Deserialize, Serialize};

use crate::{error::CryptoError, wire};

/// The filler byte appended up to the slot size.
pub const FILLER: u8 = b'X';

#[derive(Serialize, Deserialize)]
struct Padded {
    len: u64,
    body: Vec<u8>,
}

/// Pads `msg` to exactly `max_len` bytes of body and encodes canonically.
pub fn pad(msg: &[u8], max_len: usize) -> Result<Vec<u8>, CryptoError> {
    if msg.len() > max_len {
        return Err(CryptoError::MessageTooLong {
            len: msg.len(),
            max: max_len,
        });
    }
    let mut body = Vec::with_capacity(max_len);
    body.extend_from_slice(msg);
    body.resize(max_len, FILLER);
    Ok(wire::encode(&Padded {
        len: msg.len() as u64,
        body,
    })?)
}

/// Recovers the original message, or `None` if the bytes are not a valid
/// padded form.
pub fn unpad(bytes: &[u8]) -> Option<Vec<u8>> {
    let padded: Padded = wire::decode(bytes).ok()?;
    let len = usize::try_from(padded.len).ok()?;
    if len > padded.body.len() {
        return None;
    }
    let mut body = padded.body;
    body.truncate(len);
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_is_invertible() {
        for len in 0..=16 {
            let msg = vec![0xa5u8; len];
            let padded = pad(&msg, 16).unwrap();
            assert_eq!(unpad(&padded).unwrap(), msg);
        }
    }

    #[test]
    fn padded_forms_share_a_length() {
        let a = pad(b"hi", 64).unwrap();
        let b = pad(&[0u8; 64], 64).unwrap();
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn oversized_message_is_refused() {
        assert!(matches!(
            pad(&[0u8; 17], 16),
            Err(CryptoError::MessageTooLong { len: 17, max: 16 })
        ));
    }

    #[test]
    fn lying_length_is_refused() {
        let padded = wire::encode(&Padded {
            len: 99,
            body: vec![FILLER; 16],
        })
        .unwrap();
        assert!(unpad(&padded).is_none());
    }
}
