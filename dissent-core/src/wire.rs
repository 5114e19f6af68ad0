//! The canonical wire encoding.
//!
//! Every composite value that crosses a socket or feeds a digest goes
//! through this module, so encodings are byte-identical across runs and
//! participants. Nothing else in the workspace touches the serializer.

use serde::{de::DeserializeOwned, Serialize};

/// Errors produced by the canonical encoder.
pub type WireError = bcs::Error;

/// Encodes a value with the session's canonical serializer.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bcs::to_bytes(value)
}

/// Decodes a value, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    bcs::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let value = (42u64, vec![1u8, 2, 3], "shuffle".to_string());
        assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0);
        assert!(decode::<u32>(&bytes).is_err());
    }
}
