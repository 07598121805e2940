//! Binary ⇄ text transcoding for key material and ciphertext.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::errors::{GistError, Result};
use crate::security::secure_rng::random;

/// Prefix for generated message identifiers.
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// Standard (padded, non URL-safe) base64.
pub fn bytes_to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Strict decode: rejects foreign characters, bad padding and non-zero
/// trailing bits.
pub fn base64_to_bytes(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| GistError::Decode(e.to_string()))
}

/// `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>> {
    random::bytes(n)
}

/// `msg_` followed by 16 hex characters of CSPRNG output.
pub fn generate_message_id() -> Result<String> {
    let raw = random::array::<8>()?;
    Ok(format!("{MESSAGE_ID_PREFIX}{}", hex::encode(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(bytes_to_base64(b""), "");
        assert_eq!(bytes_to_base64(b"f"), "Zg==");
        assert_eq!(bytes_to_base64(b"hello"), "aGVsbG8=");
        assert_eq!(bytes_to_base64(&[0xfb, 0xff]), "+/8=");
        assert_eq!(base64_to_bytes("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_malformed_input_rejected() {
        for bad in ["@@@@", "aGVsbG8", "aGVsbG8==", "-_8=", "Zh=="] {
            let err = base64_to_bytes(bad).unwrap_err();
            assert!(matches!(err, GistError::Decode(_)), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_random_bytes_length() {
        assert_eq!(random_bytes(0).unwrap().len(), 0);
        assert_eq!(random_bytes(16).unwrap().len(), 16);
        assert_ne!(random_bytes(16).unwrap(), random_bytes(16).unwrap());
    }

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id().unwrap();
        assert!(id.starts_with(MESSAGE_ID_PREFIX));
        assert_eq!(id.len(), MESSAGE_ID_PREFIX.len() + 16);
        assert!(id[MESSAGE_ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_message_id().unwrap());
    }

    proptest! {
        #[test]
        fn prop_base64_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = bytes_to_base64(&bytes);
            prop_assert_eq!(base64_to_bytes(&encoded).unwrap(), bytes);
        }
    }
}
