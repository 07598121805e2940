use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::crypto::cipher::KdfParams;
use crate::crypto::codec::{base64_to_bytes, bytes_to_base64};
use crate::errors::{GistError, Result};
use crate::security::secure_rng::random;

const VERIFIER_SALT_LEN: usize = 16;
const VERIFIER_LEN: usize = 32;

// Keeps verifier hashes unrelated to any envelope key derived from the same
// passphrase and salt.
const VERIFIER_CONTEXT: &[u8] = b"gist-passphrase-verifier-v1";

/// Salted PBKDF2 hash used to check a passphrase locally.
///
/// Stored on the device in place of the passphrase itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseVerifier {
    salt: String,
    hash: String,
    iterations: u32,
}

fn compute(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; VERIFIER_LEN] {
    let mut salted = Vec::with_capacity(VERIFIER_CONTEXT.len() + salt.len());
    salted.extend_from_slice(VERIFIER_CONTEXT);
    salted.extend_from_slice(salt);

    let mut out = [0u8; VERIFIER_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salted, iterations, &mut out);
    out
}

impl PassphraseVerifier {
    pub fn create(passphrase: &str, params: &KdfParams) -> Result<Self> {
        let salt = random::array::<VERIFIER_SALT_LEN>()?;
        let hash = compute(passphrase, &salt, params.iterations());
        Ok(Self {
            salt: bytes_to_base64(&salt),
            hash: bytes_to_base64(&hash),
            iterations: params.iterations(),
        })
    }

    /// Constant-time comparison against the stored hash.
    pub fn matches(&self, passphrase: &str) -> Result<bool> {
        let salt = base64_to_bytes(&self.salt)?;
        let expected = base64_to_bytes(&self.hash)?;
        let actual = compute(passphrase, &salt, self.iterations);
        Ok(actual.as_slice().ct_eq(expected.as_slice()).into())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GistError::Storage(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GistError::Storage(format!("corrupt passphrase verifier: {e}")))
    }
}
