//! Passphrase envelopes: PBKDF2-HMAC-SHA256 → AES-256-GCM.
//!
//! Every envelope carries its own random salt and IV, so the passphrase is
//! the only secret needed to open it. The PBKDF2 round count is *not* stored
//! in the envelope; both sides must agree on it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::codec::{base64_to_bytes, bytes_to_base64};
use crate::errors::{GistError, Result};
use crate::security::secure_rng::random;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// AES-GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

/// AES-GCM tag length; every valid ciphertext is at least this long.
pub const TAG_LEN: usize = 16;

pub const KEY_LEN: usize = 32;

/// Default and minimum PBKDF2 round count.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Key derivation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    iterations: u32,
}

impl KdfParams {
    pub fn new(iterations: u32) -> Result<Self> {
        if iterations < PBKDF2_ITERATIONS {
            return Err(GistError::Validation(format!(
                "PBKDF2 needs at least {PBKDF2_ITERATIONS} iterations, got {iterations}"
            )));
        }
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

/// AES-256-GCM key derived from a passphrase.
///
/// Only sealing and opening are exposed; the raw bytes never leave this
/// type, and they are wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct MessageKey([u8; KEY_LEN]);

impl MessageKey {
    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(&self.0.into())
    }

    pub fn seal(&self, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|_| GistError::Encryption("AES-GCM seal failed".into()))
    }

    pub fn open(&self, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| GistError::DecryptionFailed)
    }
}

/// Stretch `passphrase` with PBKDF2-HMAC-SHA256 into a [`MessageKey`].
pub fn derive_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> MessageKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, params.iterations, &mut key);
    MessageKey(key)
}

/// Ciphertext plus the public parameters needed to open it.
///
/// Serialized as `{ "content", "salt", "iv" }`, all standard base64.
/// Deserialization validates encoding and lengths, so a value of this type
/// is always structurally sound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct EncryptedEnvelope {
    content: Vec<u8>,
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    content: String,
    salt: String,
    iv: String,
}

impl EncryptedEnvelope {
    pub fn new(content: Vec<u8>, salt: [u8; SALT_LEN], iv: [u8; IV_LEN]) -> Result<Self> {
        if content.len() < TAG_LEN {
            return Err(GistError::Validation(format!(
                "envelope content must be at least {TAG_LEN} bytes"
            )));
        }
        Ok(Self { content, salt, iv })
    }

    /// Build from the three base64 fields.
    ///
    /// `Decode` on malformed base64, `Validation` on wrong lengths.
    pub fn from_base64(content: &str, salt: &str, iv: &str) -> Result<Self> {
        let content = base64_to_bytes(content)?;
        let salt = fixed::<SALT_LEN>("salt", &base64_to_bytes(salt)?)?;
        let iv = fixed::<IV_LEN>("iv", &base64_to_bytes(iv)?)?;
        Self::new(content, salt, iv)
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn content_base64(&self) -> String {
        bytes_to_base64(&self.content)
    }

    pub fn salt_base64(&self) -> String {
        bytes_to_base64(&self.salt)
    }

    pub fn iv_base64(&self) -> String {
        bytes_to_base64(&self.iv)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| GistError::Encryption(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GistError::Validation(e.to_string()))
    }
}

impl TryFrom<WireEnvelope> for EncryptedEnvelope {
    type Error = GistError;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        Self::from_base64(&wire.content, &wire.salt, &wire.iv)
    }
}

impl From<EncryptedEnvelope> for WireEnvelope {
    fn from(envelope: EncryptedEnvelope) -> Self {
        WireEnvelope {
            content: envelope.content_base64(),
            salt: envelope.salt_base64(),
            iv: envelope.iv_base64(),
        }
    }
}

fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        GistError::Validation(format!(
            "envelope {field} must be {N} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Encrypt `plaintext` under `passphrase` with a fresh salt and IV.
pub fn encrypt_with(plaintext: &str, passphrase: &str, params: &KdfParams) -> Result<EncryptedEnvelope> {
    let salt = random::array::<SALT_LEN>()?;
    let iv = random::array::<IV_LEN>()?;
    let key = derive_key(passphrase, &salt, params);
    let content = key.seal(&iv, plaintext.as_bytes())?;
    debug!(bytes = content.len(), "sealed envelope");
    EncryptedEnvelope::new(content, salt, iv)
}

/// Open `envelope`. Any failure is reported as
/// [`GistError::DecryptionFailed`] and nothing else.
pub fn decrypt_with(envelope: &EncryptedEnvelope, passphrase: &str, params: &KdfParams) -> Result<String> {
    let key = derive_key(passphrase, &envelope.salt, params);
    let plaintext = Zeroizing::new(key.open(&envelope.iv, &envelope.content)?);
    String::from_utf8(plaintext.to_vec()).map_err(|_| GistError::DecryptionFailed)
}

/// [`encrypt_with`] at the default work factor.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<EncryptedEnvelope> {
    encrypt_with(plaintext, passphrase, &KdfParams::default())
}

/// [`decrypt_with`] at the default work factor.
pub fn decrypt(envelope: &EncryptedEnvelope, passphrase: &str) -> Result<String> {
    decrypt_with(envelope, passphrase, &KdfParams::default())
}

/// Async front-end that keeps PBKDF2 off the calling task.
///
/// Holds no key material, so one instance can serve any number of
/// concurrent calls. Dropping a returned future does not stop the blocking
/// work; its result is discarded.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymmetricCipher {
    params: KdfParams,
}

impl SymmetricCipher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    pub async fn encrypt(&self, plaintext: &str, passphrase: &str) -> Result<EncryptedEnvelope> {
        let params = self.params;
        let plaintext = Zeroizing::new(plaintext.to_owned());
        let passphrase = Zeroizing::new(passphrase.to_owned());
        tokio::task::spawn_blocking(move || encrypt_with(&plaintext, &passphrase, &params))
            .await
            .map_err(|e| GistError::Encryption(format!("encryption task failed: {e}")))?
    }

    pub async fn decrypt(&self, envelope: &EncryptedEnvelope, passphrase: &str) -> Result<String> {
        let params = self.params;
        let envelope = envelope.clone();
        let passphrase = Zeroizing::new(passphrase.to_owned());
        tokio::task::spawn_blocking(move || decrypt_with(&envelope, &passphrase, &params))
            .await
            .map_err(|_| GistError::DecryptionFailed)?
    }

    /// Decrypt straight from the three base64 wire fields; malformed input is
    /// folded into [`GistError::DecryptionFailed`] like any other failure.
    pub async fn decrypt_base64(&self, content: &str, salt: &str, iv: &str, passphrase: &str) -> Result<String> {
        let envelope = EncryptedEnvelope::from_base64(content, salt, iv)
            .map_err(|_| GistError::DecryptionFailed)?;
        self.decrypt(&envelope, passphrase).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let envelope = encrypt("hello", "pw").unwrap();
        assert_eq!(decrypt(&envelope, "pw").unwrap(), "hello");
    }

    #[test]
    fn test_empty_plaintext() {
        let envelope = encrypt("", "pw").unwrap();
        assert_eq!(envelope.content().len(), TAG_LEN);
        assert_eq!(decrypt(&envelope, "pw").unwrap(), "");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let envelope = encrypt("hello", "pw").unwrap();
        let err = decrypt(&envelope, "PW").unwrap_err();
        assert!(matches!(err, GistError::DecryptionFailed));
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let a = encrypt("same text", "same pass").unwrap();
        let b = encrypt("same text", "same pass").unwrap();
        assert_ne!(a.salt(), b.salt());
        assert_ne!(a.iv(), b.iv());
        assert_ne!(a.content(), b.content());
    }

    #[test]
    fn test_corrupted_base64_ciphertext_fails() {
        let envelope = encrypt("hello", "pw").unwrap();
        let mut content = envelope.content_base64();
        // Swap the first character for another alphabet character so the
        // text still decodes, but to different bytes.
        let replacement = if content.starts_with('A') { "B" } else { "A" };
        content.replace_range(0..1, replacement);

        let tampered =
            EncryptedEnvelope::from_base64(&content, &envelope.salt_base64(), &envelope.iv_base64())
                .unwrap();
        let err = decrypt(&tampered, "pw").unwrap_err();
        assert!(matches!(err, GistError::DecryptionFailed));
    }

    #[test]
    fn test_tampered_salt_and_iv_fail() {
        let envelope = encrypt("hello", "pw").unwrap();

        let mut salt = *envelope.salt();
        salt[0] ^= 0x01;
        let bad_salt = EncryptedEnvelope::new(envelope.content().to_vec(), salt, *envelope.iv()).unwrap();
        assert!(matches!(decrypt(&bad_salt, "pw"), Err(GistError::DecryptionFailed)));

        let mut iv = *envelope.iv();
        iv[11] ^= 0x80;
        let bad_iv = EncryptedEnvelope::new(envelope.content().to_vec(), *envelope.salt(), iv).unwrap();
        assert!(matches!(decrypt(&bad_iv, "pw"), Err(GistError::DecryptionFailed)));
    }

    #[test]
    fn test_envelope_boundary_validation() {
        let salt = bytes_to_base64(&[0u8; SALT_LEN]);
        let iv = bytes_to_base64(&[0u8; IV_LEN]);
        let content = bytes_to_base64(&[0u8; TAG_LEN]);

        assert!(EncryptedEnvelope::from_base64(&content, &salt, &iv).is_ok());
        assert!(matches!(
            EncryptedEnvelope::from_base64("not base64!", &salt, &iv),
            Err(GistError::Decode(_))
        ));
        assert!(matches!(
            EncryptedEnvelope::from_base64(&content, &bytes_to_base64(&[0u8; 8]), &iv),
            Err(GistError::Validation(_))
        ));
        assert!(matches!(
            EncryptedEnvelope::from_base64(&bytes_to_base64(&[0u8; 4]), &salt, &iv),
            Err(GistError::Validation(_))
        ));

        let missing_iv = format!(r#"{{"content":"{content}","salt":"{salt}"}}"#);
        assert!(EncryptedEnvelope::from_json(&missing_iv).is_err());
    }

    #[test]
    fn test_wire_format() {
        let envelope = encrypt("wire", "pw").unwrap();
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["content"], envelope.content_base64());
        assert_eq!(value["salt"], envelope.salt_base64());
        assert_eq!(value["iv"], envelope.iv_base64());

        let parsed = EncryptedEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_weak_params_rejected() {
        assert!(KdfParams::new(99_999).is_err());
        assert_eq!(KdfParams::new(150_000).unwrap().iterations(), 150_000);
    }

    #[test]
    fn test_iteration_count_is_part_of_the_key() {
        let stronger = KdfParams::new(PBKDF2_ITERATIONS + 1).unwrap();
        let envelope = encrypt_with("hello", "pw", &stronger).unwrap();
        assert!(matches!(decrypt(&envelope, "pw"), Err(GistError::DecryptionFailed)));
        assert_eq!(decrypt_with(&envelope, "pw", &stronger).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_async_service() {
        let cipher = SymmetricCipher::default();
        let envelope = cipher.encrypt("async hello", "pw").await.unwrap();
        assert_eq!(cipher.decrypt(&envelope, "pw").await.unwrap(), "async hello");

        let err = cipher
            .decrypt_base64("%%%", &envelope.salt_base64(), &envelope.iv_base64(), "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, GistError::DecryptionFailed));
    }

    #[tokio::test]
    async fn test_concurrent_encryptions_are_independent() {
        let cipher = SymmetricCipher::default();
        let (a, b) = tokio::join!(cipher.encrypt("first", "k1"), cipher.encrypt("second", "k2"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(cipher.decrypt(&a, "k1").await.unwrap(), "first");
        assert_eq!(cipher.decrypt(&b, "k2").await.unwrap(), "second");
        assert!(cipher.decrypt(&a, "k2").await.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_round_trip(plaintext in ".{0,64}", passphrase in ".{1,24}") {
            let envelope = encrypt(&plaintext, &passphrase).unwrap();
            prop_assert_eq!(decrypt(&envelope, &passphrase).unwrap(), plaintext);
        }

        #[test]
        fn prop_other_passphrase_fails(plaintext in ".{0,64}", k1 in "[a-z]{1,12}", k2 in "[A-Z]{1,12}") {
            let envelope = encrypt(&plaintext, &k1).unwrap();
            prop_assert!(matches!(decrypt(&envelope, &k2), Err(GistError::DecryptionFailed)));
        }
    }
}
