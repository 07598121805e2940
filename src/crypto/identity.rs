//! RSA identity keys.
//!
//! Two independent keypairs back a user identity:
//!
//! - the **identity key** (RSA-OAEP/SHA-256), published to the directory and
//!   used for direct-to-identity encryption;
//! - the **signing key** (RSA-PSS/SHA-256, random salt), used only to answer
//!   possession challenges.
//!
//! The wrappers below are capability-scoped: an identity key cannot sign and
//! a signing key cannot decrypt. Exports are standard DER containers (SPKI
//! for public halves, PKCS#8 for private halves) in standard base64.

use std::fmt;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::pss::{BlindedSigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::codec::{base64_to_bytes, bytes_to_base64};
use crate::errors::{GistError, Result};
use crate::security::secure_rng::{random, SecureRng};

/// Smallest modulus accepted for generation or import.
pub const MIN_RSA_BITS: usize = 2048;

/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Base64 DER key container (SPKI or PKCS#8).
///
/// Wiped on drop; `Debug` never prints the contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ExportedKey(String);

impl ExportedKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn der(&self) -> Result<Vec<u8>> {
        base64_to_bytes(&self.0).map_err(|e| GistError::KeyImport(e.to_string()))
    }
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportedKey({} chars)", self.0.len())
    }
}

fn check_size(key: &RsaPublicKey) -> Result<()> {
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(GistError::KeyImport(format!(
            "RSA modulus of {bits} bits is below the {MIN_RSA_BITS}-bit minimum"
        )));
    }
    Ok(())
}

fn generate_rsa(bits: usize) -> Result<RsaPrivateKey> {
    if bits < MIN_RSA_BITS {
        return Err(GistError::Validation(format!(
            "RSA keys must be at least {MIN_RSA_BITS} bits"
        )));
    }
    RsaPrivateKey::new(&mut SecureRng, bits).map_err(|e| GistError::KeyGeneration(e.to_string()))
}

fn spki_export(key: &RsaPublicKey) -> Result<ExportedKey> {
    let der = key
        .to_public_key_der()
        .map_err(|e| GistError::Encryption(format!("SPKI encoding failed: {e}")))?;
    Ok(ExportedKey(bytes_to_base64(der.as_bytes())))
}

fn spki_import(exported: &ExportedKey) -> Result<RsaPublicKey> {
    let key = RsaPublicKey::from_public_key_der(&exported.der()?)
        .map_err(|e| GistError::KeyImport(format!("invalid SPKI container: {e}")))?;
    check_size(&key)?;
    Ok(key)
}

fn pkcs8_export(key: &RsaPrivateKey) -> Result<ExportedKey> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| GistError::Encryption(format!("PKCS#8 encoding failed: {e}")))?;
    Ok(ExportedKey(bytes_to_base64(der.as_bytes())))
}

fn pkcs8_import(exported: &ExportedKey) -> Result<RsaPrivateKey> {
    let mut der = exported.der()?;
    let key = RsaPrivateKey::from_pkcs8_der(&der)
        .map_err(|e| GistError::KeyImport(format!("invalid PKCS#8 container: {e}")));
    der.zeroize();
    let key = key?;
    key.validate()
        .map_err(|e| GistError::KeyImport(format!("inconsistent RSA key: {e}")))?;
    check_size(&key.to_public_key())?;
    Ok(key)
}

/// Public half of the identity key (encryption only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPublicKey(RsaPublicKey);

/// Private half of the identity key (decryption only).
#[derive(Clone)]
pub struct IdentityPrivateKey(RsaPrivateKey);

/// RSA-OAEP/SHA-256 identity keypair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    pub public: IdentityPublicKey,
    pub private: IdentityPrivateKey,
}

impl IdentityKeyPair {
    /// Generate a new keypair of `bits` (at least [`MIN_RSA_BITS`]).
    pub fn generate(bits: usize) -> Result<Self> {
        let private = generate_rsa(bits)?;
        let public = private.to_public_key();
        debug!(bits, "generated identity keypair");
        Ok(Self {
            public: IdentityPublicKey(public),
            private: IdentityPrivateKey(private),
        })
    }
}

impl IdentityPublicKey {
    pub fn export(&self) -> Result<ExportedKey> {
        spki_export(&self.0)
    }

    pub fn import(exported: &ExportedKey) -> Result<Self> {
        spki_import(exported).map(Self)
    }

    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// RSA-OAEP encrypt a short payload (at most `bits/8 - 66` bytes).
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .encrypt(&mut SecureRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| GistError::Encryption(e.to_string()))
    }
}

impl IdentityPrivateKey {
    /// Serialize for a user-initiated backup.
    pub fn export(&self) -> Result<ExportedKey> {
        warn!("identity private key exported");
        self.to_pkcs8()
    }

    /// PKCS#8 form for sealing into device storage; not an export.
    pub(crate) fn to_pkcs8(&self) -> Result<ExportedKey> {
        pkcs8_export(&self.0)
    }

    pub fn import(exported: &ExportedKey) -> Result<Self> {
        pkcs8_import(exported).map(Self)
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.0.to_public_key())
    }

    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.0
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|_| GistError::DecryptionFailed)
    }
}

impl fmt::Debug for IdentityPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityPrivateKey(..)")
    }
}

/// Generate an identity keypair.
pub fn generate_key_pair(bits: usize) -> Result<IdentityKeyPair> {
    IdentityKeyPair::generate(bits)
}

pub fn export_public_key(key: &IdentityPublicKey) -> Result<ExportedKey> {
    key.export()
}

pub fn export_private_key(key: &IdentityPrivateKey) -> Result<ExportedKey> {
    key.export()
}

pub fn import_public_key(exported: &ExportedKey) -> Result<IdentityPublicKey> {
    IdentityPublicKey::import(exported)
}

pub fn import_private_key(exported: &ExportedKey) -> Result<IdentityPrivateKey> {
    IdentityPrivateKey::import(exported)
}

/// Direct-to-identity encryption of a short payload.
pub fn seal_to_identity(recipient: &IdentityPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    recipient.seal(plaintext)
}

pub fn open_from_identity(key: &IdentityPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    key.open(ciphertext)
}

/// Public half of the signing key (verify only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey(RsaPublicKey);

/// Private half of the signing key (sign only).
#[derive(Clone)]
pub struct SigningPrivateKey(RsaPrivateKey);

/// RSA-PSS/SHA-256 keypair, kept apart from the identity key.
#[derive(Clone)]
pub struct SigningKeyPair {
    pub public: SigningPublicKey,
    pub private: SigningPrivateKey,
}

/// Detached PSS signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        bytes_to_base64(&self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        base64_to_bytes(encoded).map(Self)
    }
}

impl SigningKeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        let private = generate_rsa(bits)?;
        let public = private.to_public_key();
        debug!(bits, "generated signing keypair");
        Ok(Self {
            public: SigningPublicKey(public),
            private: SigningPrivateKey(private),
        })
    }
}

impl SigningPublicKey {
    pub fn export(&self) -> Result<ExportedKey> {
        spki_export(&self.0)
    }

    pub fn import(exported: &ExportedKey) -> Result<Self> {
        spki_import(exported).map(Self)
    }

    /// `false` for any malformed or non-matching signature.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(sig) = rsa::pss::Signature::try_from(signature.as_bytes()) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(self.0.clone())
            .verify(message, &sig)
            .is_ok()
    }
}

impl SigningPrivateKey {
    pub fn export(&self) -> Result<ExportedKey> {
        warn!("signing private key exported");
        self.to_pkcs8()
    }

    pub(crate) fn to_pkcs8(&self) -> Result<ExportedKey> {
        pkcs8_export(&self.0)
    }

    pub fn import(exported: &ExportedKey) -> Result<Self> {
        pkcs8_import(exported).map(Self)
    }

    pub fn public_key(&self) -> SigningPublicKey {
        SigningPublicKey(self.0.to_public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signer = BlindedSigningKey::<Sha256>::new(self.0.clone());
        let sig = signer
            .try_sign_with_rng(&mut SecureRng, message)
            .map_err(|e| GistError::Encryption(format!("PSS signing failed: {e}")))?;
        Ok(Signature(sig.to_vec()))
    }
}

impl fmt::Debug for SigningPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningPrivateKey(..)")
    }
}

pub fn sign(message: &[u8], key: &SigningPrivateKey) -> Result<Signature> {
    key.sign(message)
}

pub fn verify(message: &[u8], signature: &Signature, key: &SigningPublicKey) -> bool {
    key.verify(message, signature)
}

/// Random nonce a verifier hands to a party claiming an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LEN]);

const CHALLENGE_CONTEXT: &[u8] = b"gist-identity-challenge-v1";

impl Challenge {
    pub fn issue() -> Result<Self> {
        Ok(Self(random::array::<CHALLENGE_LEN>()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64_to_bytes(encoded)?;
        let raw = bytes.try_into().map_err(|_| {
            GistError::Validation(format!("challenge must be {CHALLENGE_LEN} bytes"))
        })?;
        Ok(Self(raw))
    }

    pub fn to_base64(&self) -> String {
        bytes_to_base64(&self.0)
    }

    /// Bytes actually signed: a context label, the handle, then the nonce.
    fn transcript(&self, handle: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHALLENGE_CONTEXT.len() + handle.len() + 1 + CHALLENGE_LEN);
        out.extend_from_slice(CHALLENGE_CONTEXT);
        out.extend_from_slice(handle.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.0);
        out
    }

    pub fn respond(&self, handle: &str, key: &SigningPrivateKey) -> Result<Signature> {
        key.sign(&self.transcript(handle))
    }

    pub fn verify_response(&self, handle: &str, response: &Signature, key: &SigningPublicKey) -> bool {
        key.verify(&self.transcript(handle), response)
    }
}
