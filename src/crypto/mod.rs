pub mod cipher;
pub mod codec;
pub mod identity;

pub use cipher::{EncryptedEnvelope, KdfParams, SymmetricCipher};
pub use identity::{ExportedKey, IdentityKeyPair, Signature, SigningKeyPair};
