use thiserror::Error;

/// Every failure the core can surface to a caller.
///
/// Primitive errors from the crypto crates are mapped into one of these
/// variants where they occur; none of them escape the crate raw.
#[derive(Error, Debug)]
pub enum GistError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Wrong passphrase, tampered ciphertext and truncated data all end here.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Key import error: {0}")]
    KeyImport(String),

    #[error("Identity {0} is already taken")]
    IdentityTaken(String),

    #[error("Identity {0} not found")]
    IdentityNotFound(String),

    #[error("Private key for {0} not found on this device")]
    KeyNotOnDevice(String),

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Failed to publish profile: {0}")]
    Publish(String),

    #[error("Operation not allowed while session is {0}")]
    InvalidState(&'static str),

    #[error("This device already holds identity {0}")]
    DeviceInUse(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Entropy source unavailable: {0}")]
    Entropy(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<anyhow::Error> for GistError {
    fn from(err: anyhow::Error) -> Self {
        GistError::Storage(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, GistError>;
