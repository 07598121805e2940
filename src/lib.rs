//! Client-side cryptographic core for Gist, a passphrase-encrypted chat.
//!
//! Messages are sealed with AES-256-GCM under a PBKDF2-derived key, users
//! hold RSA identity keys whose private halves never leave the device, and
//! [`identity::KeyCustody`] drives registration, login and key backup.

pub mod config;
pub mod crypto;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod secure_message;
pub mod security;

pub use errors::{GistError, Result};
