use getrandom::getrandom;
use rand::{CryptoRng, RngCore};

use crate::errors::{GistError, Result};

/// Operating-system CSPRNG.
///
/// Thin wrapper over `getrandom` that reports entropy failures as
/// [`GistError::Entropy`] instead of panicking. Also usable as an
/// `RngCore + CryptoRng` source for key generation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecureRng;

impl SecureRng {
    pub fn new() -> Self {
        SecureRng
    }

    /// Fill `dest` from the OS entropy source
    pub fn try_fill(&mut self, dest: &mut [u8]) -> Result<()> {
        getrandom(dest).map_err(|e| GistError::Entropy(e.to_string()))
    }
}

impl RngCore for SecureRng {
    fn next_u32(&mut self) -> u32 {
        rand::rngs::OsRng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        rand::rngs::OsRng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        rand::rngs::OsRng.try_fill_bytes(dest)
    }
}

impl CryptoRng for SecureRng {}

/// Convenience functions for common random operations
pub mod random {
    use super::*;

    /// Generate random bytes
    pub fn bytes(len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        SecureRng.try_fill(&mut buffer)?;
        Ok(buffer)
    }

    /// Generate a random array of specified size
    pub fn array<const N: usize>() -> Result<[u8; N]> {
        let mut array = [0u8; N];
        SecureRng.try_fill(&mut array)?;
        Ok(array)
    }
}
