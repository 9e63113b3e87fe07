//! Cryptographically secure random generation.
//!
//! Uses the operating system's CSPRNG for all random number generation.
//! Entropy failures surface as [`CryptoError::GenerationFailed`] rather than
//! panicking, since the reconciler must report them as a status condition.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Generates cryptographically secure random key bytes of the given size.
///
/// The buffer is wrapped in `Zeroizing` so it is cleared from memory when
/// dropped.
pub fn generate_secret(len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::GenerationFailed(e.to_string()))?;
    Ok(bytes)
}

/// Generates a random nonce for AES-GCM.
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE], CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| CryptoError::GenerationFailed(e.to_string()))?;
    Ok(nonce)
}

/// Generates a short random hex suffix for key identifiers.
pub fn generate_suffix(byte_len: usize) -> Result<String, CryptoError> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::GenerationFailed(e.to_string()))?;
    Ok(hex_encode(&bytes))
}

/// Encodes bytes as lowercase hexadecimal.
fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
        hex.push(HEX_CHARS[(byte & 0x0F) as usize] as char);
    }
    hex
}
