//! # Velum Crypto
//!
//! Cryptographic primitives for the Velum encryption reconciler:
//! - Key material generation for config providers
//! - AES-256-GCM sealing used by the simulated resource store
//! - Secure random generation with explicit entropy-failure errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod keymat;
pub mod random;

pub use error::CryptoError;
pub use keymat::{KeyMaterial, KeyMint, OsKeyMint};
