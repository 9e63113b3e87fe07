//! Key material generation.
//!
//! Generation is pure with respect to cluster state: the caller persists the
//! result by publishing it into the encryption config. Key material is
//! immutable once generated; newer generations supersede it but never mutate
//! it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use zeroize::Zeroizing;

use velum_config::{EncryptionKey, KeyId, Mode, Provider};

use crate::error::CryptoError;
use crate::random::{generate_secret, generate_suffix};

/// Length of the random key-id suffix in bytes (hex-encoded to twice that).
const SUFFIX_BYTES: usize = 3;

/// Freshly generated symmetric key material for one provider generation.
pub struct KeyMaterial {
    /// Identifier assigned at generation time.
    pub id: KeyId,
    /// Raw secret bytes, zeroized on drop.
    pub secret: Zeroizing<Vec<u8>>,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
}

impl KeyMaterial {
    /// Wraps this material into a config provider of the given mode.
    pub fn into_provider(self, mode: Mode) -> Result<Provider, CryptoError> {
        let key = EncryptionKey {
            id: self.id,
            secret: BASE64.encode(&*self.secret),
            created_at: self.created_at,
            migrated: false,
            migrated_at: None,
        };
        match mode {
            Mode::Identity => Err(CryptoError::InvalidInput(
                "identity carries no key material".to_string(),
            )),
            Mode::Aescbc => Ok(Provider::Aescbc { key }),
            Mode::Aesgcm => Ok(Provider::Aesgcm { key }),
            Mode::Secretbox => Ok(Provider::Secretbox { key }),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Generates key material for the given mode and generation number.
///
/// Fails only when the entropy source fails; that error is fatal for the
/// reconciliation pass and must be surfaced, not retried silently.
pub fn generate(mode: Mode, generation: u64) -> Result<KeyMaterial, CryptoError> {
    let size = mode.key_size();
    if size == 0 {
        return Err(CryptoError::InvalidInput(format!(
            "mode {} carries no key material",
            mode
        )));
    }

    let secret = generate_secret(size)?;
    let suffix = generate_suffix(SUFFIX_BYTES)?;

    Ok(KeyMaterial {
        id: KeyId { generation, suffix },
        secret,
        created_at: now(),
    })
}

/// Source of fresh key material, seam between planning and randomness.
///
/// The planner is deterministic apart from key generation, which it delegates
/// through this trait; tests substitute a fixed mint.
pub trait KeyMint {
    /// Mints key material for one new provider generation.
    fn mint(&mut self, mode: Mode, generation: u64) -> Result<KeyMaterial, CryptoError>;
}

/// The production mint, backed by the OS CSPRNG.
#[derive(Debug, Default)]
pub struct OsKeyMint;

impl KeyMint for OsKeyMint {
    fn mint(&mut self, mode: Mode, generation: u64) -> Result<KeyMaterial, CryptoError> {
        generate(mode, generation)
    }
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Decodes the base64 secret of a config key back into raw bytes.
pub fn decode_secret(key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    BASE64
        .decode(&key.secret)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::InvalidKey(format!("key {} not base64: {}", key.id, e)))
}
