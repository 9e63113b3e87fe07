//! # Velum Config
//!
//! Data model for the at-rest encryption configuration.
//!
//! An [`EncryptionConfig`] maps each managed group-resource to an ordered
//! list of [`Provider`]s. The first provider encrypts new writes; later
//! providers are read-only fallbacks kept around until every stored object
//! encrypted under them has been rewritten.
//!
//! The config is published as a single versioned JSON object; the resource
//! version of that object is the only concurrency-control mechanism between
//! writers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::ConfigError;

/// A class of stored objects subject to a uniform encryption policy,
/// e.g. `oauthaccesstokens.oauth.openshift.io`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupResource {
    /// API group (may be empty for the core group).
    pub group: String,
    /// Resource name (plural).
    pub resource: String,
}

impl GroupResource {
    /// Creates a group-resource from its two components.
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Provider modes supported by the config schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// No encryption; payloads are stored in the clear.
    Identity,
    /// AES-256 in CBC mode.
    Aescbc,
    /// AES-256-GCM.
    Aesgcm,
    /// XSalsa20-Poly1305 secretbox.
    Secretbox,
}

impl Mode {
    /// Key size in bytes for this mode. Identity carries no key.
    pub fn key_size(self) -> usize {
        match self {
            Mode::Identity => 0,
            Mode::Aescbc | Mode::Aesgcm | Mode::Secretbox => 32,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Identity => write!(f, "identity"),
            Mode::Aescbc => write!(f, "aescbc"),
            Mode::Aesgcm => write!(f, "aesgcm"),
            Mode::Secretbox => write!(f, "secretbox"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Mode::Identity),
            "aescbc" => Ok(Mode::Aescbc),
            "aesgcm" => Ok(Mode::Aesgcm),
            "secretbox" => Ok(Mode::Secretbox),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Desired encryption type supplied by the operator configuration.
///
/// `Unset` means "no encryption config should exist at all", which is only
/// reachable once every group-resource has been migrated back to identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DesiredMode {
    /// No config object should exist.
    Unset,
    /// Encryption explicitly off.
    Identity,
    /// AES-256-CBC.
    Aescbc,
    /// AES-256-GCM.
    Aesgcm,
}

impl DesiredMode {
    /// The provider mode new writes should use under this desired type.
    pub fn write_mode(self) -> Mode {
        match self {
            DesiredMode::Unset | DesiredMode::Identity => Mode::Identity,
            DesiredMode::Aescbc => Mode::Aescbc,
            DesiredMode::Aesgcm => Mode::Aesgcm,
        }
    }
}

impl Default for DesiredMode {
    fn default() -> Self {
        DesiredMode::Unset
    }
}

impl FromStr for DesiredMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "unset" => Ok(DesiredMode::Unset),
            "identity" => Ok(DesiredMode::Identity),
            "aescbc" => Ok(DesiredMode::Aescbc),
            "aesgcm" => Ok(DesiredMode::Aesgcm),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for DesiredMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredMode::Unset => write!(f, "unset"),
            DesiredMode::Identity => write!(f, "identity"),
            DesiredMode::Aescbc => write!(f, "aescbc"),
            DesiredMode::Aesgcm => write!(f, "aesgcm"),
        }
    }
}

/// Identifier of one generation of key material.
///
/// Generations increase strictly per group-resource; the random suffix keeps
/// ids from colliding when a generation number is ever reused across configs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId {
    /// Monotonically increasing generation number.
    pub generation: u64,
    /// Random hex suffix assigned at generation time.
    pub suffix: String,
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.suffix)
    }
}

impl FromStr for KeyId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, suffix) = s
            .split_once('-')
            .ok_or_else(|| ConfigError::InvalidKeyId(s.to_string()))?;
        let generation = generation
            .parse()
            .map_err(|_| ConfigError::InvalidKeyId(s.to_string()))?;
        if suffix.is_empty() {
            return Err(ConfigError::InvalidKeyId(s.to_string()));
        }
        Ok(Self {
            generation,
            suffix: suffix.to_string(),
        })
    }
}

/// Key material reference as stored inside the config object.
///
/// The secret is base64; once written a key is immutable, only its migration
/// markers change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Key identifier.
    pub id: KeyId,
    /// Base64-encoded raw key bytes.
    pub secret: String,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// True once every object of the owning group-resource has been
    /// rewritten under this key.
    #[serde(default)]
    pub migrated: bool,
    /// When migration completed (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<u64>,
}

/// A (mode, key) pair capable of encrypting and decrypting payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Provider {
    /// Plaintext passthrough.
    Identity,
    /// AES-256-CBC with the given key.
    Aescbc {
        /// Key material for this provider.
        key: EncryptionKey,
    },
    /// AES-256-GCM with the given key.
    Aesgcm {
        /// Key material for this provider.
        key: EncryptionKey,
    },
    /// Secretbox with the given key.
    Secretbox {
        /// Key material for this provider.
        key: EncryptionKey,
    },
}

impl Provider {
    /// The mode tag of this provider.
    pub fn mode(&self) -> Mode {
        match self {
            Provider::Identity => Mode::Identity,
            Provider::Aescbc { .. } => Mode::Aescbc,
            Provider::Aesgcm { .. } => Mode::Aesgcm,
            Provider::Secretbox { .. } => Mode::Secretbox,
        }
    }

    /// Key material, if this provider carries any.
    pub fn key(&self) -> Option<&EncryptionKey> {
        match self {
            Provider::Identity => None,
            Provider::Aescbc { key } | Provider::Aesgcm { key } | Provider::Secretbox { key } => {
                Some(key)
            }
        }
    }

    /// Mutable key material, if this provider carries any.
    pub fn key_mut(&mut self) -> Option<&mut EncryptionKey> {
        match self {
            Provider::Identity => None,
            Provider::Aescbc { key } | Provider::Aesgcm { key } | Provider::Secretbox { key } => {
                Some(key)
            }
        }
    }

    /// The externally observable "encrypted-by" marker the store attaches to
    /// records written under this provider, e.g. `identity` or `aescbc:3-ab12cd`.
    pub fn tag(&self) -> String {
        match self.key() {
            None => self.mode().to_string(),
            Some(key) => format!("{}:{}", self.mode(), key.id),
        }
    }
}

/// Ordered provider list for one group-resource. The first entry is the
/// write provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupResourceConfig {
    /// The group-resource this entry governs.
    pub resource: GroupResource,
    /// Ordered providers; never empty.
    pub providers: Vec<Provider>,
}

impl GroupResourceConfig {
    /// The provider used to encrypt new writes.
    pub fn write_provider(&self) -> Option<&Provider> {
        self.providers.first()
    }

    /// Highest key generation present in this entry, 0 when keyless.
    pub fn highest_generation(&self) -> u64 {
        self.providers
            .iter()
            .filter_map(|p| p.key())
            .map(|k| k.id.generation)
            .max()
            .unwrap_or(0)
    }
}

/// The encryption configuration object, stored at a well-known location and
/// versioned by the store's optimistic-concurrency resource version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Last rotation trigger this config was planned against. A change in
    /// the externally supplied reason string forces a new key generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_reason: Option<String>,
    /// Per group-resource provider lists.
    pub resources: Vec<GroupResourceConfig>,
}

impl EncryptionConfig {
    /// Canonical config for a fresh set of targets: identity-only entries.
    pub fn identity(targets: &[GroupResource]) -> Self {
        Self {
            rotation_reason: None,
            resources: targets
                .iter()
                .map(|gr| GroupResourceConfig {
                    resource: gr.clone(),
                    providers: vec![Provider::Identity],
                })
                .collect(),
        }
    }

    /// The entry for a group-resource, if present.
    pub fn entry(&self, gr: &GroupResource) -> Option<&GroupResourceConfig> {
        self.resources.iter().find(|e| &e.resource == gr)
    }

    /// Mutable entry for a group-resource, if present.
    pub fn entry_mut(&mut self, gr: &GroupResource) -> Option<&mut GroupResourceConfig> {
        self.resources.iter_mut().find(|e| &e.resource == gr)
    }

    /// The write provider for a group-resource. Absent entries behave as
    /// identity (nothing was ever encrypted).
    pub fn write_provider(&self, gr: &GroupResource) -> Provider {
        self.entry(gr)
            .and_then(|e| e.write_provider().cloned())
            .unwrap_or(Provider::Identity)
    }

    /// Looks up a provider anywhere in the config by its encrypted-by tag.
    pub fn provider_by_tag(&self, tag: &str) -> Option<&Provider> {
        self.resources
            .iter()
            .flat_map(|e| e.providers.iter())
            .find(|p| p.tag() == tag)
    }

    /// Next key generation for a group-resource: one past the highest
    /// generation this config lists for it.
    ///
    /// The counter lives in the config object, so deleting the config (a
    /// full unset cycle) restarts generations at 1. The random [`KeyId`]
    /// suffix keeps identifiers from earlier config lifetimes distinct, so
    /// an encrypted-by tag never aliases a retired key.
    pub fn next_generation(&self, gr: &GroupResource) -> u64 {
        self.entry(gr).map(|e| e.highest_generation()).unwrap_or(0) + 1
    }

    /// True when every entry is identity-only, i.e. no key material remains.
    pub fn is_identity_only(&self) -> bool {
        self.resources
            .iter()
            .all(|e| e.providers.iter().all(|p| matches!(p, Provider::Identity)))
    }

    /// Structural validation: non-empty provider lists and no duplicate key
    /// ids across the whole config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.resources {
            if entry.providers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{} has no providers",
                    entry.resource
                )));
            }
            for key in entry.providers.iter().filter_map(|p| p.key()) {
                if !seen.insert((entry.resource.clone(), key.id.clone())) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate key id {} for {}",
                        key.id, entry.resource
                    )));
                }
            }
        }
        Ok(())
    }
}
