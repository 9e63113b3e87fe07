//! Typed adapter over the raw encryption config object.
//!
//! All mutation of the config goes through this adapter's
//! compare-and-swap write; no other component touches the raw object.

use std::sync::Arc;

use tracing::debug;

use velum_config::EncryptionConfig;

use crate::error::StoreError;
use crate::store::ResourceStore;

/// Reads and writes the encryption config object with optimistic concurrency.
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn ResourceStore>,
}

impl ConfigStore {
    /// Creates an adapter over the given store.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Reads the current config and its resource version.
    ///
    /// A missing config object is not an error: it reads as the canonical
    /// empty configuration with no resource version (every group-resource
    /// behaves as identity).
    pub async fn read(&self) -> Result<(EncryptionConfig, Option<u64>), StoreError> {
        match self.store.read_config_raw().await? {
            None => Ok((EncryptionConfig::default(), None)),
            Some((raw, version)) => {
                let config = serde_json::from_slice(&raw)
                    .map_err(|e| StoreError::Serialization(format!("malformed config: {}", e)))?;
                Ok((config, Some(version)))
            }
        }
    }

    /// Writes the config against the version observed at read time. Fails
    /// with [`StoreError::Conflict`] when another writer raced; the caller
    /// must re-read and recompute before retrying.
    pub async fn write(
        &self,
        config: &EncryptionConfig,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let raw = serde_json::to_vec(config)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let version = self.store.write_config_raw(&raw, expected_version).await?;
        debug!(resource_version = version, "config written");
        Ok(version)
    }

    /// Deletes the config object against the version observed at read time.
    pub async fn delete(&self, expected_version: u64) -> Result<(), StoreError> {
        self.store.delete_config_raw(expected_version).await
    }
}
