//! Resource store trait and the in-memory backend.
//!
//! [`MemoryStore`] stands in for the API server and its etcd storage layer:
//! every write is sealed with the write provider of the last published
//! encryption config, and every record carries the tag of the provider that
//! sealed it. Reads decrypt through whichever configured provider matches
//! that tag, so a record whose provider was pruned from the config becomes
//! unreadable exactly as it would against the real storage layer.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use velum_config::{EncryptionConfig, GroupResource, Provider};
use velum_crypto::{aead, keymat};

use crate::error::StoreError;
use crate::object::{ObjectMeta, ObjectPage, RawRecord, StoredObject};

/// Store seam between the reconciler and the storage layer.
///
/// All writes take the caller's last-observed resource version and fail with
/// [`StoreError::Conflict`] when it is stale; this is the sole
/// concurrency-control mechanism.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Creates a new object, sealed with the current write provider.
    async fn create(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
    ) -> Result<StoredObject, StoreError>;

    /// Reads and decrypts an object.
    async fn get(&self, gr: &GroupResource, name: &str) -> Result<StoredObject, StoreError>;

    /// Rewrites an object, re-sealing it with the current write provider.
    async fn update(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
        expected_version: u64,
    ) -> Result<StoredObject, StoreError>;

    /// Lists objects of a group-resource in name order, paginated.
    async fn list(
        &self,
        gr: &GroupResource,
        limit: usize,
        continue_token: Option<&str>,
    ) -> Result<ObjectPage, StoreError>;

    /// Fetches the raw stored representation of an object.
    async fn raw_get(&self, gr: &GroupResource, name: &str) -> Result<RawRecord, StoreError>;

    /// Reads the raw encryption config object, if it exists.
    async fn read_config_raw(&self) -> Result<Option<(Vec<u8>, u64)>, StoreError>;

    /// Writes the encryption config object. `expected_version` of `None`
    /// creates the object and conflicts if one already exists.
    async fn write_config_raw(
        &self,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Deletes the encryption config object.
    async fn delete_config_raw(&self, expected_version: u64) -> Result<(), StoreError>;
}

/// Well-known key of the encryption config object, used in conflict reports.
pub const CONFIG_OBJECT_KEY: &str = "encryption-config";

struct Record {
    resource_version: u64,
    provider: String,
    data: Vec<u8>,
}

struct ConfigObject {
    raw: Vec<u8>,
    parsed: EncryptionConfig,
    resource_version: u64,
}

#[derive(Default)]
struct Inner {
    rv: u64,
    objects: HashMap<GroupResource, BTreeMap<String, Record>>,
    config: Option<ConfigObject>,
}

impl Inner {
    fn next_rv(&mut self) -> u64 {
        self.rv += 1;
        self.rv
    }
}

/// In-memory resource store with optimistic concurrency and transparent
/// at-rest encryption driven by the published config.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store with no published encryption config.
    pub fn new() -> Self {
        Self::default()
    }

    fn seal(
        config: Option<&EncryptionConfig>,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
    ) -> Result<(String, Vec<u8>), StoreError> {
        let provider = config
            .map(|c| c.write_provider(gr))
            .unwrap_or(Provider::Identity);
        let tag = provider.tag();
        match provider.key() {
            None => Ok((tag, payload.to_vec())),
            Some(key) => {
                let secret = keymat::decode_secret(key)?;
                let aad = format!("{}/{}/{}", tag, gr, name);
                let sealed = aead::seal(&secret, payload, aad.as_bytes())?;
                Ok((tag, sealed))
            }
        }
    }

    fn open(
        config: Option<&EncryptionConfig>,
        gr: &GroupResource,
        name: &str,
        record: &Record,
    ) -> Result<Vec<u8>, StoreError> {
        if record.provider == Provider::Identity.tag() {
            return Ok(record.data.clone());
        }
        let provider = config
            .and_then(|c| c.provider_by_tag(&record.provider))
            .ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "no configured provider can decrypt {}/{} (sealed by {})",
                    gr, name, record.provider
                ))
            })?;
        let key = provider.key().ok_or_else(|| {
            StoreError::Crypto(format!("provider {} has no key", record.provider))
        })?;
        let secret = keymat::decode_secret(key)?;
        let aad = format!("{}/{}/{}", record.provider, gr, name);
        let plaintext = aead::open(&secret, &record.data, aad.as_bytes())?;
        Ok(plaintext.to_vec())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
    ) -> Result<StoredObject, StoreError> {
        let mut inner = self.inner.write().await;
        let (tag, data) = Self::seal(inner.config.as_ref().map(|c| &c.parsed), gr, name, payload)?;

        let objects = inner.objects.entry(gr.clone()).or_default();
        if objects.contains_key(name) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", gr, name)));
        }

        let rv = {
            let rv = inner.next_rv();
            let objects = inner.objects.entry(gr.clone()).or_default();
            objects.insert(
                name.to_string(),
                Record {
                    resource_version: rv,
                    provider: tag.clone(),
                    data,
                },
            );
            rv
        };

        debug!(resource = %gr, name = name, provider = %tag, "object created");
        Ok(StoredObject {
            meta: ObjectMeta {
                name: name.to_string(),
                resource_version: rv,
                provider: tag,
            },
            payload: payload.to_vec(),
        })
    }

    async fn get(&self, gr: &GroupResource, name: &str) -> Result<StoredObject, StoreError> {
        let inner = self.inner.read().await;
        let record = inner
            .objects
            .get(gr)
            .and_then(|m| m.get(name))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gr, name)))?;

        let payload = Self::open(inner.config.as_ref().map(|c| &c.parsed), gr, name, record)?;
        Ok(StoredObject {
            meta: ObjectMeta {
                name: name.to_string(),
                resource_version: record.resource_version,
                provider: record.provider.clone(),
            },
            payload,
        })
    }

    async fn update(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
        expected_version: u64,
    ) -> Result<StoredObject, StoreError> {
        let mut inner = self.inner.write().await;

        let actual = inner
            .objects
            .get(gr)
            .and_then(|m| m.get(name))
            .map(|r| r.resource_version)
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gr, name)))?;
        if actual != expected_version {
            return Err(StoreError::Conflict {
                key: format!("{}/{}", gr, name),
                expected: expected_version,
                actual,
            });
        }

        let (tag, data) = Self::seal(inner.config.as_ref().map(|c| &c.parsed), gr, name, payload)?;
        let rv = inner.next_rv();
        let record = inner
            .objects
            .get_mut(gr)
            .and_then(|m| m.get_mut(name))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gr, name)))?;
        record.resource_version = rv;
        record.provider = tag.clone();
        record.data = data;

        Ok(StoredObject {
            meta: ObjectMeta {
                name: name.to_string(),
                resource_version: rv,
                provider: tag,
            },
            payload: payload.to_vec(),
        })
    }

    async fn list(
        &self,
        gr: &GroupResource,
        limit: usize,
        continue_token: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        let inner = self.inner.read().await;
        let empty = BTreeMap::new();
        let objects = inner.objects.get(gr).unwrap_or(&empty);

        let start = match continue_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        let mut items = Vec::new();
        let mut last = None;
        for (name, record) in objects.range((start, Bound::Unbounded)) {
            if items.len() >= limit {
                break;
            }
            items.push(ObjectMeta {
                name: name.clone(),
                resource_version: record.resource_version,
                provider: record.provider.clone(),
            });
            last = Some(name.clone());
        }

        // A token is only handed out when objects remain past this page.
        let continue_token = match last {
            Some(ref last) if objects.range((Bound::Excluded(last.clone()), Bound::Unbounded)).next().is_some() => {
                Some(last.clone())
            }
            _ => None,
        };

        Ok(ObjectPage {
            items,
            continue_token,
        })
    }

    async fn raw_get(&self, gr: &GroupResource, name: &str) -> Result<RawRecord, StoreError> {
        let inner = self.inner.read().await;
        let record = inner
            .objects
            .get(gr)
            .and_then(|m| m.get(name))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", gr, name)))?;
        Ok(RawRecord {
            provider: record.provider.clone(),
            data: record.data.clone(),
        })
    }

    async fn read_config_raw(&self) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .config
            .as_ref()
            .map(|c| (c.raw.clone(), c.resource_version)))
    }

    async fn write_config_raw(
        &self,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let parsed: EncryptionConfig = serde_json::from_slice(data)
            .map_err(|e| StoreError::Serialization(format!("malformed config: {}", e)))?;
        parsed
            .validate()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut inner = self.inner.write().await;
        match (expected_version, inner.config.as_ref()) {
            (None, Some(existing)) => {
                return Err(StoreError::Conflict {
                    key: CONFIG_OBJECT_KEY.to_string(),
                    expected: 0,
                    actual: existing.resource_version,
                });
            }
            (Some(expected), None) => {
                return Err(StoreError::NotFound(format!(
                    "{} (expected version {})",
                    CONFIG_OBJECT_KEY, expected
                )));
            }
            (Some(expected), Some(existing)) if existing.resource_version != expected => {
                return Err(StoreError::Conflict {
                    key: CONFIG_OBJECT_KEY.to_string(),
                    expected,
                    actual: existing.resource_version,
                });
            }
            _ => {}
        }

        let rv = inner.next_rv();
        inner.config = Some(ConfigObject {
            raw: data.to_vec(),
            parsed,
            resource_version: rv,
        });
        debug!(resource_version = rv, "encryption config published");
        Ok(rv)
    }

    async fn delete_config_raw(&self, expected_version: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.config.as_ref() {
            None => Err(StoreError::NotFound(CONFIG_OBJECT_KEY.to_string())),
            Some(existing) if existing.resource_version != expected_version => {
                Err(StoreError::Conflict {
                    key: CONFIG_OBJECT_KEY.to_string(),
                    expected: expected_version,
                    actual: existing.resource_version,
                })
            }
            Some(_) => {
                inner.config = None;
                debug!("encryption config deleted");
                Ok(())
            }
        }
    }
}
