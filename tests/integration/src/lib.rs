//! End-to-end tests for the encryption reconciler.
//!
//! Each test stands up an in-memory store, seeds it with token objects, and
//! drives a [`Reconciler`] through desired-state changes, asserting on the
//! published config and the raw stored records. A "token of life" created
//! before any encryption change must stay readable through every transition.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, Once};

use anyhow::{bail, Result};
use async_trait::async_trait;

use velum_config::GroupResource;
use velum_reconciler::{default_targets, ConvergenceStatus, DesiredState, Reconciler};
use velum_store::{
    MemoryStore, ObjectPage, RawRecord, ResourceStore, StoreError, StoredObject,
};

/// Name of the object seeded before any encryption change.
pub const TOKEN_OF_LIFE: &str = "token-of-life";
/// Its payload, asserted byte-for-byte after every transition.
pub const TOKEN_OF_LIFE_PAYLOAD: &[u8] = b"still-alive";

static INIT: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The first default target group-resource.
pub fn access_tokens() -> GroupResource {
    default_targets().remove(0)
}

/// Seeds the token of life plus `extra` numbered tokens.
pub async fn seed_tokens(
    store: &dyn ResourceStore,
    gr: &GroupResource,
    extra: usize,
) -> Result<()> {
    store.create(gr, TOKEN_OF_LIFE, TOKEN_OF_LIFE_PAYLOAD).await?;
    for i in 0..extra {
        store
            .create(gr, &format!("token-{:02}", i), format!("payload-{}", i).as_bytes())
            .await?;
    }
    Ok(())
}

/// Asserts the token of life decrypts to its original payload.
pub async fn assert_token_of_life(store: &dyn ResourceStore, gr: &GroupResource) -> Result<()> {
    let object = store.get(gr, TOKEN_OF_LIFE).await?;
    if object.payload != TOKEN_OF_LIFE_PAYLOAD {
        bail!("token of life payload changed: {:?}", object.payload);
    }
    Ok(())
}

/// Runs reconciliation passes until convergence, bounded by `max_passes`.
pub async fn converge(
    reconciler: &mut Reconciler,
    desired: &DesiredState,
    max_passes: usize,
) -> Result<ConvergenceStatus> {
    let mut last = None;
    for _ in 0..max_passes {
        let status = reconciler.reconcile(desired).await?;
        if status.is_converged() {
            return Ok(status);
        }
        last = Some(status);
    }
    bail!("did not converge within {} passes: {:?}", max_passes, last)
}

/// Store wrapper with fault injection: jammed objects reject every update,
/// config writes can be made to fail as unavailable, and the config version
/// can be bumped behind a writer's back to force a stale compare-and-swap.
pub struct FlakyStore {
    inner: MemoryStore,
    jammed: Mutex<HashSet<String>>,
    config_write_failures: AtomicU32,
    config_writes_allowed: Mutex<Option<u32>>,
    republish_next_write: AtomicBool,
}

impl FlakyStore {
    /// Wraps a fresh in-memory store.
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            jammed: Mutex::new(HashSet::new()),
            config_write_failures: AtomicU32::new(0),
            config_writes_allowed: Mutex::new(None),
            republish_next_write: AtomicBool::new(false),
        }
    }

    /// Makes every update of `name` fail until unjammed.
    pub fn jam(&self, name: &str) {
        self.jammed.lock().unwrap().insert(name.to_string());
    }

    /// Lets updates of `name` through again.
    pub fn unjam(&self, name: &str) {
        self.jammed.lock().unwrap().remove(name);
    }

    /// Makes the next `n` config writes fail as unavailable.
    pub fn fail_config_writes(&self, n: u32) {
        self.config_write_failures.store(n, Ordering::SeqCst);
    }

    /// Lets the next `n` config writes through, then fails every later one
    /// as unavailable.
    pub fn allow_config_writes(&self, n: u32) {
        *self.config_writes_allowed.lock().unwrap() = Some(n);
    }

    /// After the next successful config write, immediately republishes the
    /// same document so the version the writer observed is already stale.
    pub fn republish_next_write(&self) {
        self.republish_next_write.store(true, Ordering::SeqCst);
    }
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for FlakyStore {
    async fn create(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
    ) -> Result<StoredObject, StoreError> {
        self.inner.create(gr, name, payload).await
    }

    async fn get(&self, gr: &GroupResource, name: &str) -> Result<StoredObject, StoreError> {
        self.inner.get(gr, name).await
    }

    async fn update(
        &self,
        gr: &GroupResource,
        name: &str,
        payload: &[u8],
        expected_version: u64,
    ) -> Result<StoredObject, StoreError> {
        if self.jammed.lock().unwrap().contains(name) {
            return Err(StoreError::Unavailable(format!("{} is jammed", name)));
        }
        self.inner.update(gr, name, payload, expected_version).await
    }

    async fn list(
        &self,
        gr: &GroupResource,
        limit: usize,
        continue_token: Option<&str>,
    ) -> Result<ObjectPage, StoreError> {
        self.inner.list(gr, limit, continue_token).await
    }

    async fn raw_get(&self, gr: &GroupResource, name: &str) -> Result<RawRecord, StoreError> {
        self.inner.raw_get(gr, name).await
    }

    async fn read_config_raw(&self) -> Result<Option<(Vec<u8>, u64)>, StoreError> {
        self.inner.read_config_raw().await
    }

    async fn write_config_raw(
        &self,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let remaining = self.config_write_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.config_write_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("config write dropped".to_string()));
        }
        {
            let mut allowed = self.config_writes_allowed.lock().unwrap();
            match *allowed {
                Some(0) => {
                    return Err(StoreError::Unavailable(
                        "config write dropped".to_string(),
                    ));
                }
                Some(n) => *allowed = Some(n - 1),
                None => {}
            }
        }

        let version = self.inner.write_config_raw(data, expected_version).await?;
        if self.republish_next_write.swap(false, Ordering::SeqCst) {
            // The caller gets the pre-bump version back, so its next
            // compare-and-swap is guaranteed stale.
            self.inner.write_config_raw(data, Some(version)).await?;
        }
        Ok(version)
    }

    async fn delete_config_raw(&self, expected_version: u64) -> Result<(), StoreError> {
        self.inner.delete_config_raw(expected_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch};

    use velum_config::{DesiredMode, Mode, Provider};
    use velum_reconciler::{MigrationDriver, ReconcileState, RetryPolicy};
    use velum_store::ConfigStore;

    fn desired(mode: DesiredMode) -> DesiredState {
        DesiredState {
            mode,
            ..Default::default()
        }
    }

    fn with_reason(mode: DesiredMode, reason: &str) -> DesiredState {
        DesiredState {
            mode,
            rotation_reason: reason.to_string(),
            ..Default::default()
        }
    }

    async fn read_config(store: Arc<dyn ResourceStore>) -> (velum_config::EncryptionConfig, Option<u64>) {
        ConfigStore::new(store).read().await.unwrap()
    }

    #[tokio::test]
    async fn test_type_identity_publishes_explicit_identity_config() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 2).await.unwrap();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        let status = converge(&mut reconciler, &desired(DesiredMode::Identity), 3)
            .await
            .unwrap();
        assert_eq!(status.state, ReconcileState::Converged);

        let (config, version) = read_config(store.clone()).await;
        assert!(version.is_some());
        for target in &default_targets() {
            assert_eq!(
                config.entry(target).unwrap().providers,
                vec![Provider::Identity]
            );
        }

        let raw = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
        assert_eq!(raw.provider, "identity");
        assert_eq!(raw.data, TOKEN_OF_LIFE_PAYLOAD);
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_type_unset_never_creates_a_config() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        converge(&mut reconciler, &desired(DesiredMode::Unset), 3)
            .await
            .unwrap();

        assert!(store.read_config_raw().await.unwrap().is_none());
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_turn_on_and_off() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 3).await.unwrap();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());

        // On: every record sealed by the new write key.
        converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        let (config, _) = read_config(store.clone()).await;
        let write_tag = config.write_provider(&gr).tag();
        assert_eq!(config.write_provider(&gr).mode(), Mode::Aescbc);

        let raw = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
        assert_eq!(raw.provider, write_tag);
        assert_ne!(raw.data, TOKEN_OF_LIFE_PAYLOAD);
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();

        // Off: back to plaintext, config reduced to identity.
        converge(&mut reconciler, &desired(DesiredMode::Identity), 3)
            .await
            .unwrap();
        let (config, version) = read_config(store.clone()).await;
        assert!(version.is_some());
        assert!(config.is_identity_only());

        let raw = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
        assert_eq!(raw.provider, "identity");
        assert_eq!(raw.data, TOKEN_OF_LIFE_PAYLOAD);

        // Unset: the config object itself goes away.
        converge(&mut reconciler, &desired(DesiredMode::Unset), 3)
            .await
            .unwrap();
        assert!(store.read_config_raw().await.unwrap().is_none());
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_retires_the_previous_generation() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 2).await.unwrap();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        converge(&mut reconciler, &with_reason(DesiredMode::Aescbc, "initial"), 3)
            .await
            .unwrap();
        let (config, _) = read_config(store.clone()).await;
        let gen1_tag = config.write_provider(&gr).tag();
        assert_eq!(config.write_provider(&gr).key().unwrap().id.generation, 1);

        converge(&mut reconciler, &with_reason(DesiredMode::Aescbc, "compromised"), 3)
            .await
            .unwrap();
        let (config, _) = read_config(store.clone()).await;
        let write = config.write_provider(&gr);
        assert_eq!(write.key().unwrap().id.generation, 2);
        assert!(write.key().unwrap().migrated);

        // The retired generation is gone from the config and nothing
        // references it anymore.
        assert!(config.provider_by_tag(&gen1_tag).is_none());
        let raw = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
        assert_eq!(raw.provider, write.tag());
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_restarted_reconciler_resumes_without_rewrites() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 2).await.unwrap();

        let mut first = Reconciler::new(store.clone(), default_targets());
        converge(&mut first, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        drop(first);

        // Same desired state, fresh process: progress is recomputed from
        // storage, nothing is rewritten and no new key is minted.
        let mut second = Reconciler::new(store.clone(), default_targets());
        let status = converge(&mut second, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();

        let state = &status.resources[&gr];
        assert_eq!(state.rewritten, 0);
        let (config, _) = read_config(store.clone()).await;
        assert_eq!(config.write_provider(&gr).key().unwrap().id.generation, 1);
    }

    #[tokio::test]
    async fn test_stuck_object_degrades_without_halting_siblings() {
        init_tracing();
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn ResourceStore> = flaky.clone();
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 2).await.unwrap();
        flaky.jam("token-00");

        let fast_retry = RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        let mut reconciler = Reconciler::new(store.clone(), default_targets())
            .with_driver(MigrationDriver::new(store.clone()).with_retry(fast_retry));

        let status = reconciler.reconcile(&desired(DesiredMode::Aescbc)).await.unwrap();
        assert!(status.degraded);
        assert_eq!(status.state, ReconcileState::Migrating);
        assert_eq!(status.resources[&gr].stuck, vec!["token-00".to_string()]);

        // Siblings migrated; the stuck object stayed plaintext and readable.
        let (config, _) = read_config(store.clone()).await;
        let write_tag = config.write_provider(&gr).tag();
        let sealed = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
        assert_eq!(sealed.provider, write_tag);
        let jammed = store.raw_get(&gr, "token-00").await.unwrap();
        assert_eq!(jammed.provider, "identity");
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();

        // Identity stays in the provider list while degraded, so nothing
        // became unreadable.
        assert!(config
            .entry(&gr)
            .unwrap()
            .providers
            .contains(&Provider::Identity));

        flaky.unjam("token-00");
        let status = converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        assert!(status.is_converged());
        let unjammed = store.raw_get(&gr, "token-00").await.unwrap();
        assert_eq!(unjammed.provider, write_tag);
    }

    #[tokio::test]
    async fn test_unavailable_config_write_is_retried() {
        init_tracing();
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn ResourceStore> = flaky.clone();
        seed_tokens(store.as_ref(), &access_tokens(), 1).await.unwrap();
        flaky.fail_config_writes(1);

        let mut reconciler = Reconciler::new(store.clone(), default_targets()).with_retry(
            RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(5)),
        );
        let status = converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        assert!(status.is_converged());
    }

    #[tokio::test]
    async fn test_config_bumped_between_publish_and_prune_still_converges() {
        init_tracing();
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn ResourceStore> = flaky.clone();
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        // A concurrent writer bumps the config version right after the
        // reconciler publishes, so the version it observed is stale by the
        // time it prunes.
        flaky.republish_next_write();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        let status = reconciler.reconcile(&desired(DesiredMode::Aescbc)).await.unwrap();

        assert!(status.is_converged());
        let (config, _) = read_config(store.clone()).await;
        assert!(config.write_provider(&gr).key().unwrap().migrated);
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_prune_reports_pruning_degraded() {
        init_tracing();
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn ResourceStore> = flaky.clone();
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        // The publish goes through; every config write after it fails.
        flaky.allow_config_writes(1);

        let mut reconciler = Reconciler::new(store.clone(), default_targets()).with_retry(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        );
        let status = reconciler.reconcile(&desired(DesiredMode::Aescbc)).await.unwrap();

        assert!(status.degraded);
        assert_eq!(status.state, ReconcileState::Pruning);

        // The write key is not marked migrated and identity is still listed,
        // so nothing became unreadable.
        let (config, _) = read_config(store.clone()).await;
        assert!(!config.write_provider(&gr).key().unwrap().migrated);
        assert!(config
            .entry(&gr)
            .unwrap()
            .providers
            .contains(&Provider::Identity));
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();

        // Once writes go through again, the next pass finishes the prune.
        flaky.allow_config_writes(u32::MAX);
        let status = converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        assert!(status.is_converged());
        let (config, _) = read_config(store.clone()).await;
        assert!(config.write_provider(&gr).key().unwrap().migrated);
    }

    #[tokio::test]
    async fn test_exhausted_publish_budget_reports_degraded() {
        init_tracing();
        let flaky = Arc::new(FlakyStore::new());
        let store: Arc<dyn ResourceStore> = flaky.clone();
        flaky.fail_config_writes(100);

        let mut reconciler = Reconciler::new(store.clone(), default_targets()).with_retry(
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        );
        let status = reconciler.reconcile(&desired(DesiredMode::Aescbc)).await.unwrap();

        assert!(status.degraded);
        assert_eq!(status.state, ReconcileState::Publishing);
        assert!(store.read_config_raw().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_generations_restart_after_full_unset_cycle() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        let (config, _) = read_config(store.clone()).await;
        let first_tag = config.write_provider(&gr).tag();

        converge(&mut reconciler, &desired(DesiredMode::Unset), 3)
            .await
            .unwrap();
        assert!(store.read_config_raw().await.unwrap().is_none());

        // Re-enabling starts a new config lifetime: generation 1 again, but
        // the random suffix keeps the tag distinct from the retired key's.
        converge(&mut reconciler, &desired(DesiredMode::Aescbc), 3)
            .await
            .unwrap();
        let (config, _) = read_config(store.clone()).await;
        let write = config.write_provider(&gr);
        assert_eq!(write.key().unwrap().id.generation, 1);
        assert_ne!(write.tag(), first_tag);
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_override_document_forces_encryption_on() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        let forced = DesiredState {
            mode: DesiredMode::Unset,
            rotation_reason: String::new(),
            unsupported_overrides: Some(serde_json::json!({
                "encryption": {"type": "aesgcm", "reason": "forced-on"}
            })),
        };
        let mut reconciler = Reconciler::new(store.clone(), default_targets());
        converge(&mut reconciler, &forced, 3).await.unwrap();

        let (config, _) = read_config(store.clone()).await;
        assert_eq!(config.write_provider(&gr).mode(), Mode::Aesgcm);
        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_reacts_to_desired_changes() {
        init_tracing();
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let gr = access_tokens();
        seed_tokens(store.as_ref(), &gr, 1).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), default_targets());
        let (desired_tx, desired_rx) = watch::channel(desired(DesiredMode::Aescbc));
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = tokio::spawn(reconciler.run(
            desired_rx,
            event_rx,
            Duration::from_millis(20),
        ));

        // Wait for the loop to seal the seeded token.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let raw = store.raw_get(&gr, TOKEN_OF_LIFE).await.unwrap();
            if raw.provider != "identity" {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("run loop never sealed the token");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Flip the desired state back to unset and wait for the config to
        // disappear.
        desired_tx.send(desired(DesiredMode::Unset)).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if store.read_config_raw().await.unwrap().is_none() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("run loop never removed the config");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_token_of_life(store.as_ref(), &gr).await.unwrap();
        drop(desired_tx);
        drop(_event_tx);
        handle.await.unwrap();
    }
}
