//! The reconciliation loop.
//!
//! Level-triggered: each pass reads the world, diffs it against the desired
//! state, and moves it one step closer. A pass runs phases in order —
//! publish the next config, migrate storage under its write providers, then
//! prune providers nothing references anymore. Any phase can leave the pass
//! degraded; the next wake re-reads and retries, so a crash between phases
//! loses nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use velum_config::{DesiredMode, GroupResource, Provider};
use velum_crypto::{KeyMint, OsKeyMint};
use velum_store::{ConfigStore, ResourceStore, StoreError};

use crate::error::ReconcileError;
use crate::migrate::MigrationDriver;
use crate::overrides;
use crate::plan::{plan, PlannedAction};
use crate::retry::RetryPolicy;
use crate::status::{ConvergenceStatus, MigrationState, ReconcileState};

/// The operator-facing desired state of encryption.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    /// Desired encryption type.
    pub mode: DesiredMode,
    /// Rotation trigger; changing it forces a new key generation.
    pub rotation_reason: String,
    /// Free-form override document merged over the fields above.
    pub unsupported_overrides: Option<serde_json::Value>,
}

impl DesiredState {
    /// The desired state after folding in the override document.
    pub fn effective(&self) -> Result<overrides::EffectiveSpec, ReconcileError> {
        overrides::effective_spec(
            self.mode,
            &self.rotation_reason,
            self.unsupported_overrides.as_ref(),
        )
    }
}

/// External change notification that wakes the loop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The encryption config object changed underneath us.
    ConfigChanged,
    /// Stored objects changed in a way that may need re-migration.
    StorageChanged,
}

enum PruneOutcome {
    /// Fallback providers were dropped, or the config object was removed.
    Pruned,
    /// Nothing to drop.
    Unchanged,
    /// The retry budget ran out without a clean compare-and-swap.
    Contended,
}

/// Drives the encryption state of a set of group-resources toward the
/// desired type.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    config: ConfigStore,
    driver: Arc<MigrationDriver>,
    targets: Vec<GroupResource>,
    retry: RetryPolicy,
    pass_budget: Option<Duration>,
    mint: Box<dyn KeyMint + Send + Sync>,
}

impl Reconciler {
    /// Creates a reconciler over the given store and target group-resources.
    pub fn new(store: Arc<dyn ResourceStore>, targets: Vec<GroupResource>) -> Self {
        Self {
            config: ConfigStore::new(store.clone()),
            driver: Arc::new(MigrationDriver::new(store.clone())),
            store,
            targets,
            retry: RetryPolicy::default(),
            pass_budget: None,
            mint: Box::new(OsKeyMint),
        }
    }

    /// Overrides the config-write retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the migration driver.
    pub fn with_driver(mut self, driver: MigrationDriver) -> Self {
        self.driver = Arc::new(driver);
        self
    }

    /// Caps the wall-clock time one pass may spend rewriting objects.
    /// Rewrites in flight when the budget runs out still finish; the rest
    /// wait for the next wake.
    pub fn with_pass_budget(mut self, budget: Duration) -> Self {
        self.pass_budget = Some(budget);
        self
    }

    /// Substitutes the key material source, for deterministic tests.
    pub fn with_mint(mut self, mint: Box<dyn KeyMint + Send + Sync>) -> Self {
        self.mint = mint;
        self
    }

    /// Runs one reconciliation pass, bounded by the configured pass budget.
    pub async fn reconcile(
        &mut self,
        desired: &DesiredState,
    ) -> Result<ConvergenceStatus, ReconcileError> {
        let deadline = self.pass_budget.map(|budget| Instant::now() + budget);
        self.reconcile_until(desired, deadline).await
    }

    /// Runs one reconciliation pass with an explicit migration deadline.
    ///
    /// Past the deadline no new object rewrites start; the pass reports
    /// Degraded and the next one resumes where this one stopped.
    pub async fn reconcile_until(
        &mut self,
        desired: &DesiredState,
        deadline: Option<Instant>,
    ) -> Result<ConvergenceStatus, ReconcileError> {
        let spec = desired.effective()?;

        // Phase 1: bring the published config up to date, under a bounded
        // compare-and-swap loop. Conflicts re-read and replan.
        let mut config = None;
        let mut published = false;
        for attempt in 1..=self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (current, version) = self.config.read().await?;
            match plan(
                &current,
                spec.mode,
                &spec.rotation_reason,
                &self.targets,
                self.mint.as_mut(),
            )? {
                PlannedAction::Unchanged => {
                    config = Some(current);
                    break;
                }
                PlannedAction::Delete => {
                    let Some(version) = version else {
                        // Nothing published and nothing desired.
                        return Ok(ConvergenceStatus::idle(BTreeMap::new()));
                    };
                    match self.config.delete(version).await {
                        Ok(()) => {
                            info!("encryption config removed, all targets identity-only");
                            return Ok(ConvergenceStatus::converged(BTreeMap::new()));
                        }
                        Err(e) if e.is_retriable() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                PlannedAction::Publish(next) => {
                    match self.config.write(&next, version).await {
                        Ok(new_version) => {
                            info!(version = new_version, "published encryption config");
                            config = Some(next);
                            published = true;
                            break;
                        }
                        Err(e) if e.is_retriable() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        let Some(config) = config else {
            return Ok(ConvergenceStatus::degraded(
                ReconcileState::Publishing,
                ReconcileError::Convergence {
                    attempts: self.retry.max_attempts,
                }
                .to_string(),
                BTreeMap::new(),
            ));
        };

        // Phase 2: migrate every target's storage under its write provider.
        let mut tasks: JoinSet<(GroupResource, Result<MigrationState, StoreError>)> =
            JoinSet::new();
        for gr in &self.targets {
            let target = config.write_provider(gr).tag();
            let driver = Arc::clone(&self.driver);
            let gr = gr.clone();
            tasks.spawn(async move {
                let result = driver.migrate(&gr, &target, deadline).await;
                (gr, result)
            });
        }
        let mut resources = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (gr, result) =
                joined.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            resources.insert(gr, result?);
        }

        let stuck: Vec<String> = resources
            .iter()
            .flat_map(|(gr, state)| state.stuck.iter().map(move |n| format!("{}/{}", gr, n)))
            .collect();
        if !stuck.is_empty() {
            return Ok(ConvergenceStatus::degraded(
                ReconcileState::Migrating,
                format!("objects stuck: {}", stuck.join(", ")),
                resources,
            ));
        }
        if resources.values().any(|s| !s.is_complete()) {
            // Deadline ran out before every object was rewritten.
            return Ok(ConvergenceStatus::degraded(
                ReconcileState::Migrating,
                "pass budget exhausted before migration completed".to_string(),
                resources,
            ));
        }

        // Phase 3: prune read fallbacks nothing references anymore, then
        // drop the config entirely if the desired type is unset.
        let pruned = match self.prune(spec.mode, &resources).await? {
            PruneOutcome::Contended => {
                return Ok(ConvergenceStatus::degraded(
                    ReconcileState::Pruning,
                    ReconcileError::Convergence {
                        attempts: self.retry.max_attempts,
                    }
                    .to_string(),
                    resources,
                ));
            }
            PruneOutcome::Pruned => true,
            PruneOutcome::Unchanged => false,
        };

        let rewrote = resources.values().any(|s| s.rewritten > 0);
        if published || pruned || rewrote {
            Ok(ConvergenceStatus::converged(resources))
        } else {
            Ok(ConvergenceStatus::idle(resources))
        }
    }

    /// Shrinks each migrated entry to its write provider (marked migrated)
    /// plus identity. Only entries whose write tag matches the migration this
    /// pass completed are touched; a concurrent writer moving the write
    /// provider leaves its entry alone until the next pass.
    ///
    /// Runs its own bounded compare-and-swap loop: every attempt re-reads the
    /// config, so a version bumped by another writer conflicts once and is
    /// recomputed from fresh state rather than surfacing as an error.
    async fn prune(
        &self,
        desired: DesiredMode,
        migrated: &BTreeMap<GroupResource, MigrationState>,
    ) -> Result<PruneOutcome, ReconcileError> {
        for attempt in 1..=self.retry.max_attempts {
            let delay = self.retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (current, version) = self.config.read().await?;
            let mut next = current.clone();
            for gr in &self.targets {
                let Some(state) = migrated.get(gr) else { continue };
                let Some(entry) = next.entry_mut(gr) else { continue };
                let Some(write) = entry.providers.first().cloned() else { continue };
                if write.tag() != state.target {
                    continue;
                }

                let kept: Vec<Provider> = match write {
                    Provider::Identity => vec![Provider::Identity],
                    mut keyed => {
                        if let Some(key) = keyed.key_mut() {
                            if !key.migrated {
                                key.migrated = true;
                                key.migrated_at = Some(unix_now());
                            }
                        }
                        vec![keyed, Provider::Identity]
                    }
                };

                let dropped: Vec<String> = entry
                    .providers
                    .iter()
                    .map(|p| p.tag())
                    .filter(|tag| !kept.iter().any(|k| &k.tag() == tag))
                    .collect();
                if !dropped.is_empty() && self.any_record_uses(gr, &dropped).await? {
                    // A record reappeared under a provider we were about to
                    // drop; keep it readable and let the next pass re-migrate.
                    warn!(resource = %gr, "skipping prune, dropped provider still referenced");
                    continue;
                }

                entry.providers = kept;
            }

            if next != current {
                let new_version = match self.config.write(&next, version).await {
                    Ok(v) => v,
                    Err(e) if e.is_retriable() => continue,
                    Err(e) => return Err(e.into()),
                };
                debug!(version = new_version, "pruned encryption config");
                if desired == DesiredMode::Unset && next.is_identity_only() {
                    match self.config.delete(new_version).await {
                        Ok(()) => {
                            info!("encryption config removed, all targets identity-only");
                        }
                        Err(e) if e.is_retriable() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                return Ok(PruneOutcome::Pruned);
            }

            if desired == DesiredMode::Unset && next.is_identity_only() {
                if let Some(version) = version {
                    match self.config.delete(version).await {
                        Ok(()) => {
                            info!("encryption config removed, all targets identity-only");
                            return Ok(PruneOutcome::Pruned);
                        }
                        Err(e) if e.is_retriable() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            return Ok(PruneOutcome::Unchanged);
        }
        Ok(PruneOutcome::Contended)
    }

    async fn any_record_uses(
        &self,
        gr: &GroupResource,
        tags: &[String],
    ) -> Result<bool, StoreError> {
        let mut continue_token: Option<String> = None;
        loop {
            let page = self.store.list(gr, 500, continue_token.as_deref()).await?;
            if page
                .items
                .iter()
                .any(|item| tags.iter().any(|t| t == &item.provider))
            {
                return Ok(true);
            }
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => return Ok(false),
            }
        }
    }

    /// Runs the loop until both the desired-state watch and the event
    /// channel close.
    ///
    /// Wakes on a desired-state change, an external change event (coalesced
    /// when they pile up), or the poll interval, whichever comes first. A
    /// failed pass is logged and retried on the next wake, never fatal.
    pub async fn run(
        mut self,
        mut desired: watch::Receiver<DesiredState>,
        mut events: mpsc::Receiver<ChangeEvent>,
        poll: Duration,
    ) {
        loop {
            let snapshot = desired.borrow_and_update().clone();
            match self.reconcile(&snapshot).await {
                Ok(status) if status.degraded => {
                    warn!(
                        state = %status.state,
                        reason = status.reason.as_deref().unwrap_or(""),
                        "reconciliation degraded"
                    );
                }
                Ok(status) => {
                    debug!(state = %status.state, "reconciliation pass complete");
                }
                Err(e) => {
                    warn!(error = %e, "reconciliation pass failed");
                }
            }

            tokio::select! {
                changed = desired.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(_) => {
                            // Coalesce a burst of notifications into one pass.
                            while events.try_recv().is_ok() {}
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
