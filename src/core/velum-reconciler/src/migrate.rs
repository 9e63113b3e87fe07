//! Storage migration.
//!
//! Rewrites every stored object of a group-resource so its record is sealed
//! with the current write provider. A rewrite is a read-then-update of the
//! same payload; the store re-seals on update. Objects already carrying the
//! target provider are skipped, which makes a re-run cheap and idempotent.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use velum_config::GroupResource;
use velum_store::{ResourceStore, StoreError};

use crate::retry::RetryPolicy;
use crate::status::MigrationState;

/// Drives storage migration for one group-resource at a time.
pub struct MigrationDriver {
    store: Arc<dyn ResourceStore>,
    retry: RetryPolicy,
    concurrency: usize,
    page_size: usize,
}

enum Rewrite {
    Done,
    /// Deleted out from under us; no longer needs migration.
    Gone,
    Stuck,
}

impl MigrationDriver {
    /// Creates a driver with default retry, concurrency and page bounds.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            concurrency: 8,
            page_size: 100,
        }
    }

    /// Overrides the per-object retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the rewrite concurrency bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Overrides the list page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewrites all objects of `gr` not yet sealed by `target_tag`.
    ///
    /// One stuck object does not halt its siblings; it lands in
    /// [`MigrationState::stuck`] and the rest keep going. When a `deadline`
    /// is given, no new rewrites start past it, but in-flight ones finish.
    pub async fn migrate(
        &self,
        gr: &GroupResource,
        target_tag: &str,
        deadline: Option<Instant>,
    ) -> Result<MigrationState, StoreError> {
        let mut state = MigrationState {
            target: target_tag.to_string(),
            ..Default::default()
        };

        let mut pending: Vec<String> = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let page = self
                .store
                .list(gr, self.page_size, continue_token.as_deref())
                .await?;
            for item in page.items {
                state.total += 1;
                if item.provider == target_tag {
                    state.migrated += 1;
                } else {
                    pending.push(item.name);
                }
            }
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        debug!(
            resource = %gr,
            target = target_tag,
            total = state.total,
            pending = pending.len(),
            "starting storage migration"
        );

        let mut tasks: JoinSet<(String, Rewrite)> = JoinSet::new();
        let mut names = pending.into_iter();
        let mut expired = false;

        loop {
            while tasks.len() < self.concurrency && !expired {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        expired = true;
                        break;
                    }
                }
                let Some(name) = names.next() else { break };
                let store = Arc::clone(&self.store);
                let gr = gr.clone();
                let retry = self.retry;
                tasks.spawn(async move {
                    let outcome = rewrite_object(store.as_ref(), &gr, &name, retry).await;
                    (name, outcome)
                });
            }

            let Some(joined) = tasks.join_next().await else { break };
            // Rewrite tasks never panic; a join error means the runtime is
            // shutting down, which we surface as unavailability.
            let (name, outcome) = joined.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            match outcome {
                Rewrite::Done => {
                    state.migrated += 1;
                    state.rewritten += 1;
                }
                Rewrite::Gone => state.total -= 1,
                Rewrite::Stuck => {
                    warn!(resource = %gr, object = %name, "object stuck, rewrite budget exhausted");
                    state.stuck.push(name);
                }
            }
        }

        state.stuck.sort();
        if state.is_complete() {
            state.completed_at = Some(unix_now());
        }
        Ok(state)
    }
}

async fn rewrite_object(
    store: &dyn ResourceStore,
    gr: &GroupResource,
    name: &str,
    retry: RetryPolicy,
) -> Rewrite {
    for attempt in 1..=retry.max_attempts {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let object = match store.get(gr, name).await {
            Ok(object) => object,
            Err(StoreError::NotFound(_)) => return Rewrite::Gone,
            Err(e) if e.is_retriable() => continue,
            Err(e) => {
                warn!(resource = %gr, object = name, error = %e, "rewrite read failed");
                return Rewrite::Stuck;
            }
        };

        match store
            .update(gr, name, &object.payload, object.meta.resource_version)
            .await
        {
            Ok(_) => return Rewrite::Done,
            Err(StoreError::NotFound(_)) => return Rewrite::Gone,
            Err(e) if e.is_retriable() => continue,
            Err(e) => {
                warn!(resource = %gr, object = name, error = %e, "rewrite failed");
                return Rewrite::Stuck;
            }
        }
    }
    Rewrite::Stuck
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
