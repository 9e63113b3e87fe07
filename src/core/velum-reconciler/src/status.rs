//! Reconciler states and the operator-visible convergence status.

use std::collections::BTreeMap;
use std::fmt;

use velum_config::GroupResource;

/// Phase the reconciler reached in its last pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// Nothing to do; desired state matches observed state.
    Idle,
    /// Writing a new provider list to the config object.
    Publishing,
    /// Rewriting stored objects under the new write provider.
    Migrating,
    /// Removing providers no stored object references anymore.
    Pruning,
    /// Config and all objects match the desired policy.
    Converged,
    /// A retry budget was exhausted or an object is stuck; re-attempted on
    /// the next wake.
    Degraded,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Idle => "Idle",
            ReconcileState::Publishing => "Publishing",
            ReconcileState::Migrating => "Migrating",
            ReconcileState::Pruning => "Pruning",
            ReconcileState::Converged => "Converged",
            ReconcileState::Degraded => "Degraded",
        };
        write!(f, "{}", s)
    }
}

/// Per group-resource migration progress. Derived by listing, never
/// persisted: a restarted reconciler recomputes it from scratch.
#[derive(Debug, Clone, Default)]
pub struct MigrationState {
    /// Tag of the provider objects are being rewritten under.
    pub target: String,
    /// Objects listed.
    pub total: u64,
    /// Objects whose records carry the target provider.
    pub migrated: u64,
    /// Objects this run actually rewrote (zero on an idempotent re-run).
    pub rewritten: u64,
    /// Objects that exhausted their per-object retry budget.
    pub stuck: Vec<String>,
    /// When migration completed (Unix seconds), if it did.
    pub completed_at: Option<u64>,
}

impl MigrationState {
    /// True when every listed object carries the target provider.
    pub fn is_complete(&self) -> bool {
        self.stuck.is_empty() && self.migrated == self.total
    }

    /// True when at least one object could not be rewritten.
    pub fn is_degraded(&self) -> bool {
        !self.stuck.is_empty()
    }
}

/// The condition reported after each reconciliation pass.
#[derive(Debug, Clone)]
pub struct ConvergenceStatus {
    /// Terminal phase of the pass.
    pub state: ReconcileState,
    /// Whether the pass ended degraded.
    pub degraded: bool,
    /// Human-readable reason when degraded.
    pub reason: Option<String>,
    /// Migration progress per group-resource.
    pub resources: BTreeMap<GroupResource, MigrationState>,
}

impl ConvergenceStatus {
    pub(crate) fn converged(resources: BTreeMap<GroupResource, MigrationState>) -> Self {
        Self {
            state: ReconcileState::Converged,
            degraded: false,
            reason: None,
            resources,
        }
    }

    /// A pass that found nothing to change.
    pub(crate) fn idle(resources: BTreeMap<GroupResource, MigrationState>) -> Self {
        Self {
            state: ReconcileState::Idle,
            degraded: false,
            reason: None,
            resources,
        }
    }

    pub(crate) fn degraded(
        state: ReconcileState,
        reason: impl Into<String>,
        resources: BTreeMap<GroupResource, MigrationState>,
    ) -> Self {
        Self {
            state,
            degraded: true,
            reason: Some(reason.into()),
            resources,
        }
    }

    /// True when the pass reached convergence. An idle pass counts: it
    /// found nothing left to change.
    pub fn is_converged(&self) -> bool {
        matches!(
            self.state,
            ReconcileState::Converged | ReconcileState::Idle
        ) && !self.degraded
    }
}
