//! # Velum Reconciler
//!
//! Level-triggered control loop that drives the at-rest encryption state of
//! a set of group-resources toward an operator-supplied desired type:
//! - [`plan`] — pure diff from published config to the next one
//! - [`MigrationDriver`] — rewrites stored objects under the write provider
//! - [`Reconciler`] — publish, migrate, prune, report convergence
//!
//! Migration progress is derived by listing storage, never persisted, so a
//! restarted reconciler resumes by recomputing it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod migrate;
pub mod overrides;
pub mod plan;
pub mod reconcile;
pub mod retry;
pub mod status;

pub use error::ReconcileError;
pub use migrate::MigrationDriver;
pub use plan::{plan, PlannedAction};
pub use reconcile::{ChangeEvent, DesiredState, Reconciler};
pub use retry::RetryPolicy;
pub use status::{ConvergenceStatus, MigrationState, ReconcileState};

use velum_config::GroupResource;

/// The group-resources reconciled by default: the OAuth token resources,
/// which hold the only payloads sensitive enough to warrant at-rest
/// encryption out of the box.
pub fn default_targets() -> Vec<GroupResource> {
    vec![
        GroupResource::new("oauth.openshift.io", "oauthaccesstokens"),
        GroupResource::new("oauth.openshift.io", "oauthauthorizetokens"),
    ]
}
