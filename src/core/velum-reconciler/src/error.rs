//! Reconciler error types.

use thiserror::Error;

/// Errors that can occur during a reconciliation pass.
///
/// None of these crash the process: the control loop reports them as a
/// Degraded condition and re-attempts on the next wake.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The config write retry budget was exhausted without a clean
    /// compare-and-swap.
    #[error("config write did not converge after {attempts} attempts")]
    Convergence {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Key generation or payload sealing failed.
    #[error(transparent)]
    Crypto(#[from] velum_crypto::CryptoError),

    /// The store rejected an operation.
    #[error(transparent)]
    Store(#[from] velum_store::StoreError),

    /// The unsupported-config override produced an unusable desired state.
    #[error("invalid config override: {0}")]
    Overrides(String),
}
