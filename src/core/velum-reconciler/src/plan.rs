//! Migration planning.
//!
//! Pure diff between the published config and the desired encryption type.
//! Randomness is delegated through [`KeyMint`], so identical inputs plus a
//! fixed mint produce an identical plan.

use tracing::debug;

use velum_config::{DesiredMode, EncryptionConfig, GroupResource, Mode, Provider};
use velum_crypto::{CryptoError, KeyMint};

/// What the reconciler should do to the config object.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    /// The published config already matches the desired state.
    Unchanged,
    /// Publish this config (new write providers prepended, old providers
    /// retained as read fallbacks).
    Publish(EncryptionConfig),
    /// Remove the config object entirely. Only emitted when every target is
    /// identity-only, so no stored object can depend on a key being dropped.
    Delete,
}

/// Computes the next config for the desired mode and rotation trigger.
///
/// Rules, in order:
/// 1. A target needs a new key generation when the desired write mode
///    differs from its current write provider's mode, or when the rotation
///    trigger differs from the last one recorded in the config.
/// 2. A fresh provider is prepended as the write provider; existing keyed
///    providers stay as read fallbacks, identity always last.
/// 3. Desired `Unset` deletes the config only once every target is
///    identity-only; otherwise it publishes identity as the write provider
///    while keeping fallbacks, as a safe intermediate state.
pub fn plan(
    current: &EncryptionConfig,
    desired: DesiredMode,
    rotation_reason: &str,
    targets: &[GroupResource],
    mint: &mut dyn KeyMint,
) -> Result<PlannedAction, CryptoError> {
    let write_mode = desired.write_mode();

    if desired == DesiredMode::Unset && current.is_identity_only() {
        return Ok(PlannedAction::Delete);
    }

    let reason_changed =
        current.rotation_reason.as_deref().unwrap_or("") != rotation_reason;

    let mut next = EncryptionConfig {
        rotation_reason: current.rotation_reason.clone(),
        resources: Vec::with_capacity(targets.len()),
    };
    let mut minted = false;

    for gr in targets {
        let existing = current
            .entry(gr)
            .map(|e| e.providers.clone())
            .unwrap_or_else(|| vec![Provider::Identity]);
        let current_write_mode = current.write_provider(gr).mode();

        let providers = match write_mode {
            Mode::Identity => {
                if current_write_mode == Mode::Identity {
                    existing
                } else {
                    // Demote the keyed write provider to a read fallback.
                    let mut providers = vec![Provider::Identity];
                    providers.extend(
                        existing
                            .into_iter()
                            .filter(|p| !matches!(p, Provider::Identity)),
                    );
                    providers
                }
            }
            mode => {
                if current_write_mode == mode && !reason_changed {
                    existing
                } else {
                    let generation = current.next_generation(gr);
                    let fresh = mint.mint(mode, generation)?.into_provider(mode)?;
                    debug!(resource = %gr, key = %fresh.tag(), "planned new write provider");
                    minted = true;

                    let mut providers = vec![fresh];
                    providers.extend(
                        existing
                            .into_iter()
                            .filter(|p| !matches!(p, Provider::Identity)),
                    );
                    providers.push(Provider::Identity);
                    providers
                }
            }
        };

        next.resources.push(velum_config::GroupResourceConfig {
            resource: gr.clone(),
            providers,
        });
    }

    // Entries for group-resources outside our target set are carried over
    // untouched.
    for entry in &current.resources {
        if !targets.contains(&entry.resource) {
            next.resources.push(entry.clone());
        }
    }

    if minted {
        next.rotation_reason = if rotation_reason.is_empty() {
            None
        } else {
            Some(rotation_reason.to_string())
        };
    }

    if next == *current {
        Ok(PlannedAction::Unchanged)
    } else {
        Ok(PlannedAction::Publish(next))
    }
}
