//! Unsupported config overrides.
//!
//! Operators can force the desired encryption type and rotation trigger
//! through a free-form JSON override document. The override is merged over
//! the structured desired state; nested maps merge recursively, everything
//! else is last-writer-wins.

use serde_json::Value;

use velum_config::DesiredMode;

use crate::error::ReconcileError;

/// Deep-merges `overlay` into `base`. Objects merge per key; any other value
/// in the overlay replaces the base value outright.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Desired state after applying an override document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveSpec {
    /// Desired write mode.
    pub mode: DesiredMode,
    /// Rotation trigger; a change forces a new key generation.
    pub rotation_reason: String,
}

/// Applies the override document on top of the configured mode and trigger.
///
/// The override reaches the same fields through `encryption.type` and
/// `encryption.reason`; unknown fields are ignored.
pub fn effective_spec(
    mode: DesiredMode,
    rotation_reason: &str,
    overrides: Option<&Value>,
) -> Result<EffectiveSpec, ReconcileError> {
    let Some(overlay) = overrides else {
        return Ok(EffectiveSpec {
            mode,
            rotation_reason: rotation_reason.to_string(),
        });
    };

    if !overlay.is_object() {
        return Err(ReconcileError::Overrides(
            "override document must be a JSON object".to_string(),
        ));
    }

    let mut doc = serde_json::json!({
        "encryption": {
            "type": mode.to_string(),
            "reason": rotation_reason,
        }
    });
    merge(&mut doc, overlay);

    let encryption = doc
        .get("encryption")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            ReconcileError::Overrides("override removed the encryption section".to_string())
        })?;

    let mode_str = encryption
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ReconcileError::Overrides("encryption.type must be a string".to_string())
        })?;
    let mode = mode_str
        .parse::<DesiredMode>()
        .map_err(|e| ReconcileError::Overrides(e.to_string()))?;

    let rotation_reason = encryption
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    Ok(EffectiveSpec {
        mode,
        rotation_reason,
    })
}
