//! Manifest validation.
//!
//! Range checks run after parsing, both at startup and on every reload.
//! Errors name the offending field by its manifest path.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Manifest;

/// Validate value ranges across the manifest.
///
/// # Errors
///
/// [`ConfigError::Invalid`] naming the first offending field.
pub fn validate(manifest: &Manifest) -> ConfigResult<()> {
    let limits = &manifest.execution_limits.loop_detection;
    if limits.repeat_threshold < 2 {
        return Err(invalid(
            "executionLimits.loopDetection.repeatThreshold",
            "must be at least 2",
        ));
    }
    if limits.window_size == 0 {
        return Err(invalid("executionLimits.loopDetection.windowSize", "must be positive"));
    }
    if limits.max_cycle_length == 0 {
        return Err(invalid(
            "executionLimits.loopDetection.maxCycleLength",
            "must be positive",
        ));
    }

    let gateway = &manifest.gateway;
    if gateway.session_timeout_ms == 0 {
        return Err(invalid("gateway.sessionTimeoutMs", "must be positive"));
    }
    if gateway.suspend_timeout_ms == 0 {
        return Err(invalid("gateway.suspendTimeoutMs", "must be positive"));
    }
    if gateway.ping_interval_ms == 0 {
        return Err(invalid("gateway.pingIntervalMs", "must be positive"));
    }
    if gateway.ping_interval_ms >= gateway.dead_threshold_ms {
        return Err(invalid(
            "gateway.pingIntervalMs",
            "must be smaller than deadThresholdMs",
        ));
    }
    if gateway.lanes.steer == 0 || gateway.lanes.collect == 0 || gateway.lanes.followup == 0 {
        return Err(invalid("gateway.lanes", "lane capacities must be at least 1"));
    }

    let pairing = &manifest.pairing;
    if pairing.enabled {
        if !(4..=12).contains(&pairing.code_length) {
            return Err(invalid("pairing.codeLength", "must be between 4 and 12"));
        }
        if pairing.max_attempts == 0 {
            return Err(invalid("pairing.maxAttempts", "must be at least 1"));
        }
        if pairing.expiry_ms == 0 {
            return Err(invalid("pairing.expiryMs", "must be positive"));
        }
    }

    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}
