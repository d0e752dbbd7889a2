//! Manifest schema.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ConfigError, ConfigResult};
use crate::validate;

/// The root manifest document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Agent identity, per deployment and per channel type.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Default model.
    #[serde(default)]
    pub model: Option<ModelEntry>,
    /// Ordered alternatives tried after the default model.
    #[serde(default)]
    pub fallback_chain: Vec<ModelEntry>,
    /// Turn execution limits.
    #[serde(default)]
    pub execution_limits: LimitsSection,
    /// Pairing flow settings.
    #[serde(default)]
    pub pairing: PairingSection,
    /// Gateway timers and lane capacities.
    #[serde(default)]
    pub gateway: GatewaySection,
}

impl Manifest {
    /// Parse a manifest from YAML or JSON text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed input, [`ConfigError::Invalid`]
    /// when a value is out of range.
    pub fn from_str(text: &str) -> ConfigResult<Self> {
        let manifest: Self = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        validate::validate(&manifest)?;
        Ok(manifest)
    }

    /// Load and validate a manifest from disk.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, plus the
    /// [`Manifest::from_str`] error cases.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let manifest: Self = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        validate::validate(&manifest)?;
        Ok(manifest)
    }
}

/// Identity section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    /// Deployment-wide identity.
    #[serde(default)]
    pub default: IdentityProfile,
    /// Per-channel-type overrides, keyed by channel type.
    #[serde(default)]
    pub channels: HashMap<String, IdentityProfile>,
}

/// One identity profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityProfile {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Avatar URL or reference.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Short bio.
    #[serde(default)]
    pub bio: Option<String>,
    /// Text prepended to the system prompt.
    #[serde(default)]
    pub system_prompt_prefix: Option<String>,
}

/// A provider/model pair as written in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    /// Provider id.
    pub provider: String,
    /// Model name.
    pub model: String,
}

/// Execution-limits section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsSection {
    /// Maximum turns per session.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Maximum wall clock per session, in milliseconds.
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    /// Loop detection settings.
    #[serde(default)]
    pub loop_detection: LoopDetectionSection,
}

/// Action when the loop detector fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedAction {
    /// Log and continue.
    Warn,
    /// Stop the session.
    #[default]
    Stop,
    /// Stop the session, flagged as an error.
    Error,
}

/// Loop-detection subsection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopDetectionSection {
    /// Whether detection is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Turns retained in the sliding window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Repetitions required before a detection fires.
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,
    /// Longest tool-call cycle considered.
    #[serde(default = "default_max_cycle_length")]
    pub max_cycle_length: usize,
    /// Action on detection.
    #[serde(default)]
    pub on_detected: DetectedAction,
}

impl Default for LoopDetectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: default_window_size(),
            repeat_threshold: default_repeat_threshold(),
            max_cycle_length: default_max_cycle_length(),
            on_detected: DetectedAction::Stop,
        }
    }
}

/// Pairing section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSection {
    /// Whether pairing is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Digits in a pairing code.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    /// Code lifetime in milliseconds.
    #[serde(default = "default_expiry_ms")]
    pub expiry_ms: u64,
    /// Attempts allowed per code.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Outstanding codes allowed at once.
    #[serde(default = "default_max_pending_codes")]
    pub max_pending_codes: usize,
    /// Channel types pairing is offered on.
    #[serde(default)]
    pub channels: Vec<String>,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            code_length: default_code_length(),
            expiry_ms: default_expiry_ms(),
            max_attempts: default_max_attempts(),
            max_pending_codes: default_max_pending_codes(),
            channels: Vec::new(),
        }
    }
}

/// Gateway section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySection {
    /// Idle timer: connected → idle after this many milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Suspend timer: idle → suspended after this many milliseconds.
    #[serde(default = "default_suspend_timeout_ms")]
    pub suspend_timeout_ms: u64,
    /// Health monitor tick interval.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Inactivity after which a node is declared dead.
    #[serde(default = "default_dead_threshold_ms")]
    pub dead_threshold_ms: u64,
    /// Per-lane buffer capacities.
    #[serde(default)]
    pub lanes: LaneCapacities,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            suspend_timeout_ms: default_suspend_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            dead_threshold_ms: default_dead_threshold_ms(),
            lanes: LaneCapacities::default(),
        }
    }
}

/// Per-lane buffer capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneCapacities {
    /// Steer lane capacity.
    #[serde(default = "default_steer_capacity")]
    pub steer: usize,
    /// Collect lane capacity.
    #[serde(default = "default_collect_capacity")]
    pub collect: usize,
    /// Followup lane capacity.
    #[serde(default = "default_followup_capacity")]
    pub followup: usize,
}

impl Default for LaneCapacities {
    fn default() -> Self {
        Self {
            steer: default_steer_capacity(),
            collect: default_collect_capacity(),
            followup: default_followup_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_window_size() -> usize {
    5
}

fn default_repeat_threshold() -> usize {
    3
}

fn default_max_cycle_length() -> usize {
    3
}

fn default_code_length() -> usize {
    6
}

fn default_expiry_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_pending_codes() -> usize {
    32
}

fn default_session_timeout_ms() -> u64 {
    300_000
}

fn default_suspend_timeout_ms() -> u64 {
    600_000
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_dead_threshold_ms() -> u64 {
    90_000
}

fn default_steer_capacity() -> usize {
    8
}

fn default_collect_capacity() -> usize {
    64
}

fn default_followup_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let manifest = Manifest::from_str("{}").unwrap();
        assert_eq!(manifest.gateway.session_timeout_ms, 300_000);
        assert_eq!(manifest.gateway.lanes.steer, 8);
        assert!(manifest.execution_limits.loop_detection.enabled);
        assert_eq!(manifest.execution_limits.loop_detection.repeat_threshold, 3);
        assert!(!manifest.pairing.enabled);
    }

    #[test]
    fn yaml_sections_parse_with_camel_case_keys() {
        let manifest = Manifest::from_str(
            r"
identity:
  default:
    name: Meridian
    systemPromptPrefix: 'You are helpful.'
model:
  provider: acme
  model: m-large
fallbackChain:
  - provider: acme
    model: m-small
executionLimits:
  maxIterations: 20
  loopDetection:
    repeatThreshold: 4
gateway:
  sessionTimeoutMs: 60000
  lanes:
    steer: 4
",
        )
        .unwrap();

        assert_eq!(manifest.identity.default.name.as_deref(), Some("Meridian"));
        assert_eq!(
            manifest.identity.default.system_prompt_prefix.as_deref(),
            Some("You are helpful.")
        );
        assert_eq!(manifest.model.as_ref().unwrap().model, "m-large");
        assert_eq!(manifest.fallback_chain.len(), 1);
        assert_eq!(manifest.execution_limits.max_iterations, Some(20));
        assert_eq!(manifest.execution_limits.loop_detection.repeat_threshold, 4);
        assert_eq!(manifest.gateway.session_timeout_ms, 60_000);
        assert_eq!(manifest.gateway.lanes.steer, 4);
        // Unset lanes keep their defaults.
        assert_eq!(manifest.gateway.lanes.collect, 64);
    }

    #[test]
    fn json_manifests_parse_too() {
        let manifest =
            Manifest::from_str("{\"gateway\": {\"pingIntervalMs\": 5000, \"deadThresholdMs\": 15000}}")
                .unwrap();
        assert_eq!(manifest.gateway.ping_interval_ms, 5_000);
    }

    #[test]
    fn malformed_text_is_a_parse_error() {
        let err = Manifest::from_str("gateway: [not a map").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
