//! Execution limits middleware.
//!
//! Gates each turn after it executes: iteration cap first, then wall
//! clock, then loop detection, then external budget pressure. The first
//! gate that trips produces the turn's terminal [`StopReason`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::context::TurnContext;
use crate::error::PipelineResult;
use crate::loop_detector::{LoopDetection, LoopDetector, LoopDetectorConfig};
use crate::middleware::Middleware;

/// Metadata flag collaborators set when an external budget is exhausted.
pub const BUDGET_EXHAUSTED_KEY: &str = "budget_exhausted";

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopReason {
    /// The turn counter reached `max_iterations`.
    IterationLimit {
        /// Turns executed.
        iterations: u32,
    },
    /// Wall clock since session start exceeded the budget.
    Timeout {
        /// Elapsed milliseconds.
        elapsed_ms: u64,
    },
    /// The loop detector fired.
    LoopDetected {
        /// The detection that fired.
        detection: LoopDetection,
    },
    /// External budget metadata indicated exhaustion.
    BudgetExhausted,
}

/// What to do when the loop detector fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopAction {
    /// Log and keep going.
    Warn,
    /// Stop the session with `loop_detected`.
    #[default]
    Stop,
    /// Stop the session with `loop_detected`, flagged as an error.
    Error,
}

/// Loop-detection section of the limits configuration.
#[derive(Debug, Clone)]
pub struct LoopDetectionConfig {
    /// Whether detection runs at all.
    pub enabled: bool,
    /// Detector tuning.
    pub detector: LoopDetectorConfig,
    /// Action when a loop is detected.
    pub on_detected: LoopAction,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detector: LoopDetectorConfig::default(),
            on_detected: LoopAction::Stop,
        }
    }
}

/// Limits configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLimitsConfig {
    /// Maximum turns per session.
    pub max_iterations: Option<u32>,
    /// Maximum wall clock per session.
    pub max_execution_time: Option<Duration>,
    /// Loop detection settings.
    pub loop_detection: LoopDetectionConfig,
}

/// Middleware enforcing [`ExecutionLimitsConfig`].
#[derive(Debug)]
pub struct ExecutionLimits {
    config: ExecutionLimitsConfig,
    detector: Option<Mutex<LoopDetector>>,
}

impl ExecutionLimits {
    /// Create the middleware.
    ///
    /// # Errors
    ///
    /// Propagates detector validation errors (e.g. a repeat threshold
    /// below 2).
    pub fn new(config: ExecutionLimitsConfig) -> PipelineResult<Self> {
        let detector = if config.loop_detection.enabled {
            Some(Mutex::new(LoopDetector::new(config.loop_detection.detector.clone())?))
        } else {
            None
        };
        Ok(Self { config, detector })
    }

    fn check_loop(&self, ctx: &TurnContext) -> Option<LoopDetection> {
        let detector = self.detector.as_ref()?;
        let output = match &ctx.output {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        detector
            .lock()
            .ok()
            .and_then(|mut d| d.record_and_check(&output, &ctx.tool_calls))
    }
}

#[async_trait]
impl Middleware for ExecutionLimits {
    fn name(&self) -> &str {
        "execution-limits"
    }

    async fn on_session_start(&self, _ctx: &mut TurnContext) -> PipelineResult<()> {
        if let Some(detector) = &self.detector
            && let Ok(mut d) = detector.lock()
        {
            d.reset();
        }
        Ok(())
    }

    async fn on_after_turn(&self, ctx: &mut TurnContext) -> PipelineResult<Option<StopReason>> {
        // 1. Iteration cap.
        if let Some(max) = self.config.max_iterations
            && ctx.turn_number >= max
        {
            return Ok(Some(StopReason::IterationLimit {
                iterations: ctx.turn_number,
            }));
        }

        // 2. Wall clock.
        if let Some(max) = self.config.max_execution_time {
            let elapsed = ctx.session_started_at.elapsed();
            if elapsed >= max {
                return Ok(Some(StopReason::Timeout {
                    elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                }));
            }
        }

        // 3. Loop detection.
        if let Some(detection) = self.check_loop(ctx) {
            match self.config.loop_detection.on_detected {
                LoopAction::Warn => {
                    warn!(session_id = %ctx.session_id, ?detection, "loop detected, continuing");
                },
                LoopAction::Stop | LoopAction::Error => {
                    return Ok(Some(StopReason::LoopDetected { detection }));
                },
            }
        }

        // 4. External budget pressure.
        if ctx.metadata_flag(BUDGET_EXHAUSTED_KEY) {
            return Ok(Some(StopReason::BudgetExhausted));
        }

        Ok(None)
    }
}
