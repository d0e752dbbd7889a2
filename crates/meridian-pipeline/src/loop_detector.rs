//! Detection of repeated outputs and tool-call cycles.
//!
//! The detector keeps a sliding window of the last `window_size` turns,
//! each recorded as an output hash plus the turn's tool-call list. Tool
//! cycles are checked before output repeats, and the shortest cycle length
//! is reported.

use serde::Serialize;
use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{PipelineError, PipelineResult};

/// Detector tuning.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Turns retained in the sliding window.
    pub window_size: usize,
    /// Consecutive repetitions required before a detection fires. Must be
    /// at least 2.
    pub repeat_threshold: usize,
    /// Longest tool-call cycle length considered.
    pub max_cycle_length: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            repeat_threshold: 3,
            max_cycle_length: 3,
        }
    }
}

/// A detected loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopDetection {
    /// The same tool-call pattern repeated at the tail of the history.
    ToolCycle {
        /// The repeating pattern, shortest first.
        cycle_pattern: Vec<String>,
        /// How many back-to-back repetitions were observed.
        repetitions: usize,
        /// The configured window size.
        window_size: usize,
    },
    /// The last turns produced identical output.
    OutputRepeat {
        /// Length of the trailing run of identical outputs.
        repetitions: usize,
        /// The configured window size.
        window_size: usize,
    },
}

#[derive(Debug)]
struct TurnRecord {
    output_hash: u64,
    tool_calls: Vec<String>,
}

/// Sliding-window loop detector.
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    turns: VecDeque<TurnRecord>,
}

impl LoopDetector {
    /// Create a detector.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] when `repeat_threshold < 2`,
    /// `window_size == 0`, or `max_cycle_length == 0`.
    pub fn new(config: LoopDetectorConfig) -> PipelineResult<Self> {
        if config.repeat_threshold < 2 {
            return Err(PipelineError::Validation(format!(
                "repeat_threshold must be at least 2, got {}",
                config.repeat_threshold
            )));
        }
        if config.window_size == 0 {
            return Err(PipelineError::Validation("window_size must be positive".to_string()));
        }
        if config.max_cycle_length == 0 {
            return Err(PipelineError::Validation(
                "max_cycle_length must be positive".to_string(),
            ));
        }
        Ok(Self {
            config,
            turns: VecDeque::new(),
        })
    }

    /// Record a turn and check for loops.
    ///
    /// Returns `None` until at least `repeat_threshold` turns are recorded.
    /// Tool cycles take priority over output repeats.
    pub fn record_and_check(
        &mut self,
        output: &str,
        tool_calls: &[String],
    ) -> Option<LoopDetection> {
        while self.turns.len() >= self.config.window_size {
            self.turns.pop_front();
        }
        self.turns.push_back(TurnRecord {
            output_hash: hash_output(output),
            tool_calls: tool_calls.to_vec(),
        });

        if self.turns.len() < self.config.repeat_threshold {
            return None;
        }

        self.check_tool_cycle().or_else(|| self.check_output_repeat())
    }

    /// Forget all recorded turns.
    pub fn reset(&mut self) {
        self.turns.clear();
    }

    fn check_tool_cycle(&self) -> Option<LoopDetection> {
        let history: Vec<&String> = self
            .turns
            .iter()
            .flat_map(|turn| turn.tool_calls.iter())
            .collect();

        for len in 1..=self.config.max_cycle_length {
            let needed = len.checked_mul(self.config.repeat_threshold)?;
            if needed > history.len() {
                break;
            }
            let tail = &history[history.len().saturating_sub(needed)..];
            let pattern = &tail[..len];
            let repeats = tail.chunks(len).all(|chunk| chunk == pattern);
            if repeats {
                return Some(LoopDetection::ToolCycle {
                    cycle_pattern: pattern.iter().map(|s| (*s).clone()).collect(),
                    repetitions: self.config.repeat_threshold,
                    window_size: self.config.window_size,
                });
            }
        }
        None
    }

    fn check_output_repeat(&self) -> Option<LoopDetection> {
        let last = self.turns.back()?.output_hash;
        let run = self
            .turns
            .iter()
            .rev()
            .take_while(|turn| turn.output_hash == last)
            .count();
        if run >= self.config.repeat_threshold {
            return Some(LoopDetection::OutputRepeat {
                repetitions: run,
                window_size: self.config.window_size,
            });
        }
        None
    }
}

fn hash_output(output: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    output.hash(&mut hasher);
    hasher.finish()
}
