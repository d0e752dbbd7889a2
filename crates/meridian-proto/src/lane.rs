//! Priority lanes for node-bound messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three priority lanes.
///
/// Lanes drain in declaration order: `steer` before `collect` before
/// `followup`. Within a lane, messages keep enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Operator steering input; may preempt in-flight work.
    Steer,
    /// Regular inbound messages.
    Collect,
    /// Deferred follow-ups.
    Followup,
}

impl Lane {
    /// All lanes in drain (priority) order.
    pub const ALL: [Lane; 3] = [Lane::Steer, Lane::Collect, Lane::Followup];
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Steer => write!(f, "steer"),
            Self::Collect => write!(f, "collect"),
            Self::Followup => write!(f, "followup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_order_is_priority_order() {
        assert_eq!(Lane::ALL, [Lane::Steer, Lane::Collect, Lane::Followup]);
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&Lane::Followup).unwrap(), "\"followup\"");
        let lane: Lane = serde_json::from_str("\"steer\"").unwrap();
        assert_eq!(lane, Lane::Steer);
    }
}
