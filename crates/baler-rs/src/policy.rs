//! Warn/compact threshold policy.
//!
//! [`evaluate`] is a pure, total function from usage percentage and prior
//! state to a decision; no I/O, no clock, no side effects. The warning is
//! edge-triggered: it fires once per crossing, and `warning_issued` is reset
//! by the engine whenever a compaction completes, so a climb back above the
//! warn threshold after compaction warns again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do about the current usage level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Usage is within bounds, or the warning already fired.
    None,
    /// Warn threshold crossed for the first time since the last compaction.
    Warn,
    /// Compact threshold crossed; the engine must run before the next call.
    Compact,
}

/// Threshold configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    /// Usage fraction at which to warn once. Default 0.80.
    pub warn_threshold: f64,
    /// Usage fraction at which compaction becomes mandatory. Default 0.90.
    pub compact_threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.80,
            compact_threshold: 0.90,
        }
    }
}

/// Per-session threshold bookkeeping, persisted with the session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ThresholdState {
    /// Whether the warning fired since the last compaction.
    #[serde(default)]
    pub warning_issued: bool,
    /// Timestamp of the last completed compaction, if any.
    #[serde(default)]
    pub last_compaction_at: Option<DateTime<Utc>>,
}

/// Map current usage and prior state to a decision.
///
/// Compact wins regardless of whether a warning was already issued; warn
/// fires only on the first crossing since state was last reset.
pub fn evaluate(usage_percent: f64, state: &ThresholdState, config: &ThresholdConfig) -> Decision {
    if usage_percent >= config.compact_threshold {
        Decision::Compact
    } else if usage_percent >= config.warn_threshold && !state.warning_issued {
        Decision::Warn
    } else {
        Decision::None
    }
}
