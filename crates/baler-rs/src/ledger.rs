//! Token accounting: cumulative counters fed by provider usage reports.
//!
//! The ledger is pure bookkeeping. It holds no opinion about when to act on
//! the numbers (that is [`policy`](crate::policy)) and it never mutates the
//! session around it; callers persist the result. When a provider omits usage
//! metadata, [`estimate_tokens`] provides a character-ratio fallback.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Characters per token used by the estimate fallback. Most tokenizers for
/// English text average 3-4 chars per token; 4.0 is the conservative end.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Cumulative token counters for a session, sourced from the provider.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    /// Running total. Tracks the current context footprint: it grows with
    /// every reported turn and shrinks when compaction reclaims tokens,
    /// while `input`/`output` remain lifetime tallies.
    pub total: u64,
}

/// Running token ledger for one session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenLedger {
    usage: TokenUsage,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted counters.
    pub fn from_usage(usage: TokenUsage) -> Self {
        Self { usage }
    }

    /// Current counters.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Record a provider usage report for one completed turn. Counters only
    /// ever move by addition here.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.usage.input += input_tokens;
        self.usage.output += output_tokens;
        self.usage.total += input_tokens + output_tokens;
    }

    /// Subtract tokens reclaimed by a compaction run from the running total.
    /// Lifetime `input`/`output` tallies are not rewound.
    pub fn reclaim(&mut self, tokens: u64) {
        self.usage.total = self.usage.total.saturating_sub(tokens);
    }

    /// Fraction of the context window currently consumed, clamped to [0, 1].
    pub fn usage_percent(&self, context_window: u64) -> f64 {
        if context_window == 0 {
            return 1.0;
        }
        (self.usage.total as f64 / context_window as f64).clamp(0.0, 1.0)
    }
}

/// Fallback token count for raw text, used only when the provider does not
/// return usage metadata.
pub fn estimate_tokens(text: &str) -> u32 {
    estimate_tokens_for_chars(text.len())
}

/// Fallback token count for an already-known character count.
pub fn estimate_tokens_for_chars(chars: usize) -> u32 {
    let tokens = (chars as f64 / DEFAULT_CHARS_PER_TOKEN).ceil() as u32;
    debug!("estimated {tokens} tokens from {chars} chars (no provider usage report)");
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_usage_accumulates() {
        let mut ledger = TokenLedger::new();
        ledger.record_usage(1000, 50);
        ledger.record_usage(1000, 50);

        let usage = ledger.usage();
        assert_eq!(usage.input, 2000);
        assert_eq!(usage.output, 100);
        assert_eq!(usage.total, 2100);
    }

    #[test]
    fn usage_percent_clamps_to_unit_interval() {
        let mut ledger = TokenLedger::new();
        assert_eq!(ledger.usage_percent(100_000), 0.0);

        ledger.record_usage(50_000, 0);
        assert!((ledger.usage_percent(100_000) - 0.5).abs() < 1e-9);

        ledger.record_usage(200_000, 0);
        assert_eq!(ledger.usage_percent(100_000), 1.0);
    }

    #[test]
    fn usage_percent_zero_window_is_full() {
        let ledger = TokenLedger::new();
        assert_eq!(ledger.usage_percent(0), 1.0);
    }

    #[test]
    fn reclaim_reduces_total_only() {
        let mut ledger = TokenLedger::new();
        ledger.record_usage(10_000, 2_000);
        ledger.reclaim(5_000);

        let usage = ledger.usage();
        assert_eq!(usage.total, 7_000);
        assert_eq!(usage.input, 10_000);
        assert_eq!(usage.output, 2_000);
    }

    #[test]
    fn reclaim_saturates_at_zero() {
        let mut ledger = TokenLedger::new();
        ledger.record_usage(100, 0);
        ledger.reclaim(500);
        assert_eq!(ledger.usage().total, 0);
    }

    #[test]
    fn estimate_uses_four_chars_per_token() {
        assert_eq!(estimate_tokens(&"a".repeat(400)), 100);
        assert_eq!(estimate_tokens(&"a".repeat(401)), 101); // rounds up
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimate_paths_agree() {
        // Both entry points share one implementation, so the fallback logs
        // the same way no matter which one the caller reaches.
        for len in [0usize, 1, 4, 5, 399, 400, 401] {
            assert_eq!(estimate_tokens(&"a".repeat(len)), estimate_tokens_for_chars(len));
        }
    }

    #[test]
    fn ledger_serde_roundtrip() {
        let mut ledger = TokenLedger::new();
        ledger.record_usage(42, 7);

        let json = serde_json::to_string(&ledger).unwrap();
        let back: TokenLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }
}
