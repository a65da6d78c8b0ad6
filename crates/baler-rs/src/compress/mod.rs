//! Two-layer compression engine.
//!
//! Given a session over budget, the engine first prunes low-importance
//! messages outright (Layer 1, no model call), then condenses the oldest
//! contiguous spans into summaries (Layer 2) until the active log fits under
//! the target fraction of the context window. Layer 2 is where narrative
//! generation happens; it runs under a timeout and degrades to a placeholder
//! narrative on failure, with deterministic fact extraction surviving either
//! way.
//!
//! Compaction is scheduled strictly between turns. [`CompressionEngine`] is
//! handed a `&mut Session`, so the borrow checker enforces what the
//! concurrency model requires: no compression run overlaps a model call for
//! the same session.

pub mod facts;
mod prune;
pub mod summarize;

use crate::error::CompressError;
use crate::events::{ContextEvent, Notifier};
use crate::policy::{self, Decision, ThresholdConfig};
use crate::session::{CoveringRange, LogEntry, Session, Summary};
use crate::{Message, MessageId};
use std::collections::BTreeSet;
use std::time::Duration;
use summarize::{Summarizer, fallback_narrative};
use tokio::time::timeout;
use tracing::{debug, info};

// ── Configuration ──────────────────────────────────────────────────

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub thresholds: ThresholdConfig,
    /// Fraction of the context window to compress back down to.
    pub target_fraction: f64,
    /// Cap on how many messages one summary may condense before pair
    /// closure is applied.
    pub span_max_messages: usize,
    /// Timeout on one narrative-generation call.
    pub summarize_timeout: Duration,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            target_fraction: 0.70,
            span_max_messages: 25,
            summarize_timeout: Duration::from_secs(30),
        }
    }
}

/// What one compression run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub tokens_before: u64,
    pub tokens_after: u64,
    /// Ids deleted outright by Layer 1.
    pub pruned: Vec<MessageId>,
    pub summaries_created: usize,
    /// True if any narrative generation failed or timed out.
    pub degraded: bool,
}

impl CompressionOutcome {
    pub fn tokens_reclaimed(&self) -> u64 {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    /// Whether the run altered the active log at all.
    pub fn changed(&self) -> bool {
        !self.pruned.is_empty() || self.summaries_created > 0
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Drives threshold evaluation and the two compression layers.
pub struct CompressionEngine {
    config: CompressionConfig,
    notifier: Notifier,
}

impl CompressionEngine {
    pub fn new(config: CompressionConfig, notifier: Notifier) -> Self {
        Self { config, notifier }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Evaluate the threshold policy for this session, emitting the warning
    /// event (and marking it issued) on a first crossing.
    ///
    /// Call once per turn, after usage is recorded and before the next model
    /// request. A `Compact` return means [`compress`](Self::compress) must
    /// run before that request.
    pub fn evaluate(&self, session: &mut Session) -> Decision {
        let usage_percent = session.usage_percent();
        let decision = policy::evaluate(
            usage_percent,
            session.threshold_state(),
            &self.config.thresholds,
        );
        if decision == Decision::Warn {
            session.threshold_state_mut().warning_issued = true;
            self.notifier
                .emit(&ContextEvent::ContextWarning { usage_percent });
        }
        decision
    }

    /// Run both compression layers until the active log fits under the
    /// target, emitting lifecycle events along the way.
    ///
    /// Also the entry point for a manual `/compact`: the run is identical
    /// whether the threshold forced it or the user did. Running again with
    /// no new messages is a no-op.
    ///
    /// Errors only when, with both layers exhausted, the preserved tail
    /// alone still exceeds the context window.
    pub async fn compress(
        &self,
        session: &mut Session,
        summarizer: &dyn Summarizer,
    ) -> Result<CompressionOutcome, CompressError> {
        self.notifier.emit(&ContextEvent::CompactionStarted);

        let tokens_before = session.active_tokens();
        let target = (session.context_window() as f64 * self.config.target_fraction) as u64;
        debug!(tokens_before, target, "compression run starting");

        // Layer 1: importance-scored pruning, no model call.
        let pruned = prune::prune_to_target(session, target);

        // Layer 2: condense the oldest spans into summaries.
        let mut summaries_created = 0usize;
        let mut degraded = false;
        while session.active_tokens() > target {
            let Some((start, end)) = next_span(session, self.config.span_max_messages) else {
                break;
            };
            let span: Vec<Message> = session.active_log()[start..=end]
                .iter()
                .filter_map(|entry| match entry {
                    LogEntry::Message(m) => Some(m.clone()),
                    LogEntry::Summary(_) => None,
                })
                .collect();
            let span_tokens: u64 = span.iter().map(|m| m.token_count as u64).sum();
            let range = CoveringRange::new(
                span.first().map(|m| m.id).unwrap_or(MessageId(0)),
                span.last().map(|m| m.id).unwrap_or(MessageId(0)),
            );

            let extracted = facts::extract(&span);
            let narrative = match timeout(self.config.summarize_timeout, summarizer.summarize(&span))
                .await
            {
                Ok(Ok(text)) => Some(text),
                Ok(Err(err)) => {
                    degraded = true;
                    self.notifier
                        .emit(&ContextEvent::CompactionDegraded { reason: err.as_str() });
                    None
                }
                Err(_) => {
                    degraded = true;
                    self.notifier.emit(&ContextEvent::CompactionDegraded {
                        reason: "summarization timed out",
                    });
                    None
                }
            };

            let used_fallback = narrative.is_none();
            let mut summary = Summary::new(
                range,
                narrative.unwrap_or_else(|| fallback_narrative(&span)),
                extracted.clone(),
            );
            // The splice must strictly shrink the log; a summary as large as
            // its span is worthless.
            if summary.token_count as u64 >= span_tokens {
                if used_fallback {
                    break;
                }
                summary = Summary::new(range, fallback_narrative(&span), extracted);
                if summary.token_count as u64 >= span_tokens {
                    break;
                }
            }

            let _ = session
                .log_mut()
                .splice(start..=end, [LogEntry::Summary(summary)]);
            summaries_created += 1;
        }

        let tokens_after = session.active_tokens();
        let outcome = CompressionOutcome {
            tokens_before,
            tokens_after,
            pruned: pruned.pruned,
            summaries_created,
            degraded,
        };
        if outcome.changed() {
            session.note_compaction(outcome.tokens_reclaimed());
            info!(
                tokens_before,
                tokens_after,
                pruned = outcome.pruned.len(),
                summaries = summaries_created,
                "compression run finished"
            );
        }
        self.notifier.emit(&ContextEvent::CompactionFinished(&outcome));

        let tail_tokens = preserved_tail_tokens(session);
        if tail_tokens > session.context_window() {
            return Err(CompressError::ContextOverflow {
                tail_tokens,
                context_window: session.context_window(),
            });
        }
        Ok(outcome)
    }
}

// ── Span selection ─────────────────────────────────────────────────

/// Pick the oldest contiguous span of compactable messages, as inclusive
/// log indexes.
///
/// The span starts at the oldest non-system message entry, never reaches
/// into the preserved tail, and is closed under tool-call/result pairing:
/// a call whose result lies beyond the span pulls the result in, and a
/// call whose result sits in the tail (unreachable) pushes the span end
/// back below the call. A call pinned that way at the very front of a
/// candidate span stays active and the search resumes past it, the same
/// way system messages are skipped. Returns `None` when nothing outside
/// the tail is compactable.
fn next_span(session: &Session, max_len: usize) -> Option<(usize, usize)> {
    let log = session.active_log();
    let preserve = session.preserve_recent_count();

    let msg_positions: Vec<usize> = log
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| matches!(e, LogEntry::Message(_)).then_some(idx))
        .collect();
    if msg_positions.len() <= preserve {
        return None;
    }
    let tail_start = if preserve == 0 {
        log.len()
    } else {
        msg_positions[msg_positions.len() - preserve]
    };

    let mut search_from = 0;
    'candidates: loop {
        let start = (search_from..tail_start).find(|&idx| is_plain_message(&log[idx]))?;
        let mut end = start;
        while end + 1 < tail_start && end + 1 - start < max_len && is_plain_message(&log[end + 1])
        {
            end += 1;
        }

        // Pair closure. The ceiling only ever moves down, and within a fixed
        // ceiling the end only moves up, so this terminates; `search_from`
        // only moves up across candidates.
        let mut ceiling = tail_start;
        loop {
            let open = open_call_ids(log, start, end);
            if open.is_empty() {
                return Some((start, end));
            }

            let mut extend_to = end;
            let mut shrink_below: Option<usize> = None;
            for call_id in &open {
                match result_position(log, end + 1, ceiling, call_id) {
                    Some(pos) if contiguous_messages(log, end + 1, pos) => {
                        extend_to = extend_to.max(pos);
                    }
                    _ => {
                        let call_pos = call_position(log, start, end, call_id)?;
                        shrink_below =
                            Some(shrink_below.map_or(call_pos, |s: usize| s.min(call_pos)));
                    }
                }
            }

            if let Some(limit) = shrink_below {
                if limit <= start {
                    // The span opens with a call whose result it cannot
                    // reach; leave the pair intact and look past it.
                    search_from = start + 1;
                    continue 'candidates;
                }
                ceiling = limit;
                end = limit - 1;
            } else {
                end = extend_to;
            }
        }
    }
}

/// Token footprint of the preserved tail alone.
fn preserved_tail_tokens(session: &Session) -> u64 {
    session
        .active_messages()
        .rev()
        .take(session.preserve_recent_count())
        .map(|m| m.token_count as u64)
        .sum()
}

fn is_plain_message(entry: &LogEntry) -> bool {
    matches!(entry, LogEntry::Message(m) if !m.is_system())
}

/// Call ids opened within `[start, end]` whose results are not also there.
fn open_call_ids(log: &[LogEntry], start: usize, end: usize) -> BTreeSet<String> {
    let mut open = BTreeSet::new();
    for entry in &log[start..=end] {
        if let LogEntry::Message(m) = entry {
            for id in m.tool_call_ids() {
                open.insert(id.to_string());
            }
            for id in m.tool_result_ids() {
                open.remove(id);
            }
        }
    }
    open
}

fn result_position(log: &[LogEntry], from: usize, ceiling: usize, call_id: &str) -> Option<usize> {
    (from..ceiling).find(|&idx| {
        matches!(&log[idx], LogEntry::Message(m) if m.tool_result_ids().any(|id| id == call_id))
    })
}

fn call_position(log: &[LogEntry], start: usize, end: usize, call_id: &str) -> Option<usize> {
    (start..=end).find(|&idx| {
        matches!(&log[idx], LogEntry::Message(m) if m.tool_call_ids().any(|id| id == call_id))
    })
}

/// Whether every entry in `[from, to]` is a non-system message, so a span
/// extension over that range stays contiguous.
fn contiguous_messages(log: &[LogEntry], from: usize, to: usize) -> bool {
    log[from..=to].iter().all(is_plain_message)
}
