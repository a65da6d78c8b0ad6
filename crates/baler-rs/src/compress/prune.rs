//! Layer 1: importance-scored pruning.
//!
//! Pruning deletes low-value messages outright, without a model call and
//! without summarization. It targets noise like stale tool dumps and
//! acknowledgement chatter; anything historically significant is either
//! protected outright (system prompt, the preserved tail, fact-bearing
//! messages) or left for compaction to condense with provenance. Deleted
//! ids go to the session's discard log so the removed-message accounting
//! stays verifiable.

use crate::compress::facts::{extract_paths, message_has_facts};
use crate::session::{LogEntry, Session};
use crate::{Message, MessageId, MessageRole};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Result of one pruning pass.
#[derive(Debug, Default)]
pub(crate) struct PruneOutcome {
    pub pruned: Vec<MessageId>,
    pub tokens_removed: u64,
}

/// Remove the lowest-importance prune units until the active log fits under
/// `target_tokens`, or no eligible units remain.
///
/// A prune unit is a message together with any messages tied to it by a
/// tool-call/tool-result pairing; units are removed whole, so a call is
/// never separated from its result. Summaries are never pruned.
pub(crate) fn prune_to_target(session: &mut Session, target_tokens: u64) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();
    if session.active_tokens() <= target_tokens {
        return outcome;
    }

    let candidates = {
        let messages: Vec<(usize, &Message)> = session
            .active_log()
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| match entry {
                LogEntry::Message(m) => Some((idx, m)),
                LogEntry::Summary(_) => None,
            })
            .collect();

        let protected = protected_indexes(&messages, session.preserve_recent_count());
        let units = pair_units(&messages);
        score_candidates(&messages, &units, &protected)
    };

    // Lowest-scoring units go first; ties fall to the oldest.
    let mut remove: BTreeSet<MessageId> = BTreeSet::new();
    let mut remaining = session.active_tokens();
    for unit in &candidates {
        if remaining <= target_tokens {
            break;
        }
        remaining = remaining.saturating_sub(unit.tokens);
        remove.extend(unit.ids.iter().copied());
        outcome.tokens_removed += unit.tokens;
    }

    if remove.is_empty() {
        return outcome;
    }

    session.log_mut().retain(|entry| match entry {
        LogEntry::Message(m) => !remove.contains(&m.id),
        LogEntry::Summary(_) => true,
    });
    outcome.pruned = remove.into_iter().collect();
    session.record_pruned(outcome.pruned.iter().copied());

    debug!(
        pruned = outcome.pruned.len(),
        tokens_removed = outcome.tokens_removed,
        "pruned low-importance messages"
    );
    outcome
}

// ── Protection ─────────────────────────────────────────────────────

/// Log indexes that pruning may never touch: the system prompt, the most
/// recent `preserve_recent` messages, and fact-bearing messages (those are
/// compaction's job, where facts survive into a summary).
fn protected_indexes(messages: &[(usize, &Message)], preserve_recent: usize) -> BTreeSet<usize> {
    let mut protected = BTreeSet::new();
    let tail_start = messages.len().saturating_sub(preserve_recent);
    for (pos, (idx, msg)) in messages.iter().enumerate() {
        if msg.is_system() || pos >= tail_start || message_has_facts(msg) {
            protected.insert(*idx);
        }
    }
    protected
}

// ── Pair units ─────────────────────────────────────────────────────

/// Group message indexes into atomic units along tool-call/result pairings.
/// A message with neither calls nor results is a unit of one.
fn pair_units(messages: &[(usize, &Message)]) -> Vec<Vec<usize>> {
    // call_id -> index of the message that issued the call.
    let mut caller: HashMap<&str, usize> = HashMap::new();
    for (idx, msg) in messages {
        for call_id in msg.tool_call_ids() {
            caller.insert(call_id, *idx);
        }
    }

    // Root each message at itself, then fold results into their caller.
    let mut root: BTreeMap<usize, usize> = messages.iter().map(|(idx, _)| (*idx, *idx)).collect();
    for (idx, msg) in messages {
        for result_id in msg.tool_result_ids() {
            if let Some(&call_idx) = caller.get(result_id) {
                let call_root = root.get(&call_idx).copied().unwrap_or(call_idx);
                root.insert(*idx, call_root);
            }
        }
    }

    let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, r) in root {
        grouped.entry(r).or_default().push(idx);
    }
    grouped.into_values().collect()
}

// ── Scoring ────────────────────────────────────────────────────────

struct Candidate {
    ids: Vec<MessageId>,
    tokens: u64,
    score: f64,
    oldest: usize,
}

/// Per-message importance from cheap signals: recency, role, whether a tool
/// result's output is still referenced by later text, and fact content.
fn importance(msg: &Message, position_frac: f64, referenced_later: bool) -> f64 {
    let mut score = position_frac;
    score += match msg.role {
        MessageRole::System => 2.0,
        MessageRole::User => 1.0,
        MessageRole::Assistant => 0.5,
        MessageRole::ToolResult => 0.0,
    };
    if referenced_later {
        score += 1.0;
    }
    if message_has_facts(msg) {
        score += 1.5;
    }
    score
}

/// Score every unit not touching a protected message. A unit scores as the
/// maximum of its members, so a pair survives if either half matters.
fn score_candidates(
    messages: &[(usize, &Message)],
    units: &[Vec<usize>],
    protected: &BTreeSet<usize>,
) -> Vec<Candidate> {
    let by_idx: HashMap<usize, (usize, &Message)> = messages
        .iter()
        .enumerate()
        .map(|(pos, (idx, msg))| (*idx, (pos, *msg)))
        .collect();
    let total = messages.len().max(1) as f64;

    let mut candidates: Vec<Candidate> = units
        .iter()
        .filter(|unit| unit.iter().all(|idx| !protected.contains(idx)))
        .map(|unit| {
            let mut score = f64::MIN;
            let mut tokens = 0u64;
            let mut ids = Vec::with_capacity(unit.len());
            let oldest = unit.iter().copied().min().unwrap_or(0);
            for idx in unit {
                let (pos, msg) = by_idx[idx];
                let referenced = referenced_by_later_text(msg, pos, messages);
                score = score.max(importance(msg, pos as f64 / total, referenced));
                tokens += msg.token_count as u64;
                ids.push(msg.id);
            }
            Candidate {
                ids,
                tokens,
                score,
                oldest,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.oldest.cmp(&b.oldest))
    });
    candidates
}

/// Whether a tool result's output paths show up in later message text. Such
/// a result is still being referred to and should not be pruned early.
fn referenced_by_later_text(msg: &Message, pos: usize, messages: &[(usize, &Message)]) -> bool {
    if msg.role != MessageRole::ToolResult {
        return false;
    }
    let paths = extract_paths(&msg.render_text());
    if paths.is_empty() {
        return false;
    }
    messages[pos + 1..].iter().any(|(_, later)| {
        let text = later.text();
        paths.iter().any(|p| text.contains(p.as_str()))
    })
}
