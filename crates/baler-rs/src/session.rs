//! Session state: the active log, summaries, counters, and fork semantics.
//!
//! A [`Session`] owns the ordered sequence of messages and summaries that
//! becomes the next model request, plus the token ledger and threshold
//! bookkeeping. Messages are append-only: compaction moves them out of the
//! active log into summary provenance (or, for pruning, into the discard
//! log), it never edits them. Each session is owned exclusively by one
//! logical thread of control; independent sessions share nothing.

use crate::compress::facts::ExtractedFacts;
use crate::ledger::{TokenLedger, TokenUsage, estimate_tokens_for_chars};
use crate::policy::ThresholdState;
use crate::{ContentBlock, Message, MessageId, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default context window in tokens when the caller does not specify one.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Default number of most-recent messages never touched by compression.
pub const DEFAULT_PRESERVE_RECENT: usize = 10;

// ── Summary ────────────────────────────────────────────────────────

/// Inclusive id range of the messages a summary replaced.
///
/// Ranges across a session's summaries are pairwise disjoint; together with
/// the discard log they account for every message no longer in the active
/// log.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoveringRange {
    pub first: MessageId,
    pub last: MessageId,
}

impl CoveringRange {
    pub fn new(first: MessageId, last: MessageId) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.first <= id && id <= self.last
    }

    pub fn overlaps(&self, other: &CoveringRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Replacement node produced by compaction. Immutable once written; a
/// re-compaction creates new summaries covering newer ranges, it does not
/// edit old ones.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Summary {
    #[serde(rename = "coveringRange")]
    pub covering_range: CoveringRange,
    /// Condensed natural-language text. Allowed to be lossy.
    pub narrative: String,
    /// Structured fields that must never be silently dropped.
    #[serde(rename = "extractedFacts")]
    pub facts: ExtractedFacts,
    #[serde(rename = "tokenCount")]
    pub token_count: u32,
    #[serde(rename = "generatedAt")]
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    /// Build a summary, measuring its own token footprint from the rendered
    /// text it will contribute to future requests.
    pub fn new(covering_range: CoveringRange, narrative: String, facts: ExtractedFacts) -> Self {
        let mut summary = Self {
            covering_range,
            narrative,
            facts,
            token_count: 0,
            generated_at: Utc::now(),
        };
        summary.token_count = estimate_tokens_for_chars(summary.render_text().len());
        summary
    }

    /// Narrative plus the structured-facts note, as injected into requests.
    pub fn render_text(&self) -> String {
        let note = self.facts.render_note();
        if note.is_empty() {
            self.narrative.clone()
        } else {
            format!("{}\n\n{note}", self.narrative)
        }
    }
}

// ── Active log ─────────────────────────────────────────────────────

/// One slot in the active log: an original message, or the summary that
/// replaced a span of them.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEntry {
    Message(Message),
    Summary(Summary),
}

impl LogEntry {
    pub fn token_count(&self) -> u32 {
        match self {
            LogEntry::Message(m) => m.token_count,
            LogEntry::Summary(s) => s.token_count,
        }
    }

    /// Time-order key: a message's own id, or the first id a summary covers.
    pub(crate) fn order_key(&self) -> u64 {
        match self {
            LogEntry::Message(m) => m.id.0,
            LogEntry::Summary(s) => s.covering_range.first.0,
        }
    }
}

/// One message in the rendered request handed to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub text: String,
}

/// Read-only snapshot for the `/context` style stats query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContextStats {
    pub active_message_count: usize,
    pub total_messages_seen: u64,
    pub summary_count: usize,
    pub usage_percent: f64,
    pub compressed: bool,
}

/// Acknowledgement paired with an injected summary so the request stays a
/// coherent user/assistant alternation.
const SUMMARY_ACK: &str = "I've reviewed the context summary and will continue from where I left off.";

// ── Session ────────────────────────────────────────────────────────

/// One conversation's context-budget state.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    context_window: u64,
    preserve_recent_count: usize,
    ledger: TokenLedger,
    threshold_state: ThresholdState,
    active_log: Vec<LogEntry>,
    next_message_id: u64,
    total_messages_seen: u64,
    pruned: Vec<MessageId>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            preserve_recent_count: DEFAULT_PRESERVE_RECENT,
            ledger: TokenLedger::new(),
            threshold_state: ThresholdState::default(),
            active_log: Vec::new(),
            next_message_id: 1,
            total_messages_seen: 0,
            pruned: Vec::new(),
        }
    }

    /// Override the context window size (in tokens).
    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }

    /// Override how many recent messages compression must leave untouched.
    pub fn with_preserve_recent(mut self, count: usize) -> Self {
        self.preserve_recent_count = count;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn context_window(&self) -> u64 {
        self.context_window
    }

    pub fn preserve_recent_count(&self) -> usize {
        self.preserve_recent_count
    }

    // ── Appending and accounting ───────────────────────────────────

    /// Append a message whose token count was not supplied by its producer;
    /// it is measured here, once, via the estimate fallback.
    pub fn append(&mut self, role: MessageRole, content: Vec<ContentBlock>) -> MessageId {
        let chars: usize = content.iter().map(ContentBlock::char_len).sum();
        let token_count = estimate_tokens_for_chars(chars);
        self.append_with_tokens(role, content, token_count)
    }

    /// Append a message with a producer-measured token count.
    pub fn append_with_tokens(
        &mut self,
        role: MessageRole,
        content: Vec<ContentBlock>,
        token_count: u32,
    ) -> MessageId {
        let id = MessageId(self.next_message_id);
        self.next_message_id += 1;
        self.total_messages_seen += 1;
        self.active_log.push(LogEntry::Message(Message {
            id,
            role,
            content,
            token_count,
            created_at: Utc::now(),
        }));
        id
    }

    /// Record a provider usage report for one completed turn.
    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.ledger.record_usage(input_tokens, output_tokens);
    }

    pub fn usage(&self) -> TokenUsage {
        self.ledger.usage()
    }

    /// Fraction of the context window consumed, per the ledger.
    pub fn usage_percent(&self) -> f64 {
        self.ledger.usage_percent(self.context_window)
    }

    pub fn threshold_state(&self) -> &ThresholdState {
        &self.threshold_state
    }

    pub(crate) fn threshold_state_mut(&mut self) -> &mut ThresholdState {
        &mut self.threshold_state
    }

    // ── Reading the log ────────────────────────────────────────────

    pub fn active_log(&self) -> &[LogEntry] {
        &self.active_log
    }

    pub fn active_messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.active_log.iter().filter_map(|e| match e {
            LogEntry::Message(m) => Some(m),
            LogEntry::Summary(_) => None,
        })
    }

    pub fn summaries(&self) -> impl Iterator<Item = &Summary> {
        self.active_log.iter().filter_map(|e| match e {
            LogEntry::Summary(s) => Some(s),
            LogEntry::Message(_) => None,
        })
    }

    pub fn summary_count(&self) -> usize {
        self.summaries().count()
    }

    /// Ids deleted outright by pruning: the audit trail for messages that
    /// are gone without a covering summary.
    pub fn pruned_ids(&self) -> &[MessageId] {
        &self.pruned
    }

    /// Token footprint of the active log (message and summary counts).
    pub fn active_tokens(&self) -> u64 {
        self.active_log
            .iter()
            .map(|e| e.token_count() as u64)
            .sum()
    }

    pub fn total_messages_seen(&self) -> u64 {
        self.total_messages_seen
    }

    /// Read-only stats snapshot for display.
    pub fn stats(&self) -> ContextStats {
        let summary_count = self.summary_count();
        ContextStats {
            active_message_count: self.active_messages().count(),
            total_messages_seen: self.total_messages_seen,
            summary_count,
            usage_percent: self.usage_percent(),
            compressed: summary_count > 0 || !self.pruned.is_empty(),
        }
    }

    /// Render the active log into the exact ordered list handed to the next
    /// model request. Summaries become a `<context_summary>` user message
    /// plus an assistant acknowledgement.
    pub fn render_request(&self) -> Vec<PromptMessage> {
        let mut out = Vec::with_capacity(self.active_log.len());
        for entry in &self.active_log {
            match entry {
                LogEntry::Message(m) => out.push(PromptMessage {
                    role: m.role,
                    text: m.render_text(),
                }),
                LogEntry::Summary(s) => {
                    out.push(PromptMessage {
                        role: MessageRole::User,
                        text: format!(
                            "<context_summary>\n{}\n</context_summary>",
                            s.render_text()
                        ),
                    });
                    out.push(PromptMessage {
                        role: MessageRole::Assistant,
                        text: SUMMARY_ACK.to_string(),
                    });
                }
            }
        }
        out
    }

    // ── Fork ───────────────────────────────────────────────────────

    /// Duplicate this session under a fresh identity. The fork inherits the
    /// cumulative counters, summaries, and discard log, so a forked
    /// conversation does not restart its budget from zero.
    pub fn fork(&self) -> Session {
        Session {
            id: generate_session_id(),
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    // ── Engine hooks ───────────────────────────────────────────────

    pub(crate) fn log_mut(&mut self) -> &mut Vec<LogEntry> {
        &mut self.active_log
    }

    pub(crate) fn record_pruned(&mut self, ids: impl IntoIterator<Item = MessageId>) {
        self.pruned.extend(ids);
    }

    /// Bookkeeping after a compaction run that changed the log: reclaim the
    /// footprint from the ledger, stamp the time, and re-arm the warning.
    pub(crate) fn note_compaction(&mut self, reclaimed: u64) {
        self.ledger.reclaim(reclaimed);
        self.threshold_state.warning_issued = false;
        self.threshold_state.last_compaction_at = Some(Utc::now());
    }

    // ── Store hooks ────────────────────────────────────────────────

    pub(crate) fn next_message_id(&self) -> u64 {
        self.next_message_id
    }

    /// Rebuild a session from persisted parts. The log must already be in
    /// time order; the store validates before calling this.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        created_at: DateTime<Utc>,
        context_window: u64,
        preserve_recent_count: usize,
        active_log: Vec<LogEntry>,
        usage: TokenUsage,
        threshold_state: ThresholdState,
        next_message_id: u64,
        total_messages_seen: u64,
        pruned: Vec<MessageId>,
    ) -> Session {
        Session {
            id,
            created_at,
            context_window,
            preserve_recent_count,
            ledger: TokenLedger::from_usage(usage),
            threshold_state,
            active_log,
            next_message_id,
            total_messages_seen,
            pruned,
        }
    }
}

/// Generate a fresh session id (epoch nanos, hex).
pub(crate) fn generate_session_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("sess-{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_monotonic_ids() {
        let mut session = Session::new("sess-test");
        let a = session.append(MessageRole::User, vec![ContentBlock::text("one")]);
        let b = session.append(MessageRole::Assistant, vec![ContentBlock::text("two")]);
        assert!(a < b);
        assert_eq!(a, MessageId(1));
        assert_eq!(b, MessageId(2));
        assert_eq!(session.total_messages_seen(), 2);
    }

    #[test]
    fn append_measures_tokens_once() {
        let mut session = Session::new("sess-test");
        session.append(MessageRole::User, vec![ContentBlock::text("a".repeat(400))]);

        let msg = session.active_messages().next().unwrap();
        assert_eq!(msg.token_count, 100);
    }

    #[test]
    fn active_messages_iterates_both_ways() {
        let mut session = Session::new("sess-test");
        for text in ["one", "two", "three"] {
            session.append(MessageRole::User, vec![ContentBlock::text(text)]);
        }

        let forward: Vec<u64> = session.active_messages().map(|m| m.id.0).collect();
        let backward: Vec<u64> = session.active_messages().rev().map(|m| m.id.0).collect();
        assert_eq!(forward, vec![1, 2, 3]);
        assert_eq!(backward, vec![3, 2, 1]);
    }

    #[test]
    fn active_tokens_sums_entries() {
        let mut session = Session::new("sess-test");
        session.append_with_tokens(MessageRole::User, vec![ContentBlock::text("a")], 100);
        session.append_with_tokens(MessageRole::Assistant, vec![ContentBlock::text("b")], 50);
        assert_eq!(session.active_tokens(), 150);
    }

    #[test]
    fn usage_percent_uses_configured_window() {
        let mut session = Session::new("sess-test").with_context_window(1000);
        session.record_usage(400, 100);
        assert!((session.usage_percent() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stats_reflect_compression() {
        let mut session = Session::new("sess-test");
        session.append(MessageRole::User, vec![ContentBlock::text("hello")]);

        let stats = session.stats();
        assert_eq!(stats.active_message_count, 1);
        assert_eq!(stats.total_messages_seen, 1);
        assert_eq!(stats.summary_count, 0);
        assert!(!stats.compressed);

        session.record_pruned([MessageId(1)]);
        assert!(session.stats().compressed);
    }

    #[test]
    fn render_request_expands_summaries() {
        let mut session = Session::new("sess-test");
        session.append(MessageRole::System, vec![ContentBlock::text("sys")]);

        let summary = Summary::new(
            CoveringRange::new(MessageId(2), MessageId(5)),
            "Earlier work summarized.".into(),
            ExtractedFacts::default(),
        );
        session.log_mut().push(LogEntry::Summary(summary));
        session.append(MessageRole::User, vec![ContentBlock::text("next step")]);

        let prompt = session.render_request();
        // system + (summary user + ack assistant) + user = 4
        assert_eq!(prompt.len(), 4);
        assert_eq!(prompt[0].role, MessageRole::System);
        assert!(prompt[1].text.contains("<context_summary>"));
        assert!(prompt[1].text.contains("Earlier work summarized."));
        assert_eq!(prompt[2].role, MessageRole::Assistant);
        assert_eq!(prompt[3].text, "next step");
    }

    #[test]
    fn fork_inherits_budget_and_summaries() {
        let mut session = Session::new("sess-orig");
        session.record_usage(30_000, 10_000);
        for range in [(1, 4), (5, 9)] {
            session.log_mut().push(LogEntry::Summary(Summary::new(
                CoveringRange::new(MessageId(range.0), MessageId(range.1)),
                "span".into(),
                ExtractedFacts::default(),
            )));
        }

        let fork = session.fork();
        assert_ne!(fork.id(), session.id());
        assert_eq!(fork.usage().total, 40_000);
        assert_eq!(fork.summary_count(), 2);
    }

    #[test]
    fn note_compaction_rearms_warning() {
        let mut session = Session::new("sess-test");
        session.record_usage(1000, 0);
        session.threshold_state_mut().warning_issued = true;

        session.note_compaction(400);
        assert!(!session.threshold_state().warning_issued);
        assert!(session.threshold_state().last_compaction_at.is_some());
        assert_eq!(session.usage().total, 600);
    }

    #[test]
    fn summary_token_count_tracks_rendered_text() {
        let mut facts = ExtractedFacts::default();
        facts.files_touched.insert("src/main.rs".into());

        let summary = Summary::new(
            CoveringRange::new(MessageId(1), MessageId(3)),
            "Did things.".into(),
            facts,
        );
        assert!(summary.token_count > 0);
        assert_eq!(
            summary.token_count,
            estimate_tokens_for_chars(summary.render_text().len())
        );
    }

    #[test]
    fn covering_range_contains_and_overlaps() {
        let a = CoveringRange::new(MessageId(3), MessageId(7));
        assert!(a.contains(MessageId(3)));
        assert!(a.contains(MessageId(7)));
        assert!(!a.contains(MessageId(8)));

        let b = CoveringRange::new(MessageId(7), MessageId(9));
        let c = CoveringRange::new(MessageId(8), MessageId(9));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
