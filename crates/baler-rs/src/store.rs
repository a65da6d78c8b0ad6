//! Durable session snapshots.
//!
//! One JSON file per session under a store directory. Saves are atomic
//! (write to a temp file, then rename) so a crash mid-write never leaves a
//! half-written snapshot where `load` will find it. Field names are stable;
//! files written before compression existed load with sensible defaults
//! (zero usage, no summaries) instead of failing. A snapshot that parses
//! but fails validation is reported as corrupt, and the caller starts a
//! fresh session rather than operating on inconsistent state.

use crate::error::StoreError;
use crate::ledger::TokenUsage;
use crate::policy::ThresholdState;
use crate::session::{DEFAULT_CONTEXT_WINDOW, DEFAULT_PRESERVE_RECENT, LogEntry, Session, Summary};
use crate::{Message, MessageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Filesystem-backed session store.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write a consistent snapshot of the session.
    ///
    /// The write goes to a temp file in the same directory and is renamed
    /// into place, so a concurrent crash leaves either the old snapshot or
    /// the new one, never a torn file.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let snapshot = SessionSnapshot::of(session);
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp = self.dir.join(format!(".{}.json.tmp", session.id()));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, self.path_for(session.id()))?;
        debug!(id = session.id(), "session saved");
        Ok(())
    }

    /// Load a session by id. Returns `Ok(None)` if no snapshot exists;
    /// a snapshot that cannot be parsed or fails validation is an error.
    pub fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let snapshot: SessionSnapshot =
            serde_json::from_str(&json).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        if let Err(reason) = snapshot.validate() {
            warn!(id, %reason, "session snapshot failed validation");
            return Err(StoreError::Corrupt { path, reason });
        }
        Ok(Some(snapshot.into_session()))
    }

    /// Duplicate a session under a new identity and persist the copy. The
    /// fork inherits cumulative counters and summaries.
    pub fn fork(&self, session: &Session) -> Result<Session, StoreError> {
        let forked = session.fork();
        self.save(&forked)?;
        Ok(forked)
    }

    /// Ids of every session with a snapshot in the store directory.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Skip in-flight temp files.
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ── Snapshot schema ────────────────────────────────────────────────

fn default_context_window() -> u64 {
    DEFAULT_CONTEXT_WINDOW
}

fn default_preserve_recent() -> usize {
    DEFAULT_PRESERVE_RECENT
}

/// Compression bookkeeping, grouped so pre-compression snapshots default
/// the whole block away.
#[derive(Serialize, Deserialize)]
struct CompressionMeta {
    #[serde(default)]
    summaries: Vec<Summary>,
    #[serde(rename = "preserveRecentCount", default = "default_preserve_recent")]
    preserve_recent_count: usize,
    #[serde(rename = "prunedMessageIds", default)]
    pruned_message_ids: Vec<MessageId>,
}

// The field attribute above only applies when a `compressionMeta` object is
// present; a snapshot missing the whole block goes through this impl, which
// must agree on the preserve count or legacy sessions would load with an
// unprotected tail.
impl Default for CompressionMeta {
    fn default() -> Self {
        Self {
            summaries: Vec::new(),
            preserve_recent_count: DEFAULT_PRESERVE_RECENT,
            pruned_message_ids: Vec::new(),
        }
    }
}

/// On-disk form of a session. Everything but `id` has a default so old
/// snapshots keep loading as fields accrete.
#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    id: String,
    #[serde(rename = "createdAt", default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(rename = "contextWindow", default = "default_context_window")]
    context_window: u64,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(rename = "tokenUsage", default)]
    token_usage: TokenUsage,
    #[serde(rename = "thresholdState", default)]
    threshold_state: ThresholdState,
    #[serde(rename = "compressionMeta", default)]
    compression_meta: CompressionMeta,
    #[serde(rename = "nextMessageId", default)]
    next_message_id: u64,
    #[serde(rename = "totalMessagesSeen", default)]
    total_messages_seen: u64,
}

impl SessionSnapshot {
    fn of(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            created_at: session.created_at(),
            context_window: session.context_window(),
            messages: session.active_messages().cloned().collect(),
            token_usage: session.usage(),
            threshold_state: session.threshold_state().clone(),
            compression_meta: CompressionMeta {
                summaries: session.summaries().cloned().collect(),
                preserve_recent_count: session.preserve_recent_count(),
                pruned_message_ids: session.pruned_ids().to_vec(),
            },
            next_message_id: session.next_message_id(),
            total_messages_seen: session.total_messages_seen(),
        }
    }

    /// Structural checks a parseable snapshot must still pass: strictly
    /// increasing message ids, pairwise-disjoint covering ranges, and no
    /// active message covered by a range.
    fn validate(&self) -> Result<(), String> {
        let mut prev: Option<MessageId> = None;
        for msg in &self.messages {
            if let Some(p) = prev
                && msg.id <= p
            {
                return Err(format!("message ids not strictly increasing at {}", msg.id));
            }
            prev = Some(msg.id);
        }

        let ranges: Vec<_> = self
            .compression_meta
            .summaries
            .iter()
            .map(|s| s.covering_range)
            .collect();
        for range in &ranges {
            if range.last < range.first {
                return Err(format!(
                    "inverted covering range {}..{}",
                    range.first, range.last
                ));
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(format!(
                        "overlapping covering ranges {}..{} and {}..{}",
                        a.first, a.last, b.first, b.last
                    ));
                }
            }
        }
        for msg in &self.messages {
            if ranges.iter().any(|r| r.contains(msg.id)) {
                return Err(format!("active message {} is covered by a summary", msg.id));
            }
        }
        Ok(())
    }

    /// Rebuild the session, interleaving messages and summaries back into
    /// time order and deriving counters old snapshots lack.
    fn into_session(self) -> Session {
        let mut max_id = 0u64;
        for msg in &self.messages {
            max_id = max_id.max(msg.id.0);
        }
        for summary in &self.compression_meta.summaries {
            max_id = max_id.max(summary.covering_range.last.0);
        }
        for id in &self.compression_meta.pruned_message_ids {
            max_id = max_id.max(id.0);
        }

        let mut log: Vec<LogEntry> = self
            .messages
            .into_iter()
            .map(LogEntry::Message)
            .chain(
                self.compression_meta
                    .summaries
                    .into_iter()
                    .map(LogEntry::Summary),
            )
            .collect();
        log.sort_by_key(LogEntry::order_key);

        let next_message_id = if self.next_message_id > max_id {
            self.next_message_id
        } else {
            max_id + 1
        };
        let total_messages_seen = self.total_messages_seen.max(max_id);

        Session::restore(
            self.id,
            self.created_at,
            self.context_window,
            self.compression_meta.preserve_recent_count,
            log,
            self.token_usage,
            self.threshold_state,
            next_message_id,
            total_messages_seen,
            self.compression_meta.pruned_message_ids,
        )
    }
}
