//! Context-budget management for LLM coding agents.
//!
//! A coding agent's conversation log grows without bound while the model's
//! context window does not. `baler-rs` is the core that keeps the two
//! reconciled. It tracks token consumption from provider usage reports,
//! decides when the log must shrink, and shrinks it in two layers: cheap
//! importance-scored pruning of low-value messages, then compaction of the
//! oldest spans into structured summaries that preserve files touched,
//! decisions made, and tool-usage tallies even when the narrative is lossy.
//!
//! This crate is a library consumed in-process. It owns no network protocol
//! and renders no UI; the agent loop, tool executor, and provider client are
//! external collaborators that talk to it through [`Session`],
//! [`CompressionEngine`](compress::CompressionEngine), and
//! [`SessionStore`](store::SessionStore).
//!
//! # Where to find things
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`ledger`] | Cumulative token accounting, estimate fallback, usage percent |
//! | [`policy`] | Pure warn/compact threshold decision, edge-triggered warnings |
//! | [`compress`] | Two-layer compression engine: pruning, compaction, summarization |
//! | [`events`] | Compaction lifecycle events and the observer list |
//! | [`session`] | The active log, summaries, stats, fork semantics |
//! | [`store`] | Atomic JSON persistence with schema validation on load |
//!
//! # A turn, end to end
//!
//! ```ignore
//! use baler_rs::prelude::*;
//!
//! let mut session = Session::new("sess-1").with_context_window(128_000);
//! let engine = CompressionEngine::new(
//!     CompressionConfig::default(),
//!     Notifier::new().with(LoggingHandler),
//! );
//!
//! // The agent loop appends what the collaborators produced...
//! session.append(MessageRole::User, vec![ContentBlock::text("fix the bug")]);
//! session.record_usage(900, 150);
//!
//! // ...then asks the engine what to do before the next model call.
//! if engine.evaluate(&mut session) == Decision::Compact {
//!     let outcome = engine.compress(&mut session, &TemplateSummarizer).await?;
//!     println!("reclaimed {} tokens", outcome.tokens_reclaimed());
//! }
//!
//! let prompt = session.render_request(); // exact ordered list for the model
//! store.save(&session)?;
//! ```

pub mod compress;
pub mod error;
pub mod events;
pub mod ledger;
pub mod policy;
pub mod prelude;
pub mod session;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use compress::facts::ExtractedFacts;
pub use compress::summarize::{Summarizer, TemplateSummarizer};
pub use compress::{CompressionConfig, CompressionEngine, CompressionOutcome};
pub use error::{CompressError, StoreError};
pub use events::{ContextEvent, ContextEventHandler, LoggingHandler, Notifier};
pub use ledger::{DEFAULT_CHARS_PER_TOKEN, TokenLedger, TokenUsage};
pub use policy::{Decision, ThresholdConfig, ThresholdState};
pub use session::{ContextStats, CoveringRange, LogEntry, PromptMessage, Session, Summary};
pub use store::SessionStore;

// ── Message types ──────────────────────────────────────────────────

/// Unique, monotonically ordered message identity within a session.
///
/// Ids start at 1 and never repeat, even across compaction: a summarized or
/// pruned message's id is retired, not recycled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    ToolResult,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::ToolResult => write!(f, "tool_result"),
        }
    }
}

/// One block of message content.
///
/// Content is opaque to this core beyond size and fact extraction, but it is
/// a tagged union rather than a bag of JSON so that importance scoring and
/// fact extraction can pattern-match exhaustively.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text produced by the user or the model.
    Text { text: String },
    /// A tool invocation requested by the model. `arguments` is the raw JSON
    /// argument string as the provider delivered it.
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: String,
    },
    /// The result of a tool invocation, paired to its call by `call_id`.
    ToolResult {
        call_id: String,
        tool_name: String,
        output: String,
    },
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Convenience constructor for a tool call block.
    pub fn tool_call(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        ContentBlock::ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments: arguments.into(),
        }
    }

    /// Convenience constructor for a tool result block.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        ContentBlock::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
        }
    }

    /// Approximate character count of the block, used for token estimation.
    pub fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolCall {
                tool_name,
                arguments,
                ..
            } => tool_name.len() + arguments.len(),
            ContentBlock::ToolResult { output, .. } => output.len(),
        }
    }
}

/// One turn unit in the conversation log.
///
/// Messages are never mutated in place. Compaction replaces a contiguous
/// range of messages with a [`Summary`]; it never edits message content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    /// Set when the message is produced or first measured; immutable after.
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    /// Render all blocks into the flat text handed to the model.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if !out.is_empty() {
                out.push('\n');
            }
            match block {
                ContentBlock::Text { text } => out.push_str(text),
                ContentBlock::ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                } => out.push_str(&format!("[tool call {call_id}: {tool_name}({arguments})]")),
                ContentBlock::ToolResult { output, .. } => out.push_str(output),
            }
        }
        out
    }

    /// Total character count across blocks.
    pub fn char_len(&self) -> usize {
        self.content.iter().map(ContentBlock::char_len).sum()
    }

    /// Call ids of every `ToolCall` block in this message.
    pub fn tool_call_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolCall { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }

    /// Call ids of every `ToolResult` block in this message.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }

    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}
