//! Convenience re-exports for common `baler-rs` types.
//!
//! Meant to be glob-imported by agent loops:
//!
//! ```ignore
//! use baler_rs::prelude::*;
//! ```
//!
//! This pulls in the types needed for the typical turn cycle: the
//! [`Session`] and message constructors, the [`CompressionEngine`] with its
//! config and outcome, the threshold [`Decision`], event handling, and the
//! [`SessionStore`]. Specialized pieces (fact extraction internals, the raw
//! ledger, prompt-building helpers) are intentionally excluded — import
//! those from their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ContentBlock, Message, MessageId, MessageRole};

// ── Session and log ─────────────────────────────────────────────────
pub use crate::session::{ContextStats, LogEntry, PromptMessage, Session, Summary};

// ── Compression ─────────────────────────────────────────────────────
pub use crate::compress::summarize::{Summarizer, TemplateSummarizer};
pub use crate::compress::{CompressionConfig, CompressionEngine, CompressionOutcome};
pub use crate::policy::{Decision, ThresholdConfig};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeHandler, ContextEvent, ContextEventHandler, FnHandler, LoggingHandler, NoopHandler,
    Notifier,
};

// ── Persistence and errors ──────────────────────────────────────────
pub use crate::error::{CompressError, StoreError};
pub use crate::store::SessionStore;
