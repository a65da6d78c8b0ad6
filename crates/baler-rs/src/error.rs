//! Error taxonomy for the compression engine and the session store.
//!
//! Most failure modes in this crate degrade rather than error: a missing
//! provider usage report falls back to estimation, a failed summarization
//! falls back to a placeholder narrative, a failed save leaves the in-memory
//! session untouched. The types here cover the cases that must surface to the
//! caller explicitly.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions from a compression run.
///
/// Everything recoverable (summarizer failure, timeout) is downgraded to a
/// degraded outcome inside the engine; the only hard failure is a context
/// that cannot be made to fit.
#[derive(Debug, Error)]
pub enum CompressError {
    /// After both layers ran, the preserved tail alone still exceeds the
    /// context window (e.g. one gigantic tool result). The caller decides
    /// what to do; silently sending an oversized request is never an option.
    #[error("preserved tail alone exceeds the context window ({tail_tokens} tokens > {context_window} window)")]
    ContextOverflow {
        tail_tokens: u64,
        context_window: u64,
    },
}

/// Failures from the session state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Stored state failed to parse or failed schema validation. The caller
    /// must start a fresh session rather than operate on a partial one.
    #[error("corrupt session file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}
