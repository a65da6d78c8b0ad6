//! Narrative generation boundary for compaction.
//!
//! Which model (if any) writes the narrative is an external-collaborator
//! choice; the engine only depends on the [`Summarizer`] trait. The built-in
//! [`TemplateSummarizer`] is fully deterministic and never calls out, which
//! makes it both the default and the degradation target: when a model-backed
//! implementation fails or times out, the engine falls back to a placeholder
//! narrative while the deterministic fact extraction keeps everything
//! auditable.

use crate::Message;
use futures::FutureExt;
use futures::future::BoxFuture;

/// Prompt for model-backed summarizer implementations. Instructs the model
/// to produce a concise, factual summary suitable for splicing into a
/// conversation in place of the original span.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- What remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. Every token must earn its place.";

/// Produces the narrative text for a span of messages about to be condensed.
///
/// Implementations may call a model; the engine guards the call with a
/// timeout and treats any `Err` as recoverable.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, Result<String, String>>;
}

/// Deterministic, model-free summarizer.
///
/// Produces a short structural narrative: message counts by role plus a
/// preview of the first user text in the span. Useful as a default, in
/// tests, and wherever a model call is unwanted.
pub struct TemplateSummarizer;

impl Summarizer for TemplateSummarizer {
    fn summarize<'a>(&'a self, messages: &'a [Message]) -> BoxFuture<'a, Result<String, String>> {
        async move { Ok(template_narrative(messages)) }.boxed()
    }
}

/// Build a (system, user) prompt pair for a model-backed summarization call.
pub fn build_summarization_request(messages: &[Message]) -> (String, String) {
    let mut content = String::new();
    for msg in messages {
        content.push_str(&format!("[{}]: {}\n\n", msg.role, msg.render_text()));
    }
    (SUMMARIZATION_PROMPT.to_string(), content)
}

/// The deterministic narrative used by [`TemplateSummarizer`].
pub fn template_narrative(messages: &[Message]) -> String {
    let mut users = 0usize;
    let mut assistants = 0usize;
    let mut tool_results = 0usize;
    for msg in messages {
        match msg.role {
            crate::MessageRole::User => users += 1,
            crate::MessageRole::Assistant => assistants += 1,
            crate::MessageRole::ToolResult => tool_results += 1,
            crate::MessageRole::System => {}
        }
    }

    let preview = messages
        .iter()
        .find(|m| m.role == crate::MessageRole::User)
        .map(|m| {
            let text = m.text();
            let preview: String = text.chars().take(120).collect();
            format!(" Opening request: {preview}")
        })
        .unwrap_or_default();

    format!(
        "Condensed {} earlier message(s): {users} user, {assistants} assistant, {tool_results} tool result(s).{preview}",
        messages.len(),
    )
}

/// Placeholder narrative used when summarization fails or times out.
/// Structured facts are extracted separately and survive regardless.
pub(crate) fn fallback_narrative(messages: &[Message]) -> String {
    format!(
        "[Condensed without narrative: {} message(s) removed; see extracted facts]",
        messages.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentBlock, MessageId, MessageRole};
    use chrono::Utc;

    fn msg(id: u64, role: MessageRole, text: &str) -> Message {
        Message {
            id: MessageId(id),
            role,
            content: vec![ContentBlock::text(text)],
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn template_summarizer_counts_roles() {
        let messages = vec![
            msg(1, MessageRole::User, "fix the failing test"),
            msg(2, MessageRole::Assistant, "on it"),
            msg(3, MessageRole::ToolResult, "test output"),
        ];

        let narrative = TemplateSummarizer.summarize(&messages).await.unwrap();
        assert!(narrative.contains("3 earlier message(s)"));
        assert!(narrative.contains("1 user"));
        assert!(narrative.contains("fix the failing test"));
    }

    #[test]
    fn build_request_formats_every_message() {
        let messages = vec![
            msg(1, MessageRole::User, "Read file src/main.rs"),
            msg(2, MessageRole::Assistant, "reading now"),
        ];

        let (system, user) = build_summarization_request(&messages);
        assert!(system.contains("Summarize"));
        assert!(user.contains("[user]: Read file src/main.rs"));
        assert!(user.contains("[assistant]: reading now"));
    }

    #[test]
    fn fallback_mentions_message_count() {
        let messages = vec![
            msg(1, MessageRole::User, "a"),
            msg(2, MessageRole::Assistant, "b"),
        ];
        let narrative = fallback_narrative(&messages);
        assert!(narrative.contains("2 message(s)"));
        assert!(narrative.contains("extracted facts"));
    }

    #[test]
    fn template_preview_truncates_long_requests() {
        let long = "x".repeat(500);
        let messages = vec![msg(1, MessageRole::User, &long)];
        let narrative = template_narrative(&messages);
        assert!(narrative.len() < 300);
    }
}
