//! Deterministic fact extraction from message spans.
//!
//! When compaction condenses a span into a summary, the narrative is allowed
//! to be lossy; the structured facts are not. This module scans messages for
//! the signals worth keeping regardless of how the narrative turns out: file
//! paths touched by modifying tools, decision phrases, and per-tool usage
//! tallies. Extraction never depends on a model call, so a failed or
//! timed-out summarization still conserves every fact.

use crate::{ContentBlock, Message};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Tools whose calls count as touching the named file.
const FILE_MODIFYING_TOOLS: &[&str] = &[
    "write_file",
    "edit_file",
    "create_file",
    "apply_patch",
    "move_file",
    "delete_file",
];

/// Phrases that mark a line as recording a decision.
const DECISION_KEYWORDS: &[&str] = &[
    "decided",
    "decision:",
    "we will",
    "going with",
    "chose",
    "switching to",
    "instead of",
];

/// Maximum length of a captured decision line.
const MAX_DECISION_LEN: usize = 200;

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Either a slash-separated path, or a bare filename with a common
        // source/config extension.
        Regex::new(
            r"(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_.-]+|[A-Za-z0-9_-]+\.(?:rs|toml|md|json|ya?ml|txt|py|js|ts|sh|lock)",
        )
        .expect("path regex is valid")
    })
}

/// Structured fields extracted from removed messages. Never silently
/// dropped, even if the narrative is regenerated later.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedFacts {
    /// Files touched by file-modifying tool calls within the span.
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    /// Decision phrases captured from text content, in first-seen order.
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Count of tool calls per tool name within the span.
    #[serde(default)]
    pub tool_tallies: BTreeMap<String, u32>,
}

impl ExtractedFacts {
    pub fn is_empty(&self) -> bool {
        self.files_touched.is_empty() && self.decisions.is_empty() && self.tool_tallies.is_empty()
    }

    /// Fold another fact set into this one. Tallies add; files union;
    /// decisions append without duplicates.
    pub fn merge(&mut self, other: &ExtractedFacts) {
        self.files_touched
            .extend(other.files_touched.iter().cloned());
        for decision in &other.decisions {
            if !self.decisions.contains(decision) {
                self.decisions.push(decision.clone());
            }
        }
        for (tool, count) in &other.tool_tallies {
            *self.tool_tallies.entry(tool.clone()).or_insert(0) += count;
        }
    }

    /// Whether every fact in `other` is present here. Used to verify fact
    /// conservation across compaction.
    pub fn contains_all(&self, other: &ExtractedFacts) -> bool {
        other.files_touched.is_subset(&self.files_touched)
            && other.decisions.iter().all(|d| self.decisions.contains(d))
            && other
                .tool_tallies
                .iter()
                .all(|(tool, count)| self.tool_tallies.get(tool).is_some_and(|c| c >= count))
    }

    /// Human-readable note for injection into a summary's rendered text.
    pub fn render_note(&self) -> String {
        let mut note = String::new();
        if !self.files_touched.is_empty() {
            note.push_str("Files touched:\n");
            for path in &self.files_touched {
                note.push_str(&format!("- {path}\n"));
            }
        }
        if !self.decisions.is_empty() {
            note.push_str("Decisions:\n");
            for decision in &self.decisions {
                note.push_str(&format!("- {decision}\n"));
            }
        }
        if !self.tool_tallies.is_empty() {
            let tallies: Vec<String> = self
                .tool_tallies
                .iter()
                .map(|(tool, count)| format!("{tool} x{count}"))
                .collect();
            note.push_str(&format!("Tool usage: {}\n", tallies.join(", ")));
        }
        note
    }
}

/// Extract all facts from a span of messages.
pub fn extract(messages: &[Message]) -> ExtractedFacts {
    let mut facts = ExtractedFacts::default();
    for msg in messages {
        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => {
                    collect_decisions(text, &mut facts.decisions);
                }
                ContentBlock::ToolCall {
                    tool_name,
                    arguments,
                    ..
                } => {
                    *facts.tool_tallies.entry(tool_name.clone()).or_insert(0) += 1;
                    if FILE_MODIFYING_TOOLS.contains(&tool_name.as_str())
                        && let Some(path) = path_from_args(arguments)
                    {
                        facts.files_touched.insert(path);
                    }
                }
                ContentBlock::ToolResult { .. } => {}
            }
        }
    }
    facts
}

/// Whether a message carries an extractable fact pattern: a modifying tool
/// call, a decision phrase, or a recognizable file path in its text.
pub(crate) fn message_has_facts(msg: &Message) -> bool {
    msg.content.iter().any(|block| match block {
        ContentBlock::Text { text } => {
            let lower = text.to_lowercase();
            DECISION_KEYWORDS.iter().any(|kw| lower.contains(kw)) || path_regex().is_match(text)
        }
        ContentBlock::ToolCall { tool_name, .. } => {
            FILE_MODIFYING_TOOLS.contains(&tool_name.as_str())
        }
        ContentBlock::ToolResult { .. } => false,
    })
}

/// File paths appearing in free text.
pub(crate) fn extract_paths(text: &str) -> Vec<String> {
    path_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Capture decision lines from text, trimmed and capped in length.
fn collect_decisions(text: &str, out: &mut Vec<String>) {
    for line in text.lines() {
        let lower = line.to_lowercase();
        if DECISION_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            let mut captured = line.trim().to_string();
            if captured.len() > MAX_DECISION_LEN {
                let mut cut = MAX_DECISION_LEN;
                while !captured.is_char_boundary(cut) {
                    cut -= 1;
                }
                captured.truncate(cut);
            }
            if !captured.is_empty() && !out.contains(&captured) {
                out.push(captured);
            }
        }
    }
}

/// Extract a file path from JSON tool arguments. Tries common keys.
fn path_from_args(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let obj = value.as_object()?;
    for key in &["path", "file_path", "file", "target"] {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageId, MessageRole};
    use chrono::Utc;

    fn msg(role: MessageRole, blocks: Vec<ContentBlock>) -> Message {
        Message {
            id: MessageId(1),
            role,
            content: blocks,
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn extracts_files_from_modifying_tool_calls() {
        let messages = vec![
            msg(
                MessageRole::Assistant,
                vec![ContentBlock::tool_call(
                    "c1",
                    "edit_file",
                    r#"{"path": "src/main.rs", "old": "a", "new": "b"}"#,
                )],
            ),
            msg(
                MessageRole::Assistant,
                vec![ContentBlock::tool_call(
                    "c2",
                    "read_file",
                    r#"{"path": "src/lib.rs"}"#,
                )],
            ),
        ];

        let facts = extract(&messages);
        // read_file does not modify; only the edit counts as touched.
        assert!(facts.files_touched.contains("src/main.rs"));
        assert!(!facts.files_touched.contains("src/lib.rs"));
        assert_eq!(facts.tool_tallies.get("edit_file"), Some(&1));
        assert_eq!(facts.tool_tallies.get("read_file"), Some(&1));
    }

    #[test]
    fn captures_decision_lines() {
        let messages = vec![msg(
            MessageRole::Assistant,
            vec![ContentBlock::text(
                "Looking at the options.\nDecided to use tokio channels instead of a mutex.\nMoving on.",
            )],
        )];

        let facts = extract(&messages);
        assert_eq!(facts.decisions.len(), 1);
        assert!(facts.decisions[0].contains("tokio channels"));
    }

    #[test]
    fn decision_lines_deduplicate_and_cap() {
        let long_line = format!("decided: {}", "x".repeat(500));
        let text = format!("{long_line}\n{long_line}");
        let messages = vec![msg(MessageRole::User, vec![ContentBlock::text(&text)])];

        let facts = extract(&messages);
        assert_eq!(facts.decisions.len(), 1);
        assert!(facts.decisions[0].len() <= MAX_DECISION_LEN);
    }

    #[test]
    fn tool_tallies_count_every_call() {
        let messages = vec![msg(
            MessageRole::Assistant,
            vec![
                ContentBlock::tool_call("c1", "grep", "{}"),
                ContentBlock::tool_call("c2", "grep", "{}"),
                ContentBlock::tool_call("c3", "shell", "{}"),
            ],
        )];

        let facts = extract(&messages);
        assert_eq!(facts.tool_tallies.get("grep"), Some(&2));
        assert_eq!(facts.tool_tallies.get("shell"), Some(&1));
    }

    #[test]
    fn merge_unions_and_adds() {
        let mut a = ExtractedFacts::default();
        a.files_touched.insert("src/a.rs".into());
        a.decisions.push("decided: use A".into());
        a.tool_tallies.insert("grep".into(), 2);

        let mut b = ExtractedFacts::default();
        b.files_touched.insert("src/b.rs".into());
        b.decisions.push("decided: use A".into()); // duplicate
        b.tool_tallies.insert("grep".into(), 3);

        a.merge(&b);
        assert_eq!(a.files_touched.len(), 2);
        assert_eq!(a.decisions.len(), 1);
        assert_eq!(a.tool_tallies.get("grep"), Some(&5));
    }

    #[test]
    fn contains_all_detects_missing_facts() {
        let mut big = ExtractedFacts::default();
        big.files_touched.insert("src/a.rs".into());
        big.tool_tallies.insert("grep".into(), 5);

        let mut small = ExtractedFacts::default();
        small.files_touched.insert("src/a.rs".into());
        small.tool_tallies.insert("grep".into(), 2);
        assert!(big.contains_all(&small));

        small.files_touched.insert("src/missing.rs".into());
        assert!(!big.contains_all(&small));
    }

    #[test]
    fn message_has_facts_recognizes_paths_and_tools() {
        let with_path = msg(
            MessageRole::User,
            vec![ContentBlock::text("please look at src/store.rs")],
        );
        assert!(message_has_facts(&with_path));

        let with_write = msg(
            MessageRole::Assistant,
            vec![ContentBlock::tool_call("c1", "write_file", "{}")],
        );
        assert!(message_has_facts(&with_write));

        let chatter = msg(MessageRole::Assistant, vec![ContentBlock::text("ok, done")]);
        assert!(!message_has_facts(&chatter));

        let raw_dump = msg(
            MessageRole::ToolResult,
            vec![ContentBlock::tool_result("c1", "shell", "src/a.rs\nsrc/b.rs")],
        );
        // Tool result content alone is not a fact pattern.
        assert!(!message_has_facts(&raw_dump));
    }

    #[test]
    fn extract_paths_from_text() {
        let paths = extract_paths("edited src/compress/mod.rs and Cargo.toml today");
        assert!(paths.contains(&"src/compress/mod.rs".to_string()));
        assert!(paths.contains(&"Cargo.toml".to_string()));
    }

    #[test]
    fn render_note_lists_everything() {
        let mut facts = ExtractedFacts::default();
        facts.files_touched.insert("src/main.rs".into());
        facts.decisions.push("decided: split the module".into());
        facts.tool_tallies.insert("edit_file".into(), 3);

        let note = facts.render_note();
        assert!(note.contains("src/main.rs"));
        assert!(note.contains("split the module"));
        assert!(note.contains("edit_file x3"));
    }

    #[test]
    fn facts_serde_roundtrip() {
        let mut facts = ExtractedFacts::default();
        facts.files_touched.insert("a.rs".into());
        facts.tool_tallies.insert("shell".into(), 1);

        let json = serde_json::to_string(&facts).unwrap();
        let back: ExtractedFacts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, facts);
    }
}
