//! Conversation history bounding.
//!
//! Two strategies: sub-agents keep every entry but shrink stale tool output
//! ([`compact`]), the planner drops whole entries from the front
//! ([`trim_front`]). Both always keep the first entry, the originating task.

use crate::core::types::{EntryKind, Message, truncate_chars};

pub const TRUNCATION_MARKER: &str = "... [truncated, data already processed]";

/// Thresholds for sub-agent compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Compact only once the history is longer than this.
    pub threshold: usize,
    /// Most recent entries left verbatim.
    pub keep_recent: usize,
    /// Max chars kept from an old tool result.
    pub char_budget: usize,
}

/// Truncate old tool results in place. Returns how many entries were shortened.
///
/// Roles, ordering and entry count never change. Entries tagged
/// [`EntryKind::Note`], the first entry, and the last `keep_recent` entries are
/// left untouched.
pub fn compact(history: &mut [Message], policy: CompactionPolicy) -> usize {
    let len = history.len();
    if len <= policy.threshold {
        return 0;
    }
    let end = len.saturating_sub(policy.keep_recent);
    let mut truncated = 0;
    for entry in history.iter_mut().take(end).skip(1) {
        if !entry.is_tool_result() || entry.kind == EntryKind::Note {
            continue;
        }
        if entry.content.chars().count() <= policy.char_budget
            || entry.content.ends_with(TRUNCATION_MARKER)
        {
            continue;
        }
        let kept = truncate_chars(&entry.content, policy.char_budget).to_string();
        entry.content = format!("{kept}{TRUNCATION_MARKER}");
        truncated += 1;
    }
    truncated
}

/// Drop entries after the first until the history fits in `max_len`.
///
/// Tool results left at the head of the retained tail lose their invocation,
/// so they are dropped too. Returns the number of removed entries.
pub fn trim_front(history: &mut Vec<Message>, max_len: usize) -> usize {
    let max_len = max_len.max(2);
    if history.len() <= max_len {
        return 0;
    }
    let mut drop = history.len() - max_len;
    while 1 + drop < history.len() && history[1 + drop].is_tool_result() {
        drop += 1;
    }
    history.drain(1..1 + drop);
    drop
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Role, ToolInvocation};
    use serde_json::json;

    fn tool_msg(content: &str) -> Message {
        let call = ToolInvocation::new("read_file", json!({"path": "/x"}));
        Message::tool_result(&call, content)
    }

    fn policy() -> CompactionPolicy {
        CompactionPolicy {
            threshold: 4,
            keep_recent: 2,
            char_budget: 5,
        }
    }

    #[test]
    fn below_threshold_is_untouched() {
        let mut history = vec![Message::user("task"), tool_msg("0123456789")];
        let before = history.clone();
        assert_eq!(compact(&mut history, policy()), 0);
        assert_eq!(history, before);
    }

    #[test]
    fn compacts_middle_tool_results_only() {
        let long = "0123456789";
        let mut history = vec![
            Message::user(long),
            tool_msg(long),
            Message::assistant(long, Vec::new()),
            tool_msg(long).with_kind(EntryKind::Note),
            tool_msg(long),
            tool_msg(long),
            tool_msg(long),
        ];
        let before = history.clone();
        let changed = compact(&mut history, policy());
        assert_eq!(changed, 2);
        assert_eq!(history[0], before[0]);
        assert_eq!(history[1].content, format!("01234{TRUNCATION_MARKER}"));
        assert_eq!(history[2], before[2]);
        assert_eq!(history[3], before[3]);
        assert_eq!(history[4].content, format!("01234{TRUNCATION_MARKER}"));
        assert_eq!(&history[5..], &before[5..]);
        assert_eq!(history.len(), before.len());
        // Already compacted entries are not truncated twice.
        assert_eq!(compact(&mut history, policy()), 0);
    }

    #[test]
    fn trim_front_keeps_first_and_drops_orphans() {
        let call = ToolInvocation::new("list_files", json!({"path": "/"}));
        let mut history = vec![
            Message::user("task"),
            Message::assistant("", vec![call.clone()]),
            Message::tool_result(&call, "a"),
            Message::tool_result(&call, "b"),
            Message::assistant("next", Vec::new()),
            Message::user("more"),
        ];
        // Dropping one entry leaves two orphan tool results at the head.
        let removed = trim_front(&mut history, 5);
        assert_eq!(removed, 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "task");
        assert_eq!(history[1].role, Role::Assistant);
        assert!(!history[1].is_tool_result());
    }

    #[test]
    fn trim_front_noop_when_short() {
        let mut history = vec![Message::user("task"), Message::user("hi")];
        assert_eq!(trim_front(&mut history, 80), 0);
        assert_eq!(history.len(), 2);
    }
}
