//! Pure text heuristics used to decide when an agent has actually finished.

/// Phrases that mark a free-text reply as a conclusion rather than chatter.
const CONCLUSION_SIGNALS: &[&str] = &[
    "does not have",
    "doesn't have",
    "no direct",
    "not possible",
    "cannot",
    "can't",
    "unable to",
    "no way to",
    "not available",
    "is not supported",
    "i found that",
    "i've found",
    "here is what",
    "here's what",
    "the result",
    "in summary",
    "in conclusion",
    "to summarize",
    "my findings",
    "there is no",
    "unfortunately",
    "i was unable",
    "i could not",
    "completed the",
    "successfully",
    "here are the",
    "i have completed",
    "task is done",
];

const VAGUE_SUMMARIES: &[&str] = &[
    "done",
    "done.",
    "completed",
    "completed.",
    "task completed",
    "task completed.",
    "task is complete",
    "task is complete.",
];

/// Summaries shorter than this are treated as vague.
const MIN_SPECIFIC_SUMMARY_CHARS: usize = 15;

/// Whether a text-only reply should be accepted as the agent's final answer.
pub fn is_conclusive(text: &str, dispatches: u32, min_chars: usize, min_dispatches: u32) -> bool {
    if dispatches < min_dispatches {
        return false;
    }
    let trimmed = text.trim();
    if trimmed.chars().count() < min_chars {
        return false;
    }
    let lower = trimmed.to_lowercase();
    CONCLUSION_SIGNALS.iter().any(|signal| lower.contains(signal))
}

pub fn is_vague_summary(summary: &str) -> bool {
    let trimmed = summary.trim();
    trimmed.chars().count() < MIN_SPECIFIC_SUMMARY_CHARS
        || VAGUE_SUMMARIES.contains(&trimmed.to_lowercase().as_str())
}

/// A `done` claim is premature with no real work, or with little work and a vague summary.
pub fn is_premature_done(summary: &str, dispatches: u32, min_dispatches: u32) -> bool {
    dispatches == 0 || (dispatches < min_dispatches && is_vague_summary(summary))
}

/// Replies this short carry no answer and are re-prompted.
pub fn is_near_empty(text: &str) -> bool {
    text.trim().chars().count() < 3
}
