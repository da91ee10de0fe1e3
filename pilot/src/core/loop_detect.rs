//! Repetition detectors for the sub-agent loop.
//!
//! Each tracker is fed one observation per step and answers with a
//! [`LoopVerdict`]. Trackers escalate at most once: the first detection asks
//! the caller to nudge the model, a detection after that asks it to stop.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

/// What the caller should do after feeding a tracker one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Continue,
    Nudge,
    Stop,
}

/// Sorted multiset of tool names called in one step.
pub type StepPattern = Vec<String>;

/// Build the pattern for one step from the tool names it called.
pub fn step_pattern<'a>(names: impl IntoIterator<Item = &'a str>) -> StepPattern {
    let mut pattern: Vec<String> = names.into_iter().map(str::to_string).collect();
    pattern.sort();
    pattern
}

/// Detects the last `window` steps repeating as whole blocks.
///
/// The tail of the history is cut into `window`-sized blocks; a loop is the
/// last `repeats` blocks being identical, so detection needs at least
/// `window * repeats` steps.
#[derive(Debug, Clone)]
pub struct PatternTracker {
    history: VecDeque<StepPattern>,
    window: usize,
    repeats: usize,
    after_nudge_repeats: usize,
    nudged: bool,
}

impl PatternTracker {
    pub fn new(window: usize, repeats: usize) -> Self {
        let repeats = repeats.max(2);
        Self {
            history: VecDeque::new(),
            window: window.max(1),
            repeats,
            after_nudge_repeats: 2.min(repeats),
            nudged: false,
        }
    }

    pub fn nudged(&self) -> bool {
        self.nudged
    }

    /// Record one step that made at least one tool call.
    pub fn observe(&mut self, pattern: StepPattern) -> LoopVerdict {
        if pattern.is_empty() {
            return LoopVerdict::Continue;
        }
        self.history.push_back(pattern);
        while self.history.len() > self.window * self.repeats {
            self.history.pop_front();
        }
        if !self.is_looping() {
            return LoopVerdict::Continue;
        }
        if self.nudged {
            return LoopVerdict::Stop;
        }
        self.nudged = true;
        self.history.clear();
        self.repeats = self.after_nudge_repeats;
        LoopVerdict::Nudge
    }

    /// Whether the retained history is `repeats` copies of its last block.
    pub fn is_looping(&self) -> bool {
        let span = self.window * self.repeats;
        let n = self.history.len();
        n >= span
            && (n - span..n - self.window)
                .all(|i| self.history[i] == self.history[i + self.window])
    }
}

/// Lowercase, collapse whitespace, keep the first 500 chars, then hash.
pub fn text_fingerprint(text: &str) -> String {
    let normalized: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .chars()
        .take(500)
        .collect();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Detects the same free text (no tool calls) emitted step after step.
#[derive(Debug, Clone)]
pub struct TextRepeatTracker {
    limit: usize,
    last: Option<String>,
    count: usize,
    nudged: bool,
}

impl TextRepeatTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(2),
            last: None,
            count: 0,
            nudged: false,
        }
    }

    /// Record one text-only step.
    pub fn observe(&mut self, text: &str) -> LoopVerdict {
        let fingerprint = text_fingerprint(text);
        if self.last.as_deref() == Some(fingerprint.as_str()) {
            self.count += 1;
        } else {
            self.last = Some(fingerprint);
            self.count = 1;
        }
        if self.count < self.limit {
            return LoopVerdict::Continue;
        }
        if self.nudged {
            return LoopVerdict::Stop;
        }
        self.nudged = true;
        self.count = 0;
        LoopVerdict::Nudge
    }

    /// A step with a tool call breaks any text streak.
    pub fn reset(&mut self) {
        self.last = None;
        self.count = 0;
    }
}

/// Counts consecutive steps that only observed and never acted.
#[derive(Debug, Clone)]
pub struct ObserveStreak {
    limit: usize,
    streak: usize,
    nudged: bool,
}

impl ObserveStreak {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            streak: 0,
            nudged: false,
        }
    }

    pub fn streak(&self) -> usize {
        self.streak
    }

    /// Record a step. Returns `Nudge` once, when the streak first hits the limit.
    pub fn observe(&mut self, observe_only: bool) -> LoopVerdict {
        if !observe_only {
            self.streak = 0;
            return LoopVerdict::Continue;
        }
        self.streak += 1;
        if self.streak >= self.limit && !self.nudged {
            self.nudged = true;
            return LoopVerdict::Nudge;
        }
        LoopVerdict::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(names: &[&str]) -> StepPattern {
        step_pattern(names.iter().copied())
    }

    #[test]
    fn step_pattern_is_order_insensitive() {
        assert_eq!(pat(&["b", "a", "c"]), pat(&["c", "b", "a"]));
    }

    #[test]
    fn identical_steps_nudge_then_stop() {
        let mut tracker = PatternTracker::new(1, 3);
        let step = pat(&["look", "scroll", "read_file"]);
        assert_eq!(tracker.observe(step.clone()), LoopVerdict::Continue);
        assert_eq!(tracker.observe(step.clone()), LoopVerdict::Continue);
        assert_eq!(tracker.observe(step.clone()), LoopVerdict::Nudge);
        assert!(tracker.nudged());
        // Threshold drops to two repeats after the nudge.
        assert_eq!(tracker.observe(step.clone()), LoopVerdict::Continue);
        assert_eq!(tracker.observe(step), LoopVerdict::Stop);
    }

    #[test]
    fn detection_needs_window_times_repeats_steps() {
        let mut tracker = PatternTracker::new(3, 3);
        let step = pat(&["read_file", "read_file", "note"]);
        for _ in 0..8 {
            assert_eq!(tracker.observe(step.clone()), LoopVerdict::Continue);
        }
        assert_eq!(tracker.observe(step.clone()), LoopVerdict::Nudge);
        for _ in 0..5 {
            assert_eq!(tracker.observe(step.clone()), LoopVerdict::Continue);
        }
        assert_eq!(tracker.observe(step), LoopVerdict::Stop);
    }

    #[test]
    fn multi_step_cycle_is_detected() {
        let mut tracker = PatternTracker::new(3, 3);
        let cycle = [pat(&["a"]), pat(&["b"]), pat(&["c"])];
        let mut verdicts = Vec::new();
        for _ in 0..3 {
            for step in &cycle {
                verdicts.push(tracker.observe(step.clone()));
            }
        }
        assert_eq!(verdicts.last(), Some(&LoopVerdict::Nudge));
        assert_eq!(
            verdicts.iter().filter(|v| **v == LoopVerdict::Nudge).count(),
            1
        );
    }

    #[test]
    fn cycle_shorter_than_the_window_is_not_a_block_repeat() {
        let mut tracker = PatternTracker::new(3, 3);
        for _ in 0..6 {
            assert_eq!(tracker.observe(pat(&["a"])), LoopVerdict::Continue);
            assert_eq!(tracker.observe(pat(&["b"])), LoopVerdict::Continue);
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut tracker = PatternTracker::new(2, 3);
        for i in 0..50 {
            let name = format!("tool_{i}");
            tracker.observe(pat(&[name.as_str()]));
        }
        assert_eq!(tracker.history.len(), 6);
    }

    #[test]
    fn varied_steps_do_not_trigger() {
        let mut tracker = PatternTracker::new(3, 3);
        for name in ["a", "b", "a", "c", "b", "a", "d", "c", "a", "b"] {
            assert_eq!(tracker.observe(pat(&[name])), LoopVerdict::Continue);
        }
    }

    #[test]
    fn empty_step_is_ignored() {
        let mut tracker = PatternTracker::new(1, 2);
        assert_eq!(tracker.observe(Vec::new()), LoopVerdict::Continue);
        assert_eq!(tracker.observe(Vec::new()), LoopVerdict::Continue);
        assert!(!tracker.is_looping());
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing() {
        assert_eq!(
            text_fingerprint("Hello   World\n"),
            text_fingerprint("hello world")
        );
        assert_ne!(text_fingerprint("hello"), text_fingerprint("goodbye"));
    }

    #[test]
    fn text_repeat_nudges_then_stops() {
        let mut tracker = TextRepeatTracker::new(3);
        assert_eq!(tracker.observe("same"), LoopVerdict::Continue);
        assert_eq!(tracker.observe("same"), LoopVerdict::Continue);
        assert_eq!(tracker.observe("same"), LoopVerdict::Nudge);
        assert_eq!(tracker.observe("same"), LoopVerdict::Continue);
        assert_eq!(tracker.observe("same"), LoopVerdict::Continue);
        assert_eq!(tracker.observe("same"), LoopVerdict::Stop);
    }

    #[test]
    fn text_repeat_resets_on_tool_step() {
        let mut tracker = TextRepeatTracker::new(2);
        assert_eq!(tracker.observe("x"), LoopVerdict::Continue);
        tracker.reset();
        assert_eq!(tracker.observe("x"), LoopVerdict::Continue);
        assert_eq!(tracker.observe("x"), LoopVerdict::Nudge);
    }

    #[test]
    fn observe_streak_nudges_once() {
        let mut streak = ObserveStreak::new(2);
        assert_eq!(streak.observe(true), LoopVerdict::Continue);
        assert_eq!(streak.observe(true), LoopVerdict::Nudge);
        assert_eq!(streak.observe(true), LoopVerdict::Continue);
        assert_eq!(streak.observe(false), LoopVerdict::Continue);
        assert_eq!(streak.streak(), 0);
    }
}
