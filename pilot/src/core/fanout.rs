//! Selection of which tool calls in one step actually run.

/// How each call of a step is handled, by index into the step's calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FanoutPlan {
    /// Calls to execute, in request order.
    pub run: Vec<usize>,
    /// Calls over the cap; they get a skipped result.
    pub skipped: Vec<usize>,
    /// Terminal calls, never subject to the cap.
    pub terminal: Vec<usize>,
}

/// Apply the parallel fan-out cap.
///
/// The first `cap` non-terminal calls run. If the last observe-class call
/// falls outside that window it takes the final slot, so the agent can still
/// see the effect of its actions.
pub fn plan_fanout(
    names: &[&str],
    cap: usize,
    is_terminal: impl Fn(&str) -> bool,
    is_observe: impl Fn(&str) -> bool,
) -> FanoutPlan {
    let cap = cap.max(1);
    let mut plan = FanoutPlan::default();
    let mut candidates = Vec::new();
    for (idx, name) in names.iter().enumerate() {
        if is_terminal(name) {
            plan.terminal.push(idx);
        } else {
            candidates.push(idx);
        }
    }
    if candidates.len() <= cap {
        plan.run = candidates;
        return plan;
    }

    let mut selected: Vec<usize> = candidates[..cap].to_vec();
    let reserved = candidates[cap..]
        .iter()
        .rev()
        .copied()
        .find(|&idx| is_observe(names[idx]));
    if let Some(observe_idx) = reserved {
        selected.pop();
        selected.push(observe_idx);
    }
    plan.skipped = candidates
        .into_iter()
        .filter(|idx| !selected.contains(idx))
        .collect();
    plan.run = selected;
    plan
}
