//! Supervised sub-agent loop.
//!
//! A deployment runs its own think/act loop over a tool subset until the
//! agent reports `done` or `stuck`, or a guard force-stops it. Guards are
//! checked every step: fan-out cap, dispatch budget, repeated tool patterns,
//! repeated free text, observation-only streaks, plus context compaction.

use std::collections::VecDeque;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::agents::AgentProfile;
use crate::cancel::StopSignal;
use crate::core::budget::{DispatchBudget, remaining_budget};
use crate::core::compaction::compact;
use crate::core::fanout::plan_fanout;
use crate::core::heuristics::{is_conclusive, is_premature_done};
use crate::core::loop_detect::{
    LoopVerdict, ObserveStreak, PatternTracker, TextRepeatTracker, step_pattern,
};
use crate::core::types::{
    AgentKind, DeploymentStatus, EntryKind, Message, ToolInvocation, ToolResult, truncate_chars,
};
use crate::events::EventSink;
use crate::io::config::SubAgentLimits;
use crate::io::prompt::{PromptEngine, SubAgentPrompt};
use crate::llm::{LlmBackend, LlmRequest};
use crate::tools::control::{self, DONE, NOTE, STUCK};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::{ToolCategory, ToolSpec};

const PARTIAL_RESULTS: usize = 5;
const PARTIAL_RESULT_CHARS: usize = 300;

/// Why a deployment was force-stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceStopReason {
    StepCeiling,
    DispatchBudget,
    ToolLoop,
    TextLoop,
    Deadline,
    Stopped,
    ModelError,
}

impl ForceStopReason {
    /// Guards that stop an agent that was working, as opposed to one that failed.
    pub fn is_work_guard(self) -> bool {
        matches!(self, Self::DispatchBudget | Self::ToolLoop | Self::TextLoop)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::StepCeiling => "step limit reached",
            Self::DispatchBudget => "tool call budget exhausted",
            Self::ToolLoop => "repeated the same tool calls after being warned",
            Self::TextLoop => "repeated the same reply without calling tools",
            Self::Deadline => "time limit reached",
            Self::Stopped => "stopped by operator",
            Self::ModelError => "model request failed",
        }
    }
}

impl fmt::Display for ForceStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A finding saved by the agent (or by the runner when force-stopping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deployment {
    pub agent_kind: AgentKind,
    pub task_text: String,
    pub budget_used: u32,
    pub budget_max: u32,
    pub status: DeploymentStatus,
    pub notes: Vec<Note>,
    pub steps: u32,
}

impl Deployment {
    fn new(kind: AgentKind, task: &str, budget_max: u32) -> Self {
        Self {
            agent_kind: kind,
            task_text: task.to_string(),
            budget_used: 0,
            budget_max,
            status: DeploymentStatus::Running,
            notes: Vec::new(),
            steps: 0,
        }
    }

    /// Insert or overwrite a note by key.
    pub fn save_note(&mut self, key: &str, value: &str) {
        match self.notes.iter_mut().find(|note| note.key == key) {
            Some(note) => note.value = value.to_string(),
            None => self.notes.push(Note {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Final outcome of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentReport {
    pub deployment: Deployment,
    /// `done` summary, `stuck` reason, or the force-stop description.
    pub summary: String,
    pub stop_reason: Option<ForceStopReason>,
    /// Most recent successful tool outputs, oldest first.
    pub partial_results: Vec<String>,
}

impl SubAgentReport {
    pub fn status(&self) -> DeploymentStatus {
        self.deployment.status
    }

    pub fn is_success(&self) -> bool {
        match self.deployment.status {
            DeploymentStatus::Done => true,
            DeploymentStatus::ForceStopped => {
                self.stop_reason.is_some_and(ForceStopReason::is_work_guard)
            }
            DeploymentStatus::Stuck | DeploymentStatus::Running => false,
        }
    }

    fn render_findings(&self) -> String {
        let mut out = String::new();
        if !self.deployment.notes.is_empty() {
            out.push_str("\nNotes:");
            for note in &self.deployment.notes {
                out.push_str(&format!("\n- {}: {}", note.key, note.value));
            }
        }
        if !self.partial_results.is_empty() {
            out.push_str("\nRecent results:");
            for result in &self.partial_results {
                out.push_str(&format!("\n- {result}"));
            }
        }
        out
    }

    /// Result handed back to the planner for the deploy call.
    pub fn to_tool_result(&self) -> ToolResult {
        let kind = self.deployment.agent_kind;
        let used = self.deployment.budget_used;
        let content = match self.deployment.status {
            DeploymentStatus::Done => format!("{kind} agent finished: {}", self.summary),
            DeploymentStatus::Stuck => format!("{kind} agent is stuck: {}", self.summary),
            DeploymentStatus::ForceStopped | DeploymentStatus::Running => format!(
                "{kind} agent was stopped ({}) after {used} tool calls.",
                self.summary
            ),
        };
        let content = format!("{content}{}", self.render_findings());
        if self.is_success() {
            ToolResult::ok(content)
        } else {
            ToolResult::failure(content)
        }
    }
}

enum StepOutcome {
    Continue,
    Finished(DeploymentStatus, String),
    ForceStop(ForceStopReason),
}

/// Everything one loop needs, borrowed from the planner.
pub struct SubAgentRunner<'a> {
    pub llm: &'a dyn LlmBackend,
    pub dispatcher: &'a Dispatcher,
    pub events: &'a EventSink,
    pub prompts: &'a PromptEngine,
    pub limits: &'a SubAgentLimits,
    pub stop: &'a StopSignal,
    pub max_tokens: u32,
}

struct AgentState {
    profile: AgentProfile,
    deployment: Deployment,
    history: Vec<Message>,
    budget: DispatchBudget,
    patterns: PatternTracker,
    texts: TextRepeatTracker,
    observe: ObserveStreak,
    dispatches: u32,
    partial: VecDeque<String>,
}

impl AgentState {
    fn remember(&mut self, tool: &str, result: &ToolResult) {
        if !result.success {
            return;
        }
        if self.partial.len() == PARTIAL_RESULTS {
            self.partial.pop_front();
        }
        self.partial.push_back(format!(
            "{tool}: {}",
            truncate_chars(result.content.trim(), PARTIAL_RESULT_CHARS)
        ));
    }
}

impl SubAgentRunner<'_> {
    fn tool_specs(&self, profile: &AgentProfile) -> Vec<ToolSpec> {
        let mut specs = self
            .dispatcher
            .registry()
            .specs_for(&profile.tools);
        specs.extend(control::subagent_specs());
        specs
    }

    #[instrument(skip_all, fields(kind = %kind))]
    pub fn run(&self, kind: AgentKind, task: &str) -> Result<SubAgentReport> {
        let profile = AgentProfile::for_kind(kind);
        let specs = self.tool_specs(&profile);
        let system = self.prompts.subagent(&SubAgentPrompt {
            kind: kind.as_str(),
            role: profile.role,
            tools: &specs,
            observe_tools: profile.tools_in(ToolCategory::Observe),
            act_tools: profile.tools_in(ToolCategory::Act),
            soft_budget: self.limits.soft_dispatch_budget,
            hard_budget: self.limits.hard_dispatch_budget,
        })?;

        let mut state = AgentState {
            deployment: Deployment::new(kind, task, self.limits.hard_dispatch_budget),
            history: vec![Message::user(task)],
            budget: DispatchBudget::new(
                self.limits.soft_dispatch_budget,
                self.limits.hard_dispatch_budget,
            ),
            patterns: PatternTracker::new(self.limits.loop_window, self.limits.loop_repeats),
            texts: TextRepeatTracker::new(self.limits.text_repeat_limit),
            observe: ObserveStreak::new(self.limits.observe_streak_limit),
            dispatches: 0,
            partial: VecDeque::new(),
            profile,
        };
        self.events
            .emit("agent_started", json!({"kind": kind, "task": task}));
        info!(budget = state.budget.max(), "sub-agent started");

        let deadline = Instant::now() + Duration::from_secs(self.limits.timeout_secs);
        let mut outcome = StepOutcome::Continue;
        for step in 1..=self.limits.max_steps {
            state.deployment.steps = step;
            let step_outcome = if self.stop.is_stopped() {
                StepOutcome::ForceStop(ForceStopReason::Stopped)
            } else if remaining_budget(deadline).is_err() {
                StepOutcome::ForceStop(ForceStopReason::Deadline)
            } else {
                self.step(&mut state, &system, &specs, step)
            };
            if !matches!(step_outcome, StepOutcome::Continue) {
                outcome = step_outcome;
                break;
            }
        }

        Ok(self.finish(state, outcome))
    }

    fn step(&self, state: &mut AgentState, system: &str, specs: &[ToolSpec], step: u32) -> StepOutcome {
        let kind = state.deployment.agent_kind;
        let compacted = compact(&mut state.history, self.limits.compaction());
        if compacted > 0 {
            debug!(compacted, "compacted sub-agent history");
        }
        self.events.emit(
            "agent_step",
            json!({"kind": kind, "step": step, "budget_used": state.budget.used()}),
        );

        let response = match self.llm.complete(&LlmRequest {
            system,
            messages: &state.history,
            tools: specs,
            max_tokens: self.max_tokens,
        }) {
            Ok(response) => response,
            Err(err) => {
                warn!(err = %err, "sub-agent model call failed");
                state.deployment.save_note("model_error", &err.to_string());
                return StepOutcome::ForceStop(ForceStopReason::ModelError);
            }
        };
        state
            .history
            .push(Message::assistant(response.text.clone(), response.tool_calls.clone()));

        if response.tool_calls.is_empty() {
            return self.text_step(state, &response.text, step);
        }
        state.texts.reset();
        self.tool_step(state, &response.tool_calls, step)
    }

    fn text_step(&self, state: &mut AgentState, text: &str, step: u32) -> StepOutcome {
        if is_conclusive(
            text,
            state.dispatches,
            self.limits.conclusion_min_chars,
            self.limits.min_dispatches_for_text_conclusion,
        ) {
            return StepOutcome::Finished(DeploymentStatus::Done, text.trim().to_string());
        }
        match state.texts.observe(text) {
            LoopVerdict::Stop => StepOutcome::ForceStop(ForceStopReason::TextLoop),
            LoopVerdict::Nudge => {
                self.nudge(
                    state,
                    step,
                    "text_loop",
                    "You keep sending the same reply without calling a tool. Either call `done` \
                     with your findings now or call the next tool that makes progress.",
                );
                StepOutcome::Continue
            }
            LoopVerdict::Continue => {
                state.history.push(Message::user(
                    "Continue by calling a tool, or finish with `done` or `stuck`.",
                ));
                StepOutcome::Continue
            }
        }
    }

    fn tool_step(&self, state: &mut AgentState, calls: &[ToolInvocation], step: u32) -> StepOutcome {
        let names: Vec<&str> = calls.iter().map(|call| call.name.as_str()).collect();
        let plan = plan_fanout(
            &names,
            self.limits.max_parallel_tools,
            control::is_subagent_terminal,
            |name| state.profile.is_observe(name),
        );

        let mut results: Vec<Option<(ToolResult, EntryKind)>> = vec![None; calls.len()];
        for &idx in &plan.skipped {
            results[idx] = Some((
                ToolResult::failure(format!(
                    "SKIPPED: at most {} tool calls run per step. Call it again next step if still needed.",
                    self.limits.max_parallel_tools
                )),
                EntryKind::Plain,
            ));
        }

        let mut to_dispatch = Vec::new();
        for &idx in &plan.run {
            let call = &calls[idx];
            let is_note = call.name == NOTE;
            if !is_note && !state.profile.has_tool(&call.name) {
                results[idx] = Some((
                    ToolResult::failure(format!(
                        "tool {} is not available to the {} agent",
                        call.name, state.deployment.agent_kind
                    )),
                    EntryKind::Plain,
                ));
                continue;
            }
            if !state.budget.try_consume() {
                results[idx] = Some((
                    ToolResult::failure("SKIPPED: tool call budget exhausted"),
                    EntryKind::Plain,
                ));
                continue;
            }
            state.dispatches += 1;
            if is_note {
                let key = call.str_arg("key").unwrap_or("note");
                let value = call.str_arg("value").unwrap_or_default();
                state.deployment.save_note(key, value);
                results[idx] = Some((ToolResult::ok(format!("Saved note {key:?}.")), EntryKind::Note));
            } else {
                to_dispatch.push(idx);
            }
        }

        let dispatched = self.dispatch_all(&state.profile, calls, &to_dispatch);
        for (idx, result) in to_dispatch.iter().copied().zip(dispatched) {
            state.remember(&calls[idx].name, &result);
            results[idx] = Some((result, EntryKind::Plain));
        }
        state.deployment.budget_used = state.budget.used();

        let mut finished = None;
        for &idx in &plan.terminal {
            let call = &calls[idx];
            let result = if finished.is_some() {
                ToolResult::failure("ignored: the deployment already ended this step")
            } else if call.name == DONE {
                let summary = call.str_arg("summary").unwrap_or_default();
                if is_premature_done(summary, state.dispatches, self.limits.min_dispatches_for_done) {
                    ToolResult::failure(
                        "Rejected: you have not done enough verifiable work yet. Use your tools, \
                         then call `done` with a specific summary of what you found or changed.",
                    )
                } else {
                    finished = Some((DeploymentStatus::Done, summary.trim().to_string()));
                    ToolResult::ok("Reported done.")
                }
            } else if call.name == STUCK {
                let reason = call.str_arg("reason").unwrap_or_default();
                if step < self.limits.min_steps_before_stuck {
                    ToolResult::failure(
                        "Rejected: it is too early to give up. Explore at least one alternative approach first.",
                    )
                } else {
                    finished = Some((DeploymentStatus::Stuck, reason.trim().to_string()));
                    ToolResult::ok("Reported stuck.")
                }
            } else {
                ToolResult::failure(format!("unknown tool: {}", call.name))
            };
            results[idx] = Some((result, EntryKind::Plain));
        }

        for (call, slot) in calls.iter().zip(results) {
            let (result, entry_kind) = slot.unwrap_or_else(|| {
                (ToolResult::failure("no result produced"), EntryKind::Plain)
            });
            let content = result.to_message_content();
            let content = truncate_chars(&content, self.limits.max_tool_result_chars);
            state
                .history
                .push(Message::tool_result(call, content).with_kind(entry_kind));
        }

        if let Some((status, summary)) = finished {
            return StepOutcome::Finished(status, summary);
        }
        if state.budget.is_exhausted() {
            return StepOutcome::ForceStop(ForceStopReason::DispatchBudget);
        }
        if state.budget.take_soft_warning() {
            let text = format!(
                "You have used {} of {} tool calls. Wrap up now: save key findings with `note` \
                 and call `done` with what you have.",
                state.budget.used(),
                state.budget.max()
            );
            self.nudge(state, step, "budget", &text);
        }

        let ran: Vec<&str> = plan.run.iter().map(|&idx| names[idx]).collect();
        match state.patterns.observe(step_pattern(ran.iter().copied())) {
            LoopVerdict::Stop => return StepOutcome::ForceStop(ForceStopReason::ToolLoop),
            LoopVerdict::Nudge => self.nudge(
                state,
                step,
                "tool_loop",
                "You are repeating the same tool calls without progress. Stop and change \
                 approach, or call `done`/`stuck` with what you know.",
            ),
            LoopVerdict::Continue => {}
        }

        if state.profile.mixes_observe_and_act() && !ran.is_empty() {
            let observe_only = ran
                .iter()
                .all(|name| *name == NOTE || state.profile.is_observe(name));
            if state.observe.observe(observe_only) == LoopVerdict::Nudge {
                let text = format!(
                    "You have only observed for {} steps. Act on what you know, \
                     conclude with `done`, or change approach.",
                    state.observe.streak()
                );
                self.nudge(state, step, "observe_streak", &text);
            }
        }
        StepOutcome::Continue
    }

    fn dispatch_all(
        &self,
        profile: &AgentProfile,
        calls: &[ToolInvocation],
        indices: &[usize],
    ) -> Vec<ToolResult> {
        let dispatcher = self.dispatcher;
        if !profile.parallel_safe || indices.len() < 2 {
            return indices
                .iter()
                .map(|&idx| dispatcher.dispatch(&calls[idx]))
                .collect();
        }
        thread::scope(|scope| {
            let handles: Vec<_> = indices
                .iter()
                .map(|&idx| {
                    let call = &calls[idx];
                    scope.spawn(move || dispatcher.dispatch(call))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| ToolResult::failure("dispatch thread panicked"))
                })
                .collect()
        })
    }

    fn nudge(&self, state: &mut AgentState, step: u32, reason: &str, text: &str) {
        debug!(reason, step, "nudging sub-agent");
        self.events.emit(
            "agent_nudge",
            json!({"kind": state.deployment.agent_kind, "reason": reason, "step": step}),
        );
        state.history.push(Message::user(text));
    }

    fn finish(&self, mut state: AgentState, outcome: StepOutcome) -> SubAgentReport {
        state.deployment.budget_used = state.budget.used();
        let (status, summary, stop_reason) = match outcome {
            StepOutcome::Finished(status, summary) => (status, summary, None),
            StepOutcome::ForceStop(reason) => force_stop(&mut state, reason),
            StepOutcome::Continue => force_stop(&mut state, ForceStopReason::StepCeiling),
        };
        state.deployment.status = status;
        info!(
            status = ?status,
            steps = state.deployment.steps,
            budget_used = state.deployment.budget_used,
            "sub-agent finished"
        );
        self.events.emit(
            "agent_completed",
            json!({
                "kind": state.deployment.agent_kind,
                "status": status,
                "steps": state.deployment.steps,
                "budget_used": state.deployment.budget_used,
                "reason": stop_reason,
            }),
        );
        SubAgentReport {
            deployment: state.deployment,
            summary,
            stop_reason,
            partial_results: state.partial.into_iter().collect(),
        }
    }
}

/// Record why the agent stopped and its latest result as notes.
fn force_stop(
    state: &mut AgentState,
    reason: ForceStopReason,
) -> (DeploymentStatus, String, Option<ForceStopReason>) {
    state.deployment.save_note("stopped", reason.describe());
    if let Some(last) = state.partial.back().cloned() {
        state.deployment.save_note("last_result", &last);
    }
    (
        DeploymentStatus::ForceStopped,
        reason.describe().to_string(),
        Some(reason),
    )
}
