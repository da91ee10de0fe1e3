//! Orchestrator loop: converse with the model, dispatch its tool calls, and
//! fold the results back until the task reaches a terminal state.
//!
//! One [`Planner`] handles one task at a time. Each task starts a fresh
//! history whose first entry is the task itself; longer histories are trimmed
//! from the front. Every tool call gets exactly one result appended before the
//! next model request. Failed results pass through the fix registry, which may
//! attach a known fix.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentProfile, Deployments, SubAgentRunner};
use crate::cancel::StopSignal;
use crate::core::compaction::trim_front;
use crate::core::heuristics::is_near_empty;
use crate::core::signature::{normalize, registry_key};
use crate::core::types::{
    AgentKind, Message, Task, TaskStatus, ToolInvocation, ToolResult, truncate_chars,
};
use crate::events::EventSink;
use crate::fix_registry::FixRegistry;
use crate::io::config::{PilotConfig, PlannerConfig, SafetyConfig, SubAgentLimits};
use crate::io::prompt::{AgentLine, PlannerPrompt, PromptEngine};
use crate::llm::{LlmBackend, LlmRequest};
use crate::tools::control::{self, TASK_DONE};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::{ToolId, ToolSpec};

const RECENT_RESULTS: usize = 3;
const RECENT_RESULT_CHARS: usize = 200;
/// Errors seen at least this often are listed with each new task.
const WARNING_MIN_OCCURRENCES: u64 = 3;
const WARNING_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannerOutcome {
    pub response: String,
    pub complete: bool,
    pub turns: u32,
}

/// Shared collaborators handed to the planner at startup.
#[derive(Clone)]
pub struct PlannerDeps {
    pub llm: Arc<dyn LlmBackend>,
    pub dispatcher: Arc<Dispatcher>,
    pub fixes: Arc<FixRegistry>,
    pub events: Arc<EventSink>,
    pub stop: StopSignal,
}

/// Failure bookkeeping for the task in progress.
#[derive(Default)]
struct TaskLedger {
    last_failure: Option<String>,
    consecutive: u32,
    /// Registry keys whose fix was surfaced during this task.
    surfaced: HashSet<String>,
    /// Last failure per tool, for learning a fix from a later success.
    pending: HashMap<String, (String, Value)>,
    last_text: Option<String>,
    recent: VecDeque<String>,
}

pub struct Planner {
    deps: PlannerDeps,
    planner: PlannerConfig,
    safety: SafetyConfig,
    subagent: SubAgentLimits,
    max_tokens: u32,
    prompts: PromptEngine,
    system: String,
    tools: Vec<ToolSpec>,
    history: Vec<Message>,
    active: Option<Task>,
    deployments: Deployments,
}

impl Planner {
    pub fn new(deps: PlannerDeps, config: &PilotConfig) -> Result<Self> {
        let prompts = PromptEngine::new()?;
        let registry = deps.dispatcher.registry();

        let deployable: Vec<AgentProfile> = AgentKind::ALL
            .into_iter()
            .map(AgentProfile::for_kind)
            .filter(|profile| {
                profile
                    .tools
                    .iter()
                    .any(|id| *id != ToolId::Think && registry.contains(*id))
            })
            .collect();

        let mut tools = registry.specs();
        tools.extend(
            deployable
                .iter()
                .map(|profile| control::deploy_spec(profile.kind, profile.summary)),
        );
        tools.extend(control::planner_terminal_specs());

        let agents = deployable
            .iter()
            .map(|profile| AgentLine {
                tool: profile.kind.deploy_tool(),
                description: profile.summary.to_string(),
            })
            .collect();
        let system = prompts.planner(&PlannerPrompt {
            tools: &tools,
            agents,
            max_deployments: config.safety.max_deployments,
        })?;

        Ok(Self {
            deps,
            planner: config.planner.clone(),
            safety: config.safety.clone(),
            subagent: config.subagent.clone(),
            max_tokens: config.llm.max_tokens,
            prompts,
            system,
            tools,
            history: Vec::new(),
            active: None,
            deployments: Deployments::new(config.safety.max_deployments),
        })
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn active_task(&self) -> Option<&Task> {
        self.active.as_ref()
    }

    /// Run one task to a terminal state.
    #[instrument(skip_all, fields(task_id = %task.id, source = %task.source))]
    pub fn think(&mut self, mut task: Task) -> PlannerOutcome {
        if let Some(previous) = self.active.as_mut()
            && !previous.is_terminal()
        {
            previous.finish(TaskStatus::Completed);
        }
        task.status = TaskStatus::Active;
        self.deps.llm.begin_task(&task.text);
        self.deployments.reset();
        self.deps.events.emit(
            "task_started",
            json!({"task_id": task.id, "source": task.source, "text": task.text}),
        );
        info!("task started");

        let mut content = truncate_chars(&task.text, self.planner.max_task_chars).to_string();
        if let Some(warning) = self.error_warning() {
            content.push_str("\n\n[Recurring errors from earlier tasks]\n");
            content.push_str(&warning);
        }
        self.history = vec![Message::user(content)];
        let task_id = task.id;
        self.active = Some(task);

        let mut ledger = TaskLedger::default();
        let (outcome, status) = self.run_turns(&mut ledger);

        if let Some(task) = self.active.as_mut() {
            task.finish(status);
        }
        if !outcome.complete {
            self.deps.events.emit(
                "task_incomplete",
                json!({"task_id": task_id, "reason": outcome.response, "turns": outcome.turns}),
            );
        }
        self.deps.events.emit(
            "task_finished",
            json!({"task_id": task_id, "complete": outcome.complete, "turns": outcome.turns}),
        );
        info!(complete = outcome.complete, turns = outcome.turns, "task finished");
        outcome
    }

    fn run_turns(&mut self, ledger: &mut TaskLedger) -> (PlannerOutcome, TaskStatus) {
        let mut turns = 0;
        let mut empty_retries = 0;
        let mut tool_turns = 0;
        loop {
            if self.deps.stop.is_stopped() {
                return (incomplete("stopped by operator", turns), TaskStatus::Failed);
            }
            if turns >= self.planner.max_turns {
                warn!(turns, "turn limit reached");
                let partial = best_partial(ledger);
                return (
                    incomplete(format!("Turn limit reached. {partial}"), turns),
                    TaskStatus::Failed,
                );
            }
            turns += 1;

            let dropped = trim_front(&mut self.history, self.planner.max_history_messages);
            if dropped > 0 {
                debug!(dropped, "trimmed planner history");
            }
            let response = match self.deps.llm.complete(&LlmRequest {
                system: &self.system,
                messages: &self.history,
                tools: &self.tools,
                max_tokens: self.max_tokens,
            }) {
                Ok(response) => response,
                Err(err) => {
                    warn!(err = %err, "planner model call failed");
                    let partial = best_partial(ledger);
                    return (
                        incomplete(format!("Model unavailable: {err}. {partial}"), turns),
                        TaskStatus::Failed,
                    );
                }
            };
            self.history.push(Message::assistant(
                response.text.clone(),
                response.tool_calls.clone(),
            ));
            if !is_near_empty(&response.text) {
                ledger.last_text = Some(response.text.trim().to_string());
            }

            if response.tool_calls.is_empty() {
                if is_near_empty(&response.text)
                    && tool_turns > 0
                    && empty_retries < self.planner.max_empty_retries
                {
                    empty_retries += 1;
                    debug!(empty_retries, "re-prompting after empty answer");
                    self.history.push(Message::user(
                        "Your reply was empty. Tell the user the result of the task, or call the next tool.",
                    ));
                    continue;
                }
                let text = if is_near_empty(&response.text) {
                    best_partial(ledger)
                } else {
                    response.text.trim().to_string()
                };
                return (
                    PlannerOutcome {
                        response: text,
                        complete: true,
                        turns,
                    },
                    TaskStatus::Completed,
                );
            }

            tool_turns += 1;
            if let Some(ended) = self.run_calls(&response.tool_calls, ledger, turns) {
                return ended;
            }
        }
    }

    /// Dispatch one turn's calls in order. Returns early on a terminal tool.
    fn run_calls(
        &mut self,
        calls: &[ToolInvocation],
        ledger: &mut TaskLedger,
        turns: u32,
    ) -> Option<(PlannerOutcome, TaskStatus)> {
        let mut ended = None;
        for call in calls {
            if ended.is_some() {
                self.push_result(call, &ToolResult::failure("skipped: the task already ended"));
                continue;
            }
            if control::is_planner_terminal(&call.name) {
                let (outcome, status) = if call.name == TASK_DONE {
                    let summary = call.str_arg("summary").unwrap_or_default().trim();
                    let response = if summary.is_empty() {
                        best_partial(ledger)
                    } else {
                        summary.to_string()
                    };
                    (
                        PlannerOutcome {
                            response,
                            complete: true,
                            turns,
                        },
                        TaskStatus::Completed,
                    )
                } else {
                    let reason = call.str_arg("reason").unwrap_or("gave up").trim();
                    (incomplete(reason, turns), TaskStatus::Failed)
                };
                self.push_result(call, &ToolResult::ok("acknowledged"));
                ended = Some((outcome, status));
                continue;
            }

            let result = match AgentKind::from_deploy_tool(&call.name) {
                Some(kind) => self.deploy(kind, call),
                None => self.deps.dispatcher.dispatch(call),
            };
            let result = if result.success {
                self.learn_from_success(call, ledger);
                ledger.last_failure = None;
                ledger.consecutive = 0;
                result
            } else {
                self.handle_failure(call, result, ledger)
            };
            if ledger.recent.len() == RECENT_RESULTS {
                ledger.recent.pop_front();
            }
            ledger.recent.push_back(format!(
                "{}: {}",
                call.name,
                truncate_chars(result.content.trim(), RECENT_RESULT_CHARS)
            ));
            self.push_result(call, &result);
        }
        ended
    }

    fn push_result(&mut self, call: &ToolInvocation, result: &ToolResult) {
        let content = result.to_message_content();
        let content = truncate_chars(&content, self.planner.max_tool_result_chars);
        self.history.push(Message::tool_result(call, content));
    }

    fn deploy(&mut self, kind: AgentKind, call: &ToolInvocation) -> ToolResult {
        let Some(task) = call.str_arg("task").filter(|t| !t.trim().is_empty()) else {
            return ToolResult::failure(format!("{} needs a non-empty \"task\"", call.name));
        };
        if !self.deployments.can_deploy() {
            return self.deployments.limit_result();
        }
        let runner = SubAgentRunner {
            llm: self.deps.llm.as_ref(),
            dispatcher: self.deps.dispatcher.as_ref(),
            events: self.deps.events.as_ref(),
            prompts: &self.prompts,
            limits: &self.subagent,
            stop: &self.deps.stop,
            max_tokens: self.max_tokens,
        };
        match runner.run(kind, task) {
            Ok(report) => self.deployments.record(&report),
            Err(err) => ToolResult::failure(format!("{kind} agent could not start: {err:#}")),
        }
    }

    /// Record the failure, surface a known fix, and escalate repeated failures.
    fn handle_failure(
        &self,
        call: &ToolInvocation,
        mut result: ToolResult,
        ledger: &mut TaskLedger,
    ) -> ToolResult {
        let error = result.content.clone();
        let context = call.name.as_str();
        let key = registry_key(context, &normalize(&error));

        if ledger.surfaced.remove(&key) {
            self.deps.fixes.mark_fix_failed(&error, context);
        }
        if let Some(fix) = self.deps.fixes.record_error(&error, context) {
            result.content.push_str(&format!("\n\nKNOWN FIX: {fix}"));
            ledger.surfaced.insert(key.clone());
        }
        ledger
            .pending
            .insert(call.name.clone(), (error, Value::Object(call.arguments.clone())));

        if ledger.last_failure.as_deref() == Some(key.as_str()) {
            ledger.consecutive += 1;
        } else {
            ledger.last_failure = Some(key);
            ledger.consecutive = 1;
        }
        if ledger.consecutive >= self.safety.max_retries {
            warn!(tool = %call.name, failures = ledger.consecutive, "repeated failure");
            result.content.push_str(&format!(
                "\n\nThis has failed {} times in a row. Stop retrying it. Ask the user for help \
                 with send_message, or call give_up explaining what you tried.",
                ledger.consecutive
            ));
        }
        result
    }

    /// A tool that failed earlier in this task now worked with different arguments.
    fn learn_from_success(&self, call: &ToolInvocation, ledger: &mut TaskLedger) {
        let Some((error, failed_args)) = ledger.pending.remove(&call.name) else {
            return;
        };
        let args = Value::Object(call.arguments.clone());
        if args == failed_args {
            return;
        }
        let fix = format!("{} succeeded with arguments {args}", call.name);
        self.deps.fixes.record_fix(&error, &call.name, &fix, "auto");
    }

    fn error_warning(&self) -> Option<String> {
        let lines: Vec<String> = self
            .deps
            .fixes
            .top_errors(WARNING_LINES)
            .into_iter()
            .filter(|record| record.occurrences >= WARNING_MIN_OCCURRENCES)
            .map(|record| match record.known_fix {
                Some(fix) => format!(
                    "- {} in {} (x{}), known fix: {fix}",
                    record.signature, record.context, record.occurrences
                ),
                None => format!(
                    "- {} in {} (x{})",
                    record.signature, record.context, record.occurrences
                ),
            })
            .collect();
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}

fn incomplete(response: impl Into<String>, turns: u32) -> PlannerOutcome {
    PlannerOutcome {
        response: response.into(),
        complete: false,
        turns,
    }
}

/// Last substantive assistant text, else a digest of the latest tool results.
fn best_partial(ledger: &TaskLedger) -> String {
    if let Some(text) = &ledger.last_text {
        return text.clone();
    }
    if ledger.recent.is_empty() {
        return "No progress was made.".to_string();
    }
    let mut out = String::from("Latest results:");
    for line in &ledger.recent {
        out.push_str("\n- ");
        out.push_str(line);
    }
    out
}
