//! Control tools interpreted by the loops themselves rather than dispatched.

use serde_json::json;

use crate::core::types::AgentKind;
use crate::tools::{ToolSpec, object};

pub const TASK_DONE: &str = "task_done";
pub const GIVE_UP: &str = "give_up";
pub const DONE: &str = "done";
pub const STUCK: &str = "stuck";
pub const NOTE: &str = "note";

/// Planner tools ending the task.
pub fn planner_terminal_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            TASK_DONE,
            "Finish the task. Call this only once the work is verified.",
            object(json!({"summary": {"type": "string"}}), &["summary"]),
        ),
        ToolSpec::new(
            GIVE_UP,
            "Abandon the task when it cannot be completed.",
            object(json!({"reason": {"type": "string"}}), &["reason"]),
        ),
    ]
}

/// Delegation tool for one agent kind.
pub fn deploy_spec(kind: AgentKind, description: &str) -> ToolSpec {
    ToolSpec::new(
        kind.deploy_tool(),
        description,
        object(
            json!({"task": {"type": "string", "description": "Complete, self-contained instructions"}}),
            &["task"],
        ),
    )
}

/// Tools only sub-agents see.
pub fn subagent_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec::new(
            DONE,
            "Report the sub-task finished, with a concrete summary of what was found or changed.",
            object(json!({"summary": {"type": "string"}}), &["summary"]),
        ),
        ToolSpec::new(
            STUCK,
            "Report that the sub-task cannot be completed, and why.",
            object(json!({"reason": {"type": "string"}}), &["reason"]),
        ),
        ToolSpec::new(
            NOTE,
            "Save a finding so it survives context compaction.",
            object(
                json!({"key": {"type": "string"}, "value": {"type": "string"}}),
                &["key", "value"],
            ),
        ),
    ]
}

pub fn is_planner_terminal(name: &str) -> bool {
    name == TASK_DONE || name == GIVE_UP
}

pub fn is_subagent_terminal(name: &str) -> bool {
    name == DONE || name == STUCK
}
