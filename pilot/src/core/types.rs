//! Shared types for the orchestration core.
//!
//! These types define the contracts between the planner, the dispatcher, the
//! sub-agent runner and the LLM backends. They carry no I/O and serialize to
//! stable JSON shapes.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a task owned by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

/// Where a task came from. Replies are routed back to this source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Cli,
    Dashboard,
    Message,
    Scheduler,
}

impl TaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Dashboard => "dashboard",
            Self::Message => "message",
            Self::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "cli" => Ok(Self::Cli),
            "dashboard" => Ok(Self::Dashboard),
            "message" => Ok(Self::Message),
            "scheduler" => Ok(Self::Scheduler),
            other => Err(anyhow!("unknown task source: {other}")),
        }
    }
}

/// A unit of user intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub text: String,
    pub source: TaskSource,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(text: impl Into<String>, source: TaskSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            source,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Move into a terminal status. Terminal tasks are never reopened.
    pub fn finish(&mut self, status: TaskStatus) {
        if self.is_terminal() {
            return;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// A request from the LLM to run one capability.
///
/// Arguments are untrusted until validated against the tool's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            call_id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    /// String argument lookup; missing or non-string values yield `None`.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

/// Uniform outcome of a capability invocation.
///
/// Wire shape is `{success, content}` with `error: true` added on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: false,
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
            error: true,
        }
    }

    /// Text folded into the conversation for this result.
    pub fn to_message_content(&self) -> String {
        if self.success {
            self.content.clone()
        } else {
            format!("ERROR: {}", self.content)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// Marks entries that compaction must leave untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Plain,
    Note,
}

/// One entry of a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub kind: EntryKind,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            kind: EntryKind::Plain,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            kind: EntryKind::Plain,
        }
    }

    pub fn tool_result(invocation: &ToolInvocation, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(invocation.call_id.clone()),
            tool_name: Some(invocation.name.clone()),
            kind: EntryKind::Plain,
        }
    }

    pub fn with_kind(mut self, kind: EntryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == Role::Tool
    }
}

/// Sub-agent specialisations the planner can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Research,
    File,
    System,
    Browser,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [Self::Research, Self::File, Self::System, Self::Browser];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::File => "file",
            Self::System => "system",
            Self::Browser => "browser",
        }
    }

    /// Name of the planner tool that deploys this agent.
    pub fn deploy_tool(self) -> String {
        format!("deploy_{}_agent", self.as_str())
    }

    pub fn from_deploy_tool(name: &str) -> Option<Self> {
        let kind = name.strip_prefix("deploy_")?.strip_suffix("_agent")?;
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal and in-flight states of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Done,
    Stuck,
    ForceStopped,
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_wire_shape_omits_error_on_success() {
        let ok = serde_json::to_value(ToolResult::ok("fine")).expect("serialize");
        assert_eq!(ok, json!({"success": true, "content": "fine"}));

        let failed = serde_json::to_value(ToolResult::failure("boom")).expect("serialize");
        assert_eq!(
            failed,
            json!({"success": false, "content": "boom", "error": true})
        );
    }

    #[test]
    fn tool_result_rejects_unknown_fields() {
        let err = serde_json::from_value::<ToolResult>(
            json!({"success": true, "content": "x", "extra": 1}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn deploy_tool_names_round_trip() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_deploy_tool(&kind.deploy_tool()), Some(kind));
        }
        assert_eq!(AgentKind::from_deploy_tool("deploy_magic_agent"), None);
        assert_eq!(AgentKind::from_deploy_tool("list_files"), None);
    }

    #[test]
    fn finished_task_is_not_reopened() {
        let mut task = Task::new("hello", TaskSource::Cli);
        task.status = TaskStatus::Active;
        task.finish(TaskStatus::Failed);
        let stamp = task.completed_at;
        task.finish(TaskStatus::Completed);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.completed_at, stamp);
    }

    #[test]
    fn truncate_chars_respects_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn invocation_with_non_object_arguments_is_empty() {
        let call = ToolInvocation::new("think", json!("oops"));
        assert!(call.arguments.is_empty());
        assert!(call.call_id.starts_with("call_"));
    }
}
