//! Capability registry: tool schemas, handlers and their binding.
//!
//! Handler-backed tools form the closed [`ToolId`] set. Control tools
//! (`task_done`, `deploy_*_agent`, `done`, ...) are interpreted by the planner
//! and sub-agent runner directly and live in [`control`].

pub mod control;
pub mod dispatcher;
pub mod handlers;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::Serialize;
use serde_json::{Value, json};

use crate::core::types::{ToolInvocation, ToolResult};

/// Schema presented verbatim to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Whether a tool only reads state or changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Observe,
    Act,
}

/// Every handler-backed capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolId {
    ListFiles,
    ReadFile,
    WriteFile,
    RunCommand,
    Think,
    SendMessage,
    FetchUrl,
    Goto,
    Look,
    Click,
    TypeText,
    Scroll,
    Mail,
}

impl ToolId {
    pub const ALL: [ToolId; 13] = [
        Self::ListFiles,
        Self::ReadFile,
        Self::WriteFile,
        Self::RunCommand,
        Self::Think,
        Self::SendMessage,
        Self::FetchUrl,
        Self::Goto,
        Self::Look,
        Self::Click,
        Self::TypeText,
        Self::Scroll,
        Self::Mail,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListFiles => "list_files",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::RunCommand => "run_command",
            Self::Think => "think",
            Self::SendMessage => "send_message",
            Self::FetchUrl => "fetch_url",
            Self::Goto => "goto",
            Self::Look => "look",
            Self::Click => "click",
            Self::TypeText => "type_text",
            Self::Scroll => "scroll",
            Self::Mail => "mail",
        }
    }

    pub fn category(self) -> ToolCategory {
        match self {
            Self::ListFiles | Self::ReadFile | Self::Think | Self::FetchUrl | Self::Look => {
                ToolCategory::Observe
            }
            Self::WriteFile
            | Self::RunCommand
            | Self::SendMessage
            | Self::Goto
            | Self::Click
            | Self::TypeText
            | Self::Scroll
            | Self::Mail => ToolCategory::Act,
        }
    }

    /// Built-in schema for this tool.
    pub fn spec(self) -> ToolSpec {
        let (description, parameters) = match self {
            Self::ListFiles => (
                "List the entries of a directory.",
                object(json!({"path": {"type": "string", "description": "Directory to list"}}), &["path"]),
            ),
            Self::ReadFile => (
                "Read a UTF-8 text file. Large files are truncated.",
                object(json!({"path": {"type": "string"}}), &["path"]),
            ),
            Self::WriteFile => (
                "Create or overwrite a file with the given content.",
                object(
                    json!({"path": {"type": "string"}, "content": {"type": "string"}}),
                    &["path", "content"],
                ),
            ),
            Self::RunCommand => (
                "Run a shell command and return its output.",
                object(
                    json!({
                        "command": {"type": "string", "minLength": 1},
                        "timeout_secs": {"type": "integer", "minimum": 1, "maximum": 600}
                    }),
                    &["command"],
                ),
            ),
            Self::Think => (
                "Record your reasoning before acting. No side effects.",
                object(json!({"thought": {"type": "string"}}), &["thought"]),
            ),
            Self::SendMessage => (
                "Send a message back to whoever submitted the task.",
                object(json!({"message": {"type": "string", "minLength": 1}}), &["message"]),
            ),
            Self::FetchUrl => (
                "Fetch a web page or API endpoint over HTTP(S) and return the body.",
                object(
                    json!({"url": {"type": "string", "pattern": "^https?://"}}),
                    &["url"],
                ),
            ),
            Self::Goto => (
                "Open a URL in the browser.",
                object(json!({"url": {"type": "string"}}), &["url"]),
            ),
            Self::Look => (
                "Describe the current browser page: visible text and interactive elements.",
                object(json!({}), &[]),
            ),
            Self::Click => (
                "Click an element on the current page by its visible label.",
                object(json!({"target": {"type": "string"}}), &["target"]),
            ),
            Self::TypeText => (
                "Type text into an input on the current page.",
                object(
                    json!({"target": {"type": "string"}, "text": {"type": "string"}}),
                    &["target", "text"],
                ),
            ),
            Self::Scroll => (
                "Scroll the current page.",
                object(
                    json!({"direction": {"type": "string", "enum": ["up", "down"]}}),
                    &["direction"],
                ),
            ),
            Self::Mail => (
                "Read or send e-mail.",
                object(
                    json!({
                        "action": {"type": "string", "enum": ["unread", "search", "send"]},
                        "query": {"type": "string"},
                        "to": {"type": "string"},
                        "subject": {"type": "string"},
                        "body": {"type": "string"}
                    }),
                    &["action"],
                ),
            ),
        };
        ToolSpec::new(self.as_str(), description, parameters)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| anyhow!("unknown tool: {s}"))
    }
}

/// JSON Schema object with the given properties; extra properties rejected.
pub(crate) fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// A capability implementation.
///
/// Returning `Err` is equivalent to a failed [`ToolResult`] carrying the
/// error chain; the dispatcher converts it.
pub trait Handler: Send + Sync {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult>;
}

impl<F> Handler for F
where
    F: Fn(&ToolInvocation) -> Result<ToolResult> + Send + Sync,
{
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        self(invocation)
    }
}

pub(crate) struct RegisteredTool {
    pub(crate) spec: ToolSpec,
    pub(crate) validator: Validator,
    pub(crate) handler: Arc<dyn Handler>,
}

/// Closed map from [`ToolId`] to schema, compiled validator and handler.
pub struct ToolRegistry {
    tools: BTreeMap<ToolId, RegisteredTool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Bind advertised schemas to handlers.
    ///
    /// Fails when a schema has no handler, a handler has no schema, a name
    /// is not a known tool, or a schema does not compile.
    pub fn new(specs: Vec<ToolSpec>, handlers: Vec<(ToolId, Arc<dyn Handler>)>) -> Result<Self> {
        let mut by_id: BTreeMap<ToolId, Arc<dyn Handler>> = BTreeMap::new();
        for (id, handler) in handlers {
            if by_id.insert(id, handler).is_some() {
                bail!("duplicate handler for {id}");
            }
        }

        let mut tools = BTreeMap::new();
        for spec in specs {
            let id: ToolId = spec.name.parse()?;
            let handler = by_id
                .remove(&id)
                .ok_or_else(|| anyhow!("tool {id} is advertised but has no handler"))?;
            let validator = jsonschema::options()
                .with_draft(Draft::Draft202012)
                .build(&spec.parameters)
                .with_context(|| format!("compile schema for {id}"))?;
            if tools
                .insert(
                    id,
                    RegisteredTool {
                        spec,
                        validator,
                        handler,
                    },
                )
                .is_some()
            {
                bail!("duplicate schema for {id}");
            }
        }
        if let Some(id) = by_id.keys().next() {
            bail!("handler registered for {id} but no schema advertises it");
        }
        Ok(Self { tools })
    }

    /// Registry using the built-in schema of every handler's tool.
    pub fn from_handlers(handlers: Vec<(ToolId, Arc<dyn Handler>)>) -> Result<Self> {
        let specs = handlers.iter().map(|(id, _)| id.spec()).collect();
        Self::new(specs, handlers)
    }

    pub fn contains(&self, id: ToolId) -> bool {
        self.tools.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ToolId> + '_ {
        self.tools.keys().copied()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|tool| tool.spec.clone()).collect()
    }

    /// Schemas for the given subset, skipping tools that are not registered.
    pub fn specs_for(&self, ids: &[ToolId]) -> Vec<ToolSpec> {
        ids.iter()
            .filter_map(|id| self.tools.get(id))
            .map(|tool| tool.spec.clone())
            .collect()
    }

    pub(crate) fn get(&self, id: ToolId) -> Option<&RegisteredTool> {
        self.tools.get(&id)
    }

    /// Every schema violation of `arguments`, sorted for stable output.
    pub fn violations(&self, id: ToolId, arguments: &Value) -> Vec<String> {
        let Some(tool) = self.tools.get(&id) else {
            return vec![format!("unknown tool: {id}")];
        };
        let mut messages: Vec<String> = tool
            .validator
            .iter_errors(arguments)
            .map(|err| err.to_string())
            .collect();
        messages.sort();
        messages.dedup();
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(|_: &ToolInvocation| -> Result<ToolResult> { Ok(ToolResult::ok("ok")) })
    }

    #[test]
    fn every_builtin_schema_compiles() {
        let handlers = ToolId::ALL.iter().map(|id| (*id, noop())).collect();
        let registry = ToolRegistry::from_handlers(handlers).expect("registry");
        assert_eq!(registry.specs().len(), ToolId::ALL.len());
    }

    #[test]
    fn names_round_trip() {
        for id in ToolId::ALL {
            assert_eq!(id.as_str().parse::<ToolId>().expect("parse"), id);
        }
        assert!("rm_rf".parse::<ToolId>().is_err());
    }

    #[test]
    fn advertised_schema_without_handler_is_rejected() {
        let err = ToolRegistry::new(vec![ToolId::ReadFile.spec()], Vec::new())
            .expect_err("missing handler");
        assert!(err.to_string().contains("read_file"));
    }

    #[test]
    fn handler_without_schema_is_rejected() {
        let err = ToolRegistry::new(
            vec![ToolId::ReadFile.spec()],
            vec![(ToolId::ReadFile, noop()), (ToolId::Think, noop())],
        )
        .expect_err("orphan handler");
        assert!(err.to_string().contains("think"));
    }

    #[test]
    fn unknown_schema_name_is_rejected() {
        let spec = ToolSpec::new("teleport", "", object(json!({}), &[]));
        assert!(ToolRegistry::new(vec![spec], Vec::new()).is_err());
    }

    #[test]
    fn violations_list_every_problem() {
        let registry =
            ToolRegistry::from_handlers(vec![(ToolId::WriteFile, noop())]).expect("registry");
        let problems = registry.violations(ToolId::WriteFile, &json!({"path": 3, "extra": true}));
        assert!(problems.len() >= 3, "{problems:?}");
        assert!(registry
            .violations(ToolId::WriteFile, &json!({"path": "a", "content": "b"}))
            .is_empty());
    }

    #[test]
    fn subset_specs_skip_unregistered_tools() {
        let registry =
            ToolRegistry::from_handlers(vec![(ToolId::Think, noop())]).expect("registry");
        let specs = registry.specs_for(&[ToolId::Think, ToolId::Goto]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "think");
    }
}
