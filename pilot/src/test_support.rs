//! Scripted collaborators for deterministic tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::types::{Message, ToolInvocation, ToolResult};
use crate::events::EventSink;
use crate::io::config::PilotConfig;
use crate::llm::{LlmBackend, LlmError, LlmRequest, LlmResponse};
use crate::tools::dispatcher::Dispatcher;
use crate::tools::{Handler, ToolId, ToolRegistry};

type Generator = Box<dyn Fn(usize, &LlmRequest<'_>) -> LlmResponse + Send + Sync>;

/// LLM backend that replays canned responses in order.
///
/// Once the script is exhausted it either calls the generator or fails.
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    generator: Option<Generator>,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, responses: Vec<LlmResponse>) -> Self {
        Self::with_results(name, responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(name: &str, results: Vec<Result<LlmResponse, LlmError>>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(results.into()),
            generator: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Backend answering every call with `generate(call_index, request)`.
    pub fn repeating<F>(name: &str, generate: F) -> Self
    where
        F: Fn(usize, &LlmRequest<'_>) -> LlmResponse + Send + Sync + 'static,
    {
        Self {
            generator: Some(Box::new(generate)),
            ..Self::new(name, Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Conversation history seen by each call.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn complete(&self, request: &LlmRequest<'_>) -> Result<LlmResponse, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.messages.to_vec());
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match (next, &self.generator) {
            (Some(result), _) => result,
            (None, Some(generate)) => Ok(generate(index, request)),
            (None, None) => Err(LlmError::Fatal("script exhausted".to_string())),
        }
    }
}

pub fn call(name: &str, arguments: Value) -> ToolInvocation {
    ToolInvocation::new(name, arguments)
}

pub fn tool_calls(calls: Vec<ToolInvocation>) -> LlmResponse {
    LlmResponse::tools(calls)
}

/// Handler that always returns the same result.
pub struct FixedHandler(pub ToolResult);

impl Handler for FixedHandler {
    fn call(&self, _invocation: &ToolInvocation) -> Result<ToolResult> {
        Ok(self.0.clone())
    }
}

/// Handler that always errors with `message`.
pub struct FailingHandler(pub String);

impl Handler for FailingHandler {
    fn call(&self, _invocation: &ToolInvocation) -> Result<ToolResult> {
        Err(anyhow!("{}", self.0))
    }
}

/// Handler that records its invocations.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<ToolInvocation>>,
}

impl RecordingHandler {
    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Handler for RecordingHandler {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        Ok(ToolResult::ok(format!("ran {}", invocation.name)))
    }
}

pub fn shared(handler: impl Handler + 'static) -> Arc<dyn Handler> {
    Arc::new(handler)
}

/// Dispatcher over the given handlers with their built-in schemas.
pub fn dispatcher(handlers: Vec<(ToolId, Arc<dyn Handler>)>, events: Arc<EventSink>) -> Dispatcher {
    let registry = ToolRegistry::from_handlers(handlers).expect("test registry");
    Dispatcher::new(registry, events, Duration::from_secs(5))
}

/// Default configuration with test timeouts and the fix log under `dir`.
pub fn test_config(dir: &Path) -> PilotConfig {
    let mut config = PilotConfig::default();
    config.tools.handler_timeout_secs = 5;
    config.subagent.timeout_secs = 60;
    config.fixes.path = dir.join("fixes.jsonl");
    config
}

/// Event kinds recorded by the sink, oldest first.
pub fn event_kinds(events: &EventSink) -> Vec<String> {
    events.history().into_iter().map(|event| event.kind).collect()
}
