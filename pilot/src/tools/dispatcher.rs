//! Single entry point from the loops to capability handlers.
//!
//! `dispatch` never fails: unknown tools, schema violations, handler errors,
//! panics and timeouts all come back as `success=false` results.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::types::{ToolInvocation, ToolResult, truncate_chars};
use crate::events::EventSink;
use crate::tools::{ToolId, ToolRegistry};

const EVENT_CONTENT_CHARS: usize = 500;

pub struct Dispatcher {
    registry: ToolRegistry,
    events: Arc<EventSink>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, events: Arc<EventSink>, timeout: Duration) -> Self {
        Self {
            registry,
            events,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[instrument(skip_all, fields(tool = %invocation.name, call_id = %invocation.call_id))]
    pub fn dispatch(&self, invocation: &ToolInvocation) -> ToolResult {
        self.events.emit(
            "tool_called",
            json!({
                "tool_name": invocation.name,
                "call_id": invocation.call_id,
                "arguments": invocation.arguments,
            }),
        );
        let started = Instant::now();
        let result = self.run(invocation);
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(success = result.success, duration_ms, "tool finished");
        self.events.emit(
            "tool_result",
            json!({
                "tool_name": invocation.name,
                "call_id": invocation.call_id,
                "success": result.success,
                "content": truncate_chars(&result.content, EVENT_CONTENT_CHARS),
                "duration_ms": duration_ms,
            }),
        );
        result
    }

    fn run(&self, invocation: &ToolInvocation) -> ToolResult {
        let tool = invocation
            .name
            .parse::<ToolId>()
            .ok()
            .and_then(|id| self.registry.get(id).map(|tool| (id, tool)));
        let Some((id, tool)) = tool else {
            return ToolResult::failure(format!("unknown tool: {}", invocation.name));
        };

        let violations = self
            .registry
            .violations(id, &Value::Object(invocation.arguments.clone()));
        if !violations.is_empty() {
            return ToolResult::failure(format!(
                "invalid arguments for {id}: {}",
                violations.join("; ")
            ));
        }

        let handler = Arc::clone(&tool.handler);
        let call = invocation.clone();
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("tool-{id}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(&call)));
                let _ = tx.send(outcome);
            });
        if let Err(err) = spawned {
            return ToolResult::failure(format!("could not start {id}: {err}"));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(Ok(mut result))) => {
                result.error = !result.success;
                result
            }
            Ok(Ok(Err(err))) => ToolResult::failure(format!("{err:#}")),
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = %id, panic = %message, "handler panicked");
                ToolResult::failure(format!("{id} crashed: {message}"))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(tool = %id, timeout_secs = self.timeout.as_secs(), "handler timed out");
                ToolResult::failure(format!(
                    "{id} timed out after {}s",
                    self.timeout.as_secs_f64()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                ToolResult::failure(format!("{id} exited without a result"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Handler;
    use anyhow::{Result, bail};

    fn dispatcher(handlers: Vec<(ToolId, Arc<dyn Handler>)>, events: Arc<EventSink>) -> Dispatcher {
        let registry = ToolRegistry::from_handlers(handlers).expect("registry");
        Dispatcher::new(registry, events, Duration::from_millis(200))
    }

    fn echo() -> Arc<dyn Handler> {
        Arc::new(|inv: &ToolInvocation| -> Result<ToolResult> {
            Ok(ToolResult::ok(inv.str_arg("thought").unwrap_or_default()))
        })
    }

    #[test]
    fn success_emits_called_then_result() {
        let events = Arc::new(EventSink::new(10));
        let d = dispatcher(vec![(ToolId::Think, echo())], events.clone());
        let result = d.dispatch(&ToolInvocation::new("think", json!({"thought": "hmm"})));
        assert_eq!(result, ToolResult::ok("hmm"));
        let kinds: Vec<String> = events.history().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["tool_called", "tool_result"]);
        assert_eq!(events.stats().tool_successes, 1);
    }

    #[test]
    fn unknown_tool_fails() {
        let d = dispatcher(Vec::new(), Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("teleport", json!({})));
        assert!(!result.success);
        assert_eq!(result.content, "unknown tool: teleport");
    }

    #[test]
    fn known_but_unregistered_tool_fails() {
        let d = dispatcher(vec![(ToolId::Think, echo())], Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("goto", json!({"url": "x"})));
        assert_eq!(result.content, "unknown tool: goto");
    }

    #[test]
    fn schema_violation_skips_handler() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = called.clone();
        let handler: Arc<dyn Handler> = Arc::new(move |_: &ToolInvocation| -> Result<ToolResult> {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(ToolResult::ok(""))
        });
        let d = dispatcher(vec![(ToolId::Think, handler)], Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("think", json!({"thought": 1, "x": 2})));
        assert!(!result.success);
        assert!(result.content.starts_with("invalid arguments for think:"));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn handler_error_and_panic_become_failures() {
        let failing: Arc<dyn Handler> =
            Arc::new(|_: &ToolInvocation| -> Result<ToolResult> { bail!("disk on fire") });
        let panicking: Arc<dyn Handler> =
            Arc::new(|_: &ToolInvocation| -> Result<ToolResult> { panic!("boom") });
        let d = dispatcher(
            vec![(ToolId::ListFiles, failing), (ToolId::ReadFile, panicking)],
            Arc::new(EventSink::new(0)),
        );
        let err = d.dispatch(&ToolInvocation::new("list_files", json!({"path": "."})));
        assert_eq!(err, ToolResult::failure("disk on fire"));
        let crash = d.dispatch(&ToolInvocation::new("read_file", json!({"path": "."})));
        assert!(!crash.success);
        assert!(crash.content.contains("boom"));
    }

    #[test]
    fn slow_handler_times_out() {
        let slow: Arc<dyn Handler> = Arc::new(|_: &ToolInvocation| -> Result<ToolResult> {
            thread::sleep(Duration::from_secs(2));
            Ok(ToolResult::ok("late"))
        });
        let d = dispatcher(vec![(ToolId::Look, slow)], Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("look", json!({})));
        assert!(!result.success);
        assert!(result.content.contains("timed out"));
    }

    #[test]
    fn handler_reported_failure_is_flagged() {
        let soft: Arc<dyn Handler> = Arc::new(|_: &ToolInvocation| -> Result<ToolResult> {
            Ok(ToolResult {
                success: false,
                content: "nope".into(),
                error: false,
            })
        });
        let d = dispatcher(vec![(ToolId::Look, soft)], Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("look", json!({})));
        assert!(result.error);
    }

    #[test]
    fn success_never_carries_the_error_flag() {
        let confused: Arc<dyn Handler> = Arc::new(|_: &ToolInvocation| -> Result<ToolResult> {
            Ok(ToolResult {
                success: true,
                content: "x".into(),
                error: true,
            })
        });
        let d = dispatcher(vec![(ToolId::Look, confused)], Arc::new(EventSink::new(0)));
        let result = d.dispatch(&ToolInvocation::new("look", json!({})));
        assert_eq!(
            serde_json::to_value(&result).expect("serialize"),
            json!({"success": true, "content": "x"})
        );
    }
}
