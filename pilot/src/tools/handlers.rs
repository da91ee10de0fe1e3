//! Built-in capability handlers: files, terminal, reasoning, messaging, web.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::safety::is_destructive;
use crate::core::types::{ToolInvocation, ToolResult};
use crate::events::EventSink;
use crate::io::config::PilotConfig;
use crate::io::process::run_shell;
use crate::tools::{Handler, ToolId};

fn required<'a>(invocation: &'a ToolInvocation, key: &str) -> Result<&'a str> {
    invocation
        .str_arg(key)
        .ok_or_else(|| anyhow!("missing string argument {key:?}"))
}

fn shared(handler: impl Handler + 'static) -> Arc<dyn Handler> {
    Arc::new(handler)
}

/// Every built-in handler wired from configuration.
pub fn builtin(config: &PilotConfig, events: Arc<EventSink>) -> Vec<(ToolId, Arc<dyn Handler>)> {
    let read_limit = config.tools.read_limit_bytes;
    let handler_timeout = Duration::from_secs(config.tools.handler_timeout_secs);
    vec![
        (ToolId::ListFiles, shared(ListFiles)),
        (ToolId::ReadFile, shared(ReadFile { limit_bytes: read_limit })),
        (ToolId::WriteFile, shared(WriteFile)),
        (
            ToolId::RunCommand,
            shared(RunCommand::new(
                handler_timeout,
                config.tools.output_limit_bytes,
                config.safety.allow_destructive_commands,
            )),
        ),
        (ToolId::Think, shared(Think { events: events.clone() })),
        (ToolId::SendMessage, shared(SendMessage { events })),
        (ToolId::FetchUrl, shared(FetchUrl::new(handler_timeout, read_limit))),
    ]
}

pub struct ListFiles;

impl Handler for ListFiles {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let path = Path::new(required(invocation, "path")?);
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("list {}", path.display()))? {
            let entry = entry.with_context(|| format!("list {}", path.display()))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(ToolResult::ok(format!("{} is empty", path.display())));
        }
        Ok(ToolResult::ok(entries.join("\n")))
    }
}

pub struct ReadFile {
    pub limit_bytes: usize,
}

impl Handler for ReadFile {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let path = Path::new(required(invocation, "path")?);
        let file = File::open(path).with_context(|| format!("read {}", path.display()))?;
        let total = file.metadata().map(|m| m.len()).unwrap_or(0);
        let mut buf = Vec::new();
        file.take(self.limit_bytes as u64)
            .read_to_end(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if total > buf.len() as u64 {
            text.push_str(&format!(
                "\n[truncated: showing {} of {} bytes]",
                buf.len(),
                total
            ));
        }
        Ok(ToolResult::ok(text))
    }
}

pub struct WriteFile;

impl Handler for WriteFile {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let path = Path::new(required(invocation, "path")?);
        let content = required(invocation, "content")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
        Ok(ToolResult::ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            path.display()
        )))
    }
}

/// Shell commands through the timeout-bounded process runner.
pub struct RunCommand {
    max_timeout: Duration,
    output_limit_bytes: usize,
    allow_destructive: bool,
}

impl RunCommand {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// `handler_timeout` is the dispatcher's limit; commands get one second less.
    pub fn new(handler_timeout: Duration, output_limit_bytes: usize, allow_destructive: bool) -> Self {
        Self {
            max_timeout: handler_timeout
                .saturating_sub(Duration::from_secs(1))
                .max(Duration::from_secs(1)),
            output_limit_bytes,
            allow_destructive,
        }
    }
}

impl Handler for RunCommand {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let command = required(invocation, "command")?;
        if !self.allow_destructive && is_destructive(command) {
            warn!(command, "refusing destructive command");
            return Ok(ToolResult::failure(format!(
                "refused: {command:?} looks destructive. Ask the user to run it themselves."
            )));
        }
        let timeout = invocation
            .arguments
            .get("timeout_secs")
            .and_then(serde_json::Value::as_u64)
            .map_or(Self::DEFAULT_TIMEOUT, Duration::from_secs)
            .min(self.max_timeout);

        debug!(command, timeout_secs = timeout.as_secs(), "running command");
        let output = run_shell(command, timeout, self.output_limit_bytes)?;
        let rendered = output.render();
        if output.timed_out {
            return Ok(ToolResult::failure(format!(
                "timed out after {}s\n{rendered}",
                timeout.as_secs()
            )));
        }
        if !output.status.success() {
            return Ok(ToolResult::failure(format!(
                "exit status {}\n{rendered}",
                output.exit_label()
            )));
        }
        if rendered.trim().is_empty() {
            return Ok(ToolResult::ok("(no output)"));
        }
        Ok(ToolResult::ok(rendered))
    }
}

pub struct Think {
    pub events: Arc<EventSink>,
}

impl Handler for Think {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let thought = required(invocation, "thought")?;
        self.events.emit("thinking", json!({"thought": thought}));
        Ok(ToolResult::ok("Thought recorded. Continue with the next action."))
    }
}

/// Replies are routed to the task's source by whoever subscribes to `message_sent`.
pub struct SendMessage {
    pub events: Arc<EventSink>,
}

impl Handler for SendMessage {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let message = required(invocation, "message")?;
        self.events.emit("message_sent", json!({"message": message}));
        Ok(ToolResult::ok("message sent"))
    }
}

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static BLANK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\n\s*").unwrap());

/// Reduce an HTML document to its visible text.
fn html_to_text(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, " ");
    let text = TAG_RE.replace_all(&text, " ");
    BLANK_RE.replace_all(text.trim(), "\n").into_owned()
}

pub struct FetchUrl {
    agent: ureq::Agent,
    limit_bytes: usize,
}

impl FetchUrl {
    pub fn new(timeout: Duration, limit_bytes: usize) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            limit_bytes,
        }
    }
}

impl Handler for FetchUrl {
    fn call(&self, invocation: &ToolInvocation) -> Result<ToolResult> {
        let url = required(invocation, "url")?;
        let response = match self.agent.get(url).set("User-Agent", "pilot/0.1").call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Ok(ToolResult::failure(format!("GET {url} returned HTTP {code}")));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(anyhow!("GET {url}: {transport}"));
            }
        };
        let is_html = response.content_type().contains("html");
        let mut buf = Vec::new();
        response
            .into_reader()
            .take(self.limit_bytes as u64)
            .read_to_end(&mut buf)
            .with_context(|| format!("read body of {url}"))?;
        let body = String::from_utf8_lossy(&buf);
        let text = if is_html {
            html_to_text(&body)
        } else {
            body.into_owned()
        };
        Ok(ToolResult::ok(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(handler: &dyn Handler, name: &str, args: serde_json::Value) -> Result<ToolResult> {
        handler.call(&ToolInvocation::new(name, args))
    }

    #[test]
    fn list_files_sorts_and_marks_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("b.txt"), "b").expect("write");
        fs::create_dir(temp.path().join("a")).expect("mkdir");
        let result = call(
            &ListFiles,
            "list_files",
            json!({"path": temp.path().to_string_lossy()}),
        )
        .expect("list");
        assert_eq!(result, ToolResult::ok("a/\nb.txt"));
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let err = call(
            &ReadFile { limit_bytes: 100 },
            "read_file",
            json!({"path": "/definitely/missing/file"}),
        )
        .expect_err("missing");
        assert!(format!("{err:#}").contains("/definitely/missing/file"));
    }

    #[test]
    fn read_file_truncates_large_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("big.txt");
        fs::write(&path, "x".repeat(50)).expect("write");
        let result = call(
            &ReadFile { limit_bytes: 10 },
            "read_file",
            json!({"path": path.to_string_lossy()}),
        )
        .expect("read");
        assert!(result.content.starts_with("xxxxxxxxxx\n[truncated"));
        assert!(result.content.contains("10 of 50 bytes"));
    }

    #[test]
    fn write_file_creates_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/out.txt");
        let result = call(
            &WriteFile,
            "write_file",
            json!({"path": path.to_string_lossy(), "content": "hello"}),
        )
        .expect("write");
        assert!(result.success);
        assert_eq!(fs::read_to_string(&path).expect("read back"), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn run_command_reports_exit_status() {
        let runner = RunCommand::new(Duration::from_secs(10), 10_000, false);
        let ok = call(&runner, "run_command", json!({"command": "echo hi"})).expect("run");
        assert_eq!(ok, ToolResult::ok("hi\n"));
        let bad = call(&runner, "run_command", json!({"command": "echo oops >&2; exit 3"}))
            .expect("run");
        assert!(!bad.success);
        assert!(bad.content.starts_with("exit status 3"));
        assert!(bad.content.contains("oops"));
    }

    #[test]
    fn run_command_refuses_destructive_commands() {
        let runner = RunCommand::new(Duration::from_secs(10), 10_000, false);
        let result =
            call(&runner, "run_command", json!({"command": "rm -rf /"})).expect("refusal");
        assert!(!result.success);
        assert!(result.content.starts_with("refused"));
    }

    #[test]
    fn think_and_send_message_emit_events() {
        let events = Arc::new(EventSink::new(10));
        call(
            &Think { events: events.clone() },
            "think",
            json!({"thought": "plan"}),
        )
        .expect("think");
        call(
            &SendMessage { events: events.clone() },
            "send_message",
            json!({"message": "done soon"}),
        )
        .expect("send");
        let history = events.history();
        assert_eq!(history[0].kind, "thinking");
        assert_eq!(history[1].kind, "message_sent");
        assert_eq!(history[1].data["message"], "done soon");
    }

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<html><head><style>p{}</style><script>var x;</script></head>\
                    <body><h1>Title</h1>\n\n<p>Body text</p></body></html>";
        let text = html_to_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("Body text"));
        assert!(!text.contains("var x"));
        assert!(!text.contains('<'));
    }
}
