//! Shell commands for the `run_command` tool: bounded time, bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// One output stream, cut at the byte limit.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes read from the pipe but not kept.
    pub dropped: usize,
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug)]
pub struct ShellOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    pub timed_out: bool,
}

impl ShellOutput {
    /// Stdout, then a `[stderr]` section, with a notice for every cut stream.
    pub fn render(&self) -> String {
        let mut text = self.stdout.text();
        push_dropped(&mut text, "stdout", self.stdout.dropped);
        if !self.stderr.bytes.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&self.stderr.text());
        }
        push_dropped(&mut text, "stderr", self.stderr.dropped);
        text
    }

    /// Exit code as text, or `signal` when the process was killed.
    pub fn exit_label(&self) -> String {
        self.status
            .code()
            .map_or_else(|| "signal".to_string(), |code| code.to_string())
    }
}

fn push_dropped(text: &mut String, stream: &str, dropped: usize) {
    if dropped > 0 {
        text.push_str(&format!("\n[{stream} truncated {dropped} bytes]\n"));
    }
}

/// Run `command` through `sh -c`.
///
/// Both pipes are drained on their own threads while the child runs, so a
/// chatty command cannot block on a full pipe. On timeout the child is killed
/// and whatever it printed so far is returned.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_shell(command: &str, timeout: Duration, limit_bytes: usize) -> Result<ShellOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn sh")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = thread::spawn(move || capture(stdout, limit_bytes));
    let stderr = thread::spawn(move || capture(stderr, limit_bytes));

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!("command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    let output = ShellOutput {
        status,
        stdout: join(stdout).context("read stdout")?,
        stderr: join(stderr).context("read stderr")?,
        timed_out,
    };
    debug!(
        exit = %output.exit_label(),
        timed_out,
        stdout_dropped = output.stdout.dropped,
        stderr_dropped = output.stderr.dropped,
        "command finished"
    );
    Ok(output)
}

fn join(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader panicked"))?
}

fn capture<R: Read>(mut pipe: R, limit: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk)?;
        if n == 0 {
            return Ok(captured);
        }
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const SECS: Duration = Duration::from_secs(10);

    #[test]
    fn stderr_follows_stdout() {
        let output = run_shell("echo out; echo err 1>&2", SECS, 1024).expect("run");
        assert!(output.status.success());
        assert_eq!(output.render(), "out\n[stderr]\nerr\n");
    }

    #[test]
    fn output_past_the_limit_is_dropped_and_reported() {
        let output = run_shell("printf 'abcdefghij'", SECS, 4).expect("run");
        assert_eq!(output.stdout.bytes, b"abcd");
        assert_eq!(output.stdout.dropped, 6);
        assert!(output.render().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn slow_command_is_killed() {
        let output = run_shell("sleep 5", Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn exit_code_is_reported() {
        let output = run_shell("exit 3", SECS, 64).expect("run");
        assert_eq!(output.exit_label(), "3");
    }
}
