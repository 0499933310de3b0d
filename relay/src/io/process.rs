//! Helpers for running child processes with timeouts and bounded output.
//!
//! Pipes are always drained on background threads so a chatty child can never
//! block on a full pipe while we wait on it.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::shutdown::{CANCEL_SLICE, CancelFlag};

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Both streams as one lossy string, for signature scanning and logs.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }

    /// Log body with section headers and truncation notices.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

type OutputHandle = JoinHandle<Result<(Vec<u8>, usize)>>;

/// A spawned child whose stdout/stderr are being drained.
pub struct RunningChild {
    child: Child,
    stdout: Option<OutputHandle>,
    stderr: Option<OutputHandle>,
}

/// How a supervised wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEnd {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl RunningChild {
    /// Spawn `cmd` with piped output and an optional stdin payload.
    ///
    /// `on_stdout_line` sees each stdout line as it arrives; `tee_path` gets a
    /// flushed copy of stdout.
    #[instrument(skip_all, fields(output_limit_bytes, tee = tee_path.is_some()))]
    pub fn spawn<F>(
        mut cmd: Command,
        stdin: Option<&[u8]>,
        output_limit_bytes: usize,
        tee_path: Option<&Path>,
        on_stdout_line: F,
    ) -> Result<Self>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so terminate/kill reach the agent's children too.
            cmd.process_group(0);
        }

        let tee = match tee_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create stream dir {}", parent.display()))?;
                }
                let file = File::create(path)
                    .with_context(|| format!("create stream file {}", path.display()))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).context("spawn command");
            }
        };

        let stdout: ChildStdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr: ChildStderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stdout_handle =
            thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, tee, on_stdout_line));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

        let mut running = Self {
            child,
            stdout: Some(stdout_handle),
            stderr: Some(stderr_handle),
        };

        if let Some(input) = stdin {
            let child_stdin = running
                .child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            // Fed from its own thread so a child that never reads cannot stall the caller's wait.
            feed_stdin(child_stdin, input.to_vec());
        }

        Ok(running)
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().context("poll child")
    }

    /// Wait until the child exits, `deadline` passes, or `cancel` is raised.
    pub fn wait_until(&mut self, deadline: Instant, cancel: &CancelFlag) -> Result<WaitEnd> {
        loop {
            if cancel.is_cancelled() {
                return Ok(WaitEnd::Cancelled);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(WaitEnd::TimedOut);
            };
            if remaining.is_zero() {
                return Ok(WaitEnd::TimedOut);
            }
            if let Some(status) = self
                .child
                .wait_timeout(remaining.min(CANCEL_SLICE))
                .context("wait for child")?
            {
                return Ok(WaitEnd::Exited(status));
            }
        }
    }

    /// Ask the child to stop (SIGTERM on unix), then kill it after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        send_terminate(&self.child);
        if let Some(status) = self.child.wait_timeout(grace).context("wait after terminate")? {
            // Stragglers in the group would keep the output pipes open.
            send_kill(&self.child);
            return Ok(status);
        }
        warn!(pid = self.child.id(), "child ignored terminate, killing");
        self.kill()
    }

    pub fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        send_kill(&self.child);
        self.child.kill().context("kill child")?;
        self.child.wait().context("wait child after kill")
    }

    /// Join the pipe readers and assemble the output.
    pub fn finish(mut self, status: Option<ExitStatus>, timed_out: bool) -> Result<CommandOutput> {
        let (stdout, stdout_truncated) = match self.stdout.take() {
            Some(handle) => join_output(handle).context("join stdout")?,
            None => (Vec::new(), 0),
        };
        let (stderr, stderr_truncated) = match self.stderr.take() {
            Some(handle) => join_output(handle).context("join stderr")?,
            None => (Vec::new(), 0),
        };
        if stdout_truncated > 0 || stderr_truncated > 0 {
            warn!(stdout_truncated, stderr_truncated, "output truncated");
        }
        debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, "command finished");
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out,
        })
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), signal) {
        debug!(err = %err, ?signal, "signalling process group failed");
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn send_kill(child: &Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(not(unix))]
fn send_kill(_child: &Child) {}

/// Run a command to completion with a timeout, capturing bounded output.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut running = RunningChild::spawn(cmd, stdin, output_limit_bytes, None, |_| {})?;
    let status = match running
        .child
        .wait_timeout(timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            let status = running.kill()?;
            return running.finish(Some(status), true);
        }
    };
    running.finish(Some(status), false)
}

/// Write `input` and close the pipe. The thread ends on its own once the
/// child exits or is killed, since the write then fails with a broken pipe.
fn feed_stdin(mut pipe: ChildStdin, input: Vec<u8>) {
    thread::spawn(move || {
        if let Err(err) = pipe.write_all(&input) {
            // A child that exits without reading its stdin is not an error here.
            debug!(err = %err, "child stdin closed early");
        }
    });
}

fn join_output(handle: OutputHandle) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read line by line, tee-ing to a file and handing each line to `on_line`.
fn read_lines_limited<R, F>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
    mut on_line: F,
) -> Result<(Vec<u8>, usize)>
where
    R: Read,
    F: FnMut(&[u8]),
{
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = tee.as_mut() {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        on_line(&line);

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
