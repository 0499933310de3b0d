//! External verification command.
//!
//! A configured shell command acts as an objective completion check. Its
//! result is data: spawn failures, non-zero exits and timeouts all come back
//! as a failed [`VerificationResult`], never as an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;

const VERIFY_OUTPUT_LIMIT_BYTES: usize = 200_000;

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl VerificationResult {
    fn spawn_failed(err: &anyhow::Error, duration: Duration) -> Self {
        Self {
            passed: false,
            exit_code: None,
            timed_out: false,
            stdout: String::new(),
            stderr: format!("failed to run verification command: {err:#}"),
            duration,
        }
    }

    /// Log body for the session archive.
    pub fn render_log(&self) -> String {
        format!(
            "passed: {}\nexit_code: {}\ntimed_out: {}\nduration_ms: {}\n\n=== stdout ===\n{}\n=== stderr ===\n{}\n",
            self.passed,
            self.exit_code
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            self.timed_out,
            self.duration.as_millis(),
            self.stdout,
            self.stderr,
        )
    }
}

/// Seam between the relay loop and the shell.
pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> VerificationResult;
}

/// Runs the command through the platform shell.
pub struct ShellVerifier;

impl Verifier for ShellVerifier {
    #[instrument(skip_all, fields(command = %request.command, timeout_secs = request.timeout.as_secs()))]
    fn verify(&self, request: &VerifyRequest) -> VerificationResult {
        let started = Instant::now();
        let output = run_command_with_timeout(
            shell_command(&request.command, &request.workdir),
            None,
            request.timeout,
            VERIFY_OUTPUT_LIMIT_BYTES,
        );
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "verification command could not run");
                return VerificationResult::spawn_failed(&err, started.elapsed());
            }
        };
        let result = VerificationResult {
            passed: output.success(),
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        };
        info!(
            passed = result.passed,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            "verification finished"
        );
        result
    }
}

fn shell_command(command: &str, workdir: &Path) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd.current_dir(workdir);
    cmd
}

pub fn write_verify_log(path: &Path, result: &VerificationResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    fs::write(path, result.render_log())
        .with_context(|| format!("write verify log {}", path.display()))
}
