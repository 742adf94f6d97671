//! Subprocess execution for hgsync.
//!
//! Every interaction with the version-control binaries goes through this
//! crate: a blocking invocation with captured output, an exit code, and an
//! optional per-invocation environment. Callers decide what a non-zero exit
//! means; nothing here interprets stderr.
//!
//! # Example
//!
//! ```
//! use hgsync_process::run_command;
//!
//! let result = run_command("git", &["--version"]).expect("run");
//! assert!(result.success);
//! assert!(result.stdout.contains("git"));
//! ```

use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Duration of execution
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check that the command succeeded, turning a non-zero exit into an
    /// error carrying the captured stderr.
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "command failed with exit code {:?}: {}",
                self.exit_code,
                self.stderr
            ))
        }
    }

    /// Trimmed stdout, the usual shape callers want from plumbing commands.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Create a result from a process output
    pub fn from_output(output: &Output, duration: Duration) -> Self {
        Self {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Run a command and capture its output
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandResult> {
    let start = Instant::now();

    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run command: {} {:?}", program, args))?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}

/// Run a command in a specific directory
pub fn run_command_in_dir(program: &str, args: &[&str], dir: &Path) -> Result<CommandResult> {
    run_command_in_dir_with_env(program, args, dir, &[])
}

/// Run a command in a specific directory with additional environment
/// variables for this invocation only.
///
/// The child inherits the parent environment; `env` entries are layered on
/// top. The parent process environment is never mutated.
pub fn run_command_in_dir_with_env(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(&str, &str)],
) -> Result<CommandResult> {
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd.output().with_context(|| {
        format!(
            "failed to run command: {} {:?} in {}",
            program,
            args,
            dir.display()
        )
    })?;

    Ok(CommandResult::from_output(&output, start.elapsed()))
}
