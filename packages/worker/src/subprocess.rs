//! Subprocess execution with capture, timeout, and a structured result.
//!
//! Every external command the worker runs (installers, `tar`, the venv
//! builder, availability probes) goes through [`run_logged`] so that command
//! lines and output land in the log stream with a consistent shape, and so
//! that timeouts reliably kill the child.

use std::{collections::HashMap, fmt, process::Stdio, time::Duration};

use tokio::process::Command;
use tracing::{debug, instrument, trace};

/// The outcome of one external command.
///
/// Mirrors the shape the rest of the worker aggregates on: a command either
/// succeeded with its stdout, or failed with an error message (and possibly
/// partial output). Spawn failures and timeouts are failures, not panics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub error: Option<String>,
}

impl CommandOutput {
    /// A successful invocation.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            error: None,
        }
    }

    /// A failed invocation.
    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            error: Some(error.into()),
        }
    }

    /// The error message, or a placeholder when none was recorded.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// Options for [`run_logged`].
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Hard deadline; the child is killed on expiry. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Extra environment variables layered over the inherited environment.
    /// The inherited environment always passes through: installers depend on
    /// the cache-dir hints exported by the workspace manager.
    pub env: HashMap<String, String>,

    /// Suppress output logging (used for noisy enumeration commands).
    pub quiet: bool,
}

/// Execute a command, capturing stdout and stderr.
///
/// `operation` names the step for log lines ("Updating package list with
/// apt-get", "Creating cache tarball", ...). The exit code maps directly to
/// success/failure; a timeout produces a distinct error string so it can be
/// told apart from an installer failure downstream.
#[instrument(skip(args, options), fields(operation = operation.as_ref()))]
pub async fn run_logged(
    program: impl AsRef<str> + fmt::Debug,
    args: impl IntoIterator<Item = impl AsRef<str>>,
    operation: impl AsRef<str>,
    options: RunOptions,
) -> CommandOutput {
    let program = program.as_ref();
    let args = args
        .into_iter()
        .map(|a| a.as_ref().to_string())
        .collect::<Vec<_>>();
    let operation = operation.as_ref();

    debug!(program, ?args, "{operation}: executing");

    let mut cmd = Command::new(program);
    cmd.args(&args);
    cmd.envs(&options.env);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!(?err, "{operation}: spawn failed");
            return CommandOutput::err(format!("failed to spawn {program}: {err}"));
        }
    };

    let waited = match options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(waited) => waited,
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                let message = format!("command timed out after {} seconds", timeout.as_secs());
                debug!("{operation}: {message}");
                return CommandOutput::err(message);
            }
        },
        None => child.wait_with_output().await,
    };

    let output = match waited {
        Ok(output) => output,
        Err(err) => {
            debug!(?err, "{operation}: wait failed");
            return CommandOutput::err(format!("failed to wait for {program}: {err}"));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !options.quiet {
        if !stdout.trim().is_empty() {
            debug!("{operation}: output: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            if output.status.success() {
                debug!("{operation}: warnings: {}", stderr.trim());
            } else {
                debug!("{operation}: errors: {}", stderr.trim());
            }
        }
    }

    if output.status.success() {
        CommandOutput {
            success: true,
            stdout,
            error: None,
        }
    } else {
        CommandOutput {
            success: false,
            stdout,
            error: Some(if stderr.is_empty() {
                format!("{program} exited with status: {}", output.status)
            } else {
                stderr
            }),
        }
    }
}

/// Probe whether a program is available on `PATH`.
#[instrument]
pub async fn which(program: impl AsRef<str> + fmt::Debug) -> bool {
    let program = program.as_ref();
    let result = run_logged(
        "which",
        [program],
        format!("Checking {program} availability"),
        RunOptions {
            quiet: true,
            ..RunOptions::default()
        },
    )
    .await;
    trace!(program, available = result.success, "probed availability");
    result.success
}
