//! Engine process spawning and control.
//!
//! This module provides a builder pattern for configuring and spawning the
//! trader engine binary, along with control methods for the running process:
//! command frames over stdin, stream handover for the reader tasks, and
//! graceful termination with a force-kill fallback.
//!
//! The handle is policy-free: escalation timing (how long to wait before a
//! force kill) is decided by the supervisor, not here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Lifecycle state of the engine process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessState {
    /// No process has been spawned yet.
    #[default]
    NotStarted,
    /// Spawned, readiness not yet observed.
    Starting,
    /// Spawned and reported ready.
    Running,
    /// Cooperative termination requested.
    Stopping,
    /// Exited cleanly.
    Stopped,
    /// Exited with a non-zero status or was killed by a signal.
    Crashed,
}

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The engine binary was not found.
    #[error("Engine binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("Permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Error type for writing command frames to the engine.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    /// The engine's stdin pipe is closed (process exited or stdin taken).
    #[error("Engine stdin pipe is closed")]
    ClosedPipe,
    /// Other I/O error while writing.
    #[error("I/O error writing to engine: {0}")]
    Io(std::io::Error),
}

/// Builder for configuring the engine process invocation.
#[derive(Debug, Clone, Default)]
pub struct EngineProcessBuilder {
    executable: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
    log_level: Option<String>,
    working_dir: Option<PathBuf>,
}

impl EngineProcessBuilder {
    /// Create a new builder for the given engine executable.
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    /// Set the argument list passed to the engine.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the engine's `RUST_LOG` verbosity.
    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Set the working directory for the engine process.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Get the configured executable path.
    #[must_use]
    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    /// Spawn the engine with piped stdin, stdout, and stderr.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the binary is missing, not executable, or the
    /// OS refuses to create the process.
    pub fn spawn(&self) -> Result<EngineProcess, SpawnError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref level) = self.log_level {
            cmd.env("RUST_LOG", level);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(SpawnError::from_io)?;
        // Detach stdin immediately: tokio's wait() closes any stdio handles
        // still held by the child, and the supervisor polls wait() while the
        // command pipe must stay open.
        let stdin = child.stdin.take();
        tracing::info!(
            executable = %self.executable.display(),
            pid = ?child.id(),
            "Engine process spawned"
        );

        Ok(EngineProcess {
            child,
            stdin,
            state: ProcessState::Starting,
        })
    }
}

/// A running engine process.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    /// Held outside the `Child` so polling [`wait`](Self::wait) cannot close
    /// the command pipe.
    stdin: Option<ChildStdin>,
    state: ProcessState,
}

impl EngineProcess {
    /// Get the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Mark the process as running after readiness was observed.
    pub fn mark_running(&mut self) {
        self.state = ProcessState::Running;
    }

    /// Write one command frame (a single line) to the engine's stdin.
    ///
    /// A trailing newline is appended and the pipe is flushed.
    ///
    /// # Errors
    ///
    /// Returns `WriteError::ClosedPipe` if the process has already exited or
    /// its stdin is gone.
    pub async fn write_line(&mut self, line: &str) -> Result<(), WriteError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(WriteError::ClosedPipe);
        };

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        let result = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe => WriteError::ClosedPipe,
            _ => WriteError::Io(e),
        })
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if let Some(status) = status {
            self.record_exit(status);
        }
        Ok(status)
    }

    /// Wait for the process to exit, recording the final lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.record_exit(status);
        Ok(status)
    }

    /// Forcefully kill the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.state = ProcessState::Stopping;
        self.child.kill().await?;
        self.state = ProcessState::Crashed;
        Ok(())
    }

    /// Attempt graceful termination, escalating after the grace window.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after `grace` elapses.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        self.state = ProcessState::Stopping;

        #[cfg(unix)]
        {
            self.graceful_terminate_unix(grace).await
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            self.child.kill().await?;
            let status = self.child.wait().await?;
            self.record_exit(status);
            Ok(status)
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.id() {
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            let _ = kill(nix_pid, Signal::SIGTERM);

            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    self.record_exit(status);
                    Ok(status)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => {
                    // Grace window elapsed without an exit, escalate.
                    tracing::warn!(pid, "Engine ignored SIGTERM, force killing");
                    self.child.kill().await?;
                    let status = self.child.wait().await?;
                    self.record_exit(status);
                    Ok(status)
                }
            }
        } else {
            // Process already exited.
            let status = self.child.wait().await?;
            self.record_exit(status);
            Ok(status)
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.state = if status.success() {
            ProcessState::Stopped
        } else {
            ProcessState::Crashed
        };
    }
}
