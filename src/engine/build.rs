//! Build step for the engine binary.
//!
//! The engine is compiled by a single blocking external command (by default
//! `cargo build --release` in the engine's source tree). Success is exit
//! code zero; a failure carries the exit code and the captured combined
//! output so the caller can surface the compiler diagnostics.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Error type for the build step.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The build command ran but exited non-zero.
    #[error("Build failed with exit code {code:?}")]
    Failed {
        /// Exit code, `None` if killed by a signal.
        code: Option<i32>,
        /// Combined stdout and stderr of the build command.
        output: String,
    },
    /// The build command could not be run at all.
    #[error("Failed to run build command: {0}")]
    Io(#[from] std::io::Error),
}

/// The external build command for the engine binary.
#[derive(Debug, Clone)]
pub struct BuildCommand {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl Default for BuildCommand {
    fn default() -> Self {
        Self {
            program: "cargo".to_string(),
            args: vec!["build".to_string(), "--release".to_string()],
            working_dir: None,
        }
    }
}

impl BuildCommand {
    /// Create a build command with an explicit program and arguments.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// Set the directory the build command runs in.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run the build to completion.
    ///
    /// Blocks (asynchronously) until the command exits. Returns the combined
    /// stdout and stderr on success.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Failed` on a non-zero exit, `BuildError::Io` if
    /// the command cannot be spawned.
    pub async fn run(&self) -> Result<String, BuildError> {
        tracing::info!(program = %self.program, args = ?self.args, "Building engine");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The caller may drop this future on shutdown; the build must
            // not outlive the supervisor.
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let result = cmd.output().await?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));

        if result.status.success() {
            tracing::info!("Engine build succeeded");
            Ok(output)
        } else {
            tracing::error!(code = ?result.status.code(), "Engine build failed");
            Err(BuildError::Failed {
                code: result.status.code(),
                output,
            })
        }
    }
}
