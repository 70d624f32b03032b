//! External command execution
//!
//! Every external tool (metadata probe, fetch, archive) goes through the
//! [`CommandRunner`] trait. A run yields a [`CommandOutput`] holding the exit code,
//! the stdout lines, and the stderr text; [`CommandOutput::into_outcome`] turns that
//! into a tagged success/failure value so callers never inspect exit codes directly.
//!
//! [`ProcessRunner`] is the real implementation built on `tokio::process`. Tests and
//! embedders can substitute their own runner.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Raw result of one external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Standard output, one entry per line, in arrival order
    pub stdout_lines: Vec<String>,
    /// Standard error, accumulated verbatim
    pub stderr: String,
}

/// Success/failure view of a [`CommandOutput`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit code 0
    Succeeded {
        /// Standard output lines
        lines: Vec<String>,
    },
    /// Any other exit
    Failed {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Diagnostic text for logging
        diagnostics: String,
    },
}

impl CommandOutput {
    /// Build a successful output from stdout lines (convenient for fakes)
    pub fn success<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exit_code: Some(0),
            stdout_lines: lines.into_iter().map(Into::into).collect(),
            stderr: String::new(),
        }
    }

    /// Build a failed output with the given exit code and stderr (convenient for fakes)
    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout_lines: Vec::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Classify the output by exit code
    pub fn into_outcome(self) -> CommandOutcome {
        if self.succeeded() {
            return CommandOutcome::Succeeded {
                lines: self.stdout_lines,
            };
        }

        let stderr = self.stderr.trim();
        let diagnostics = match (self.exit_code, stderr.is_empty()) {
            (Some(code), true) => format!("exited with code {}", code),
            (Some(code), false) => format!("exited with code {}: {}", code, stderr),
            (None, true) => "terminated by signal".to_string(),
            (None, false) => format!("terminated by signal: {}", stderr),
        };

        CommandOutcome::Failed {
            exit_code: self.exit_code,
            diagnostics,
        }
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion
    ///
    /// A non-zero exit is *not* an error here; it is reported through
    /// [`CommandOutput::exit_code`]. Errors mean the program could not be run at all.
    async fn run(&self, program: &Path, args: &[OsString]) -> Result<CommandOutput>;

    /// Name of this runner implementation (for logging)
    fn name(&self) -> &'static str;
}

/// [`CommandRunner`] backed by `tokio::process`
///
/// stdout is consumed line by line while stderr is drained concurrently, so a chatty
/// tool cannot block on a full pipe.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// Create a runner; `timeout` bounds each invocation (None = unbounded)
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[OsString]) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ExternalTool(format!("failed to execute {}: {}", program.display(), e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ExternalTool("child stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::ExternalTool("child stderr was not captured".to_string()))?;

        let collect = async {
            let read_stdout = async {
                let mut lines = Vec::new();
                let mut reader = BufReader::new(stdout).lines();
                while let Some(line) = reader.next_line().await? {
                    tracing::trace!(program = %program.display(), %line, "tool stdout");
                    lines.push(line);
                }
                Ok::<_, std::io::Error>(lines)
            };

            let read_stderr = async {
                let mut buf = Vec::new();
                BufReader::new(stderr).read_to_end(&mut buf).await?;
                Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
            };

            let (stdout_lines, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;

            Ok::<_, std::io::Error>(CommandOutput {
                exit_code: status.code(),
                stdout_lines,
                stderr,
            })
        };

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.map_err(|_| {
                Error::ExternalTool(format!(
                    "{} timed out after {:?}",
                    program.display(),
                    limit
                ))
            })??,
            None => collect.await?,
        };

        tracing::debug!(
            program = %program.display(),
            exit_code = ?output.exit_code,
            stdout_lines = output.stdout_lines.len(),
            "external command finished"
        );

        Ok(output)
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Resolve a tool path from explicit configuration or PATH
///
/// Returns `None` if no explicit path is set and the binary is not on PATH (or PATH
/// search is disabled).
pub fn resolve_tool(explicit: Option<&Path>, binary: &str, search_path: bool) -> Option<std::path::PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None if search_path => which::which(binary).ok(),
        None => None,
    }
}
