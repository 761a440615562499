//! Execution boundary for OS networking tools.
//!
//! The tunnel, shaping and performance managers never build shell strings or
//! spawn processes themselves. They assemble an argv with [`builder`] and hand
//! it to a [`CommandExecutor`]. Production code uses [`SystemExecutor`];
//! tests plug in [`FakeExecutor`] to script tool output without privileges.
//!
//! # Key Features
//!
//! * **No shell**: argv is passed straight to `execve`, so metacharacters in
//!   arguments are inert
//! * **Hard timeouts**: every invocation is bounded and the child is killed on
//!   expiry
//! * **Long-lived children**: measurement servers are spawned through
//!   [`CommandExecutor::spawn`] and released through [`ProcessHandle::kill`]

pub mod builder;
pub mod fake;

pub use builder::CommandLine;
pub use fake::FakeExecutor;

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use tn_shared::{TnError, TnResult};

/// Boxed future returned by executor methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr when present, stdout otherwise. Used for error messages.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Handle on a spawned long-running process
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    /// True once the process has terminated on its own.
    fn has_exited(&mut self) -> bool;

    fn kill(&mut self) -> BoxFuture<'_, TnResult<()>>;
}

/// Runs external networking tools
pub trait CommandExecutor: Send + Sync {
    /// Run `argv` to completion. A non-zero exit is not an error here; the
    /// caller inspects [`CommandOutput::exit_code`].
    fn run<'a>(&'a self, argv: &'a [String], timeout: Duration) -> BoxFuture<'a, TnResult<CommandOutput>>;

    /// Start `argv` in the background.
    fn spawn<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, TnResult<Box<dyn ProcessHandle>>>;
}

/// Run a command and turn a non-zero exit into [`TnError::Command`].
pub async fn run_checked(
    executor: &dyn CommandExecutor,
    argv: &[String],
    timeout: Duration,
) -> TnResult<CommandOutput> {
    let output = executor.run(argv, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(TnError::command(format!(
            "`{}` exited with {}: {}",
            argv.join(" "),
            output.exit_code,
            output.diagnostic()
        )))
    }
}

/// Executor backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }

    fn command(argv: &[String]) -> TnResult<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TnError::command("empty command line"))?;
        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        Ok(command)
    }

    fn spawn_error(argv: &[String], err: std::io::Error) -> TnError {
        if err.kind() == std::io::ErrorKind::NotFound {
            TnError::command(format!("{} not found in PATH", argv[0]))
        } else {
            TnError::command(format!("failed to start `{}`: {}", argv.join(" "), err))
        }
    }
}

impl CommandExecutor for SystemExecutor {
    fn run<'a>(&'a self, argv: &'a [String], timeout: Duration) -> BoxFuture<'a, TnResult<CommandOutput>> {
        Box::pin(async move {
            let mut command = Self::command(argv)?;
            debug!("Executing: {}", argv.join(" "));

            match tokio::time::timeout(timeout, command.output()).await {
                Err(_) => {
                    warn!("Command timed out after {:?}: {}", timeout, argv.join(" "));
                    Err(TnError::Timeout {
                        operation: argv.join(" "),
                        secs: timeout.as_secs(),
                    })
                }
                Ok(Err(e)) => Err(Self::spawn_error(argv, e)),
                Ok(Ok(output)) => Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                }),
            }
        })
    }

    fn spawn<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, TnResult<Box<dyn ProcessHandle>>> {
        Box::pin(async move {
            let mut command = Self::command(argv)?;
            command.stdout(Stdio::null()).stderr(Stdio::null());
            debug!("Spawning: {}", argv.join(" "));
            let child = command.spawn().map_err(|e| Self::spawn_error(argv, e))?;
            Ok(Box::new(SystemProcess { child }) as Box<dyn ProcessHandle>)
        })
    }
}

struct SystemProcess {
    child: Child,
}

impl ProcessHandle for SystemProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) -> BoxFuture<'_, TnResult<()>> {
        Box::pin(async move {
            if self.has_exited() {
                return Ok(());
            }
            self.child.kill().await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_system_executor_captures_output() {
        let executor = SystemExecutor::new();
        let output = executor
            .run(&argv(&["echo", "hello; rm -rf /"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello; rm -rf /");
    }

    #[tokio::test]
    async fn test_system_executor_times_out() {
        let executor = SystemExecutor::new();
        let err = executor
            .run(&argv(&["sleep", "5"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TnError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_command_error() {
        let executor = SystemExecutor::new();
        let err = executor
            .run(&argv(&["definitely-not-a-real-tool-xyz"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_run_checked_reports_exit_code() {
        let executor = SystemExecutor::new();
        let err = run_checked(&executor, &argv(&["false"]), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 1"));
    }
}
