//! Scripted executor for tests.
//!
//! Commands succeed with empty output unless a rule matches. Rules match on
//! the space-joined argv prefix and the most recently added rule wins.
//! Spawned `iperf3 -s -p <port>` processes bind a real loopback listener so
//! readiness probes and port-busy checks behave as they would with the tool.

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BoxFuture, CommandExecutor, CommandOutput, ProcessHandle};
use tn_shared::{TnError, TnResult};

#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Error(String),
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    reply: Reply,
    delay: Duration,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct FakeState {
    rules: Vec<Rule>,
    calls: Vec<String>,
    spawn_failures: Vec<String>,
    silent_spawns: Vec<String>,
}

/// In-memory [`CommandExecutor`] with scripted replies
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
    state: Arc<Mutex<FakeState>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, rule: Rule) {
        if let Ok(mut state) = self.state.lock() {
            state.rules.push(rule);
        }
    }

    /// Reply to commands starting with `prefix` with `stdout` and exit 0.
    pub fn respond(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
            delay: Duration::ZERO,
            remaining: None,
        });
        self
    }

    /// Like [`respond`](Self::respond) but only for the next `times` matches.
    pub fn respond_times(&self, prefix: &str, stdout: &str, times: usize) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
            delay: Duration::ZERO,
            remaining: Some(times),
        });
        self
    }

    /// Make commands starting with `prefix` exit with `exit_code`.
    pub fn fail(&self, prefix: &str, exit_code: i32, stderr: &str) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Output(CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            }),
            delay: Duration::ZERO,
            remaining: None,
        });
        self
    }

    /// Exit with `exit_code` after printing `stdout`, as ping does when no
    /// reply arrives.
    pub fn fail_with_output(&self, prefix: &str, exit_code: i32, stdout: &str) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Output(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            }),
            delay: Duration::ZERO,
            remaining: None,
        });
        self
    }

    /// Make commands starting with `prefix` fail to execute at all.
    pub fn error(&self, prefix: &str, message: &str) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Error(message.to_string()),
            delay: Duration::ZERO,
            remaining: None,
        });
        self
    }

    /// Delay commands starting with `prefix`. A delay beyond the caller's
    /// timeout produces a timeout error.
    pub fn delay(&self, prefix: &str, delay: Duration) -> &Self {
        self.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply::Output(CommandOutput::default()),
            delay,
            remaining: None,
        });
        self
    }

    /// Make `spawn` fail for commands starting with `prefix`.
    pub fn fail_spawn(&self, prefix: &str) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.spawn_failures.push(prefix.to_string());
        }
        self
    }

    /// Spawn commands starting with `prefix` without binding their port, so
    /// the process never becomes ready.
    pub fn spawn_silent(&self, prefix: &str) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.silent_spawns.push(prefix.to_string());
        }
        self
    }

    /// Every command run or spawned so far, space-joined, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    fn lookup(&self, line: &str) -> (Reply, Duration) {
        let Ok(mut state) = self.state.lock() else {
            return (Reply::Output(CommandOutput::default()), Duration::ZERO);
        };
        state.calls.push(line.to_string());
        let matched = state
            .rules
            .iter_mut()
            .rev()
            .find(|rule| line.starts_with(&rule.prefix) && rule.remaining != Some(0));
        match matched {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                (rule.reply.clone(), rule.delay)
            }
            None => (Reply::Output(CommandOutput::default()), Duration::ZERO),
        }
    }
}

impl CommandExecutor for FakeExecutor {
    fn run<'a>(&'a self, argv: &'a [String], timeout: Duration) -> BoxFuture<'a, TnResult<CommandOutput>> {
        Box::pin(async move {
            let line = argv.join(" ");
            let (reply, delay) = self.lookup(&line);
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(TnError::Timeout {
                    operation: line,
                    secs: timeout.as_secs(),
                });
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Output(output) => Ok(output),
                Reply::Error(message) => Err(TnError::command(message)),
            }
        })
    }

    fn spawn<'a>(&'a self, argv: &'a [String]) -> BoxFuture<'a, TnResult<Box<dyn ProcessHandle>>> {
        Box::pin(async move {
            let line = argv.join(" ");
            let (refused, silent) = {
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| TnError::command("fake executor state poisoned"))?;
                state.calls.push(line.clone());
                (
                    state.spawn_failures.iter().any(|p| line.starts_with(p)),
                    state.silent_spawns.iter().any(|p| line.starts_with(p)),
                )
            };
            if refused {
                return Err(TnError::command(format!("failed to start `{}`", line)));
            }

            let listener = match listen_port(argv) {
                Some(port) if !silent => Some(TcpListener::bind(("127.0.0.1", port))?),
                _ => None,
            };
            Ok(Box::new(FakeProcess {
                listener,
                exited: false,
            }) as Box<dyn ProcessHandle>)
        })
    }
}

/// Port of an `iperf3 -s -p <port>` command line.
fn listen_port(argv: &[String]) -> Option<u16> {
    if !argv.iter().any(|a| a == "-s") {
        return None;
    }
    argv.windows(2)
        .find(|pair| pair[0] == "-p")
        .and_then(|pair| pair[1].parse().ok())
}

struct FakeProcess {
    listener: Option<TcpListener>,
    exited: bool,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    fn kill(&mut self) -> BoxFuture<'_, TnResult<()>> {
        Box::pin(async move {
            self.listener.take();
            self.exited = true;
            Ok(())
        })
    }
}
