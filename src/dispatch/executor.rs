//! Local command execution
//!
//! Commands routed to this node run through a bounded worker pool so a
//! broad fan-out cannot fork-bomb the host.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, warn, Logger};
use tokio::sync::Semaphore;

use crate::dispatch::types::{CommandResult, CommandSpec, CommandStatus};
use crate::NodeId;

/// Seam for executing a command locally. The dispatcher calls this for
/// every command that targets the local node; swapping the runner is how
/// embedders replace shell execution with their own handler.
#[tonic::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, node_id: &NodeId, spec: &CommandSpec, timeout: Duration) -> CommandResult;
}

/// Runs commands through `sh -c`, at most `max_concurrent` at a time.
pub struct ShellRunner {
    permits: Arc<Semaphore>,
    logger: Logger,
}

impl ShellRunner {
    pub fn new(max_concurrent: usize, logger: Logger) -> Arc<Self> {
        Arc::new(ShellRunner {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            logger,
        })
    }
}

#[tonic::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, node_id: &NodeId, spec: &CommandSpec, timeout: Duration) -> CommandResult {
        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return CommandResult {
                    node_id: node_id.clone(),
                    status: CommandStatus::ExecError,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some("executor shut down".to_string()),
                }
            }
        };

        debug!(self.logger, "running command"; "command" => %spec.command);
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&spec.command)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;
        drop(permit);

        match output {
            Err(_) => {
                warn!(self.logger, "command timed out"; "command" => %spec.command);
                CommandResult {
                    node_id: node_id.clone(),
                    status: CommandStatus::TimedOut,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    error: Some(format!("exceeded {:?}", timeout)),
                }
            }
            Ok(Err(e)) => CommandResult {
                node_id: node_id.clone(),
                status: CommandStatus::ExecError,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("spawn failed: {}", e)),
            },
            Ok(Ok(output)) => {
                let status = if output.status.success() {
                    CommandStatus::Ok
                } else {
                    CommandStatus::ExecError
                };
                CommandResult {
                    node_id: node_id.clone(),
                    status,
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    error: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Arc<ShellRunner> {
        ShellRunner::new(2, Logger::root(slog::Discard, slog::o!()))
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let result = runner()
            .run(
                &"n1".to_string(),
                &CommandSpec::shell("echo hello"),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.status, CommandStatus::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.node_id, "n1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exec_error() {
        let result = runner()
            .run(
                &"n1".to_string(),
                &CommandSpec::shell("echo oops >&2; exit 3"),
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(result.status, CommandStatus::ExecError);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let result = runner()
            .run(
                &"n1".to_string(),
                &CommandSpec::shell("sleep 5"),
                Duration::from_millis(50),
            )
            .await;

        assert_eq!(result.status, CommandStatus::TimedOut);
        assert_eq!(result.exit_code, None);
    }
}
