//! Command fan-out data model

use std::collections::BTreeMap;
use std::time::Duration;

use uuid::Uuid;

use crate::NodeId;

pub type RequestId = Uuid;

/// What to run on each target node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    /// Shell command line, executed via `sh -c`.
    pub command: String,
}

impl CommandSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandSpec {
            command: command.into(),
        }
    }
}

/// Per-target outcome classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// The command ran and exited zero.
    Ok,
    /// The command ran and failed, or could not be spawned.
    ExecError,
    /// No result arrived before the request deadline.
    TimedOut,
    /// The target sat behind a dead link or is unknown to the tree.
    Unreachable,
}

/// Outcome of one command on one node.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResult {
    pub node_id: NodeId,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandResult {
    pub fn timed_out(node_id: NodeId) -> Self {
        CommandResult {
            node_id,
            status: CommandStatus::TimedOut,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }

    pub fn unreachable(node_id: NodeId) -> Self {
        CommandResult {
            node_id,
            status: CommandStatus::Unreachable,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }
}

/// Everything the issuer got back for one request, keyed by target.
///
/// Always complete: targets that never answered are present with
/// `TimedOut` or `Unreachable` status rather than silently missing.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponseSet {
    pub request_id: RequestId,
    pub results: BTreeMap<NodeId, CommandResult>,
}

impl CommandResponseSet {
    pub fn result_for(&self, node_id: &str) -> Option<&CommandResult> {
        self.results.get(node_id)
    }

    pub fn ok_count(&self) -> usize {
        self.results
            .values()
            .filter(|r| r.status == CommandStatus::Ok)
            .count()
    }
}

/// A command request as it travels down the tree.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandEnvelope {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub targets: Vec<NodeId>,
    pub spec: CommandSpec,
    pub timeout: Duration,
    pub ttl: u32,
}

/// An aggregated batch of results traveling back up.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultEnvelope {
    pub request_id: RequestId,
    pub origin: NodeId,
    pub results: Vec<CommandResult>,
    /// False when a relay deadline forced a partial flush; the sender's
    /// subtree may still produce more results.
    pub complete: bool,
    pub ttl: u32,
}
