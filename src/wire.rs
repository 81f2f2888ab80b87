//! Wire envelope model and protobuf conversions
//!
//! Everything crossing a link is an [`Envelope`]. The protobuf schema in
//! `proto/canopy.proto` is the versioned wire form; this module owns the
//! mapping between the generated types and the domain types, so the rest
//! of the crate never touches raw protobuf.

use std::time::Duration;

use uuid::Uuid;

use crate::dispatch::types::{
    CommandEnvelope, CommandResult, CommandSpec, CommandStatus, ResultEnvelope,
};
use crate::error::WireError;
use crate::grpc::pb;
use crate::link::LinkRole;
use crate::routing::event::{Direction, Event};
use crate::NodeId;

/// Wire protocol version. A remote speaking a different version is
/// rejected at the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// First frame exchanged in each direction on a new link.
#[derive(Clone, Debug, PartialEq)]
pub struct Hello {
    pub node_id: NodeId,
    pub protocol: u32,
    /// The sender's role on this link.
    pub role: LinkRole,
    /// The sender's subtree, itself included.
    pub subtree: Vec<NodeId>,
}

/// A message on a link, one variant per wire kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Hello(Hello),
    Heartbeat { seq: u64 },
    Event(Event),
    Command(CommandEnvelope),
    Result(ResultEnvelope),
}

impl Envelope {
    /// Kind label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello(_) => "hello",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Event(_) => "event",
            Envelope::Command(_) => "command",
            Envelope::Result(_) => "result",
        }
    }

    pub fn into_proto(self) -> pb::Envelope {
        match self {
            Envelope::Hello(hello) => pb::Envelope {
                version: PROTOCOL_VERSION,
                origin: hello.node_id.clone(),
                ttl: 0,
                kind: Some(pb::envelope::Kind::Hello(pb::Hello {
                    node_id: hello.node_id,
                    protocol: hello.protocol,
                    role: role_to_proto(hello.role) as i32,
                    subtree: hello.subtree,
                })),
            },
            Envelope::Heartbeat { seq } => pb::Envelope {
                version: PROTOCOL_VERSION,
                origin: String::new(),
                ttl: 0,
                kind: Some(pb::envelope::Kind::Heartbeat(pb::Heartbeat { seq })),
            },
            Envelope::Event(event) => {
                let (direction, targets) = match event.direction {
                    Direction::Up => (pb::Direction::Up, Vec::new()),
                    Direction::DownAll => (pb::Direction::DownAll, Vec::new()),
                    Direction::DownSubset(targets) => (pb::Direction::DownSubset, targets),
                };
                pb::Envelope {
                    version: PROTOCOL_VERSION,
                    origin: event.origin,
                    ttl: event.ttl,
                    kind: Some(pb::envelope::Kind::Event(pb::EventFrame {
                        event_id: event.event_id.to_string(),
                        direction: direction as i32,
                        targets,
                        name: event.name,
                        payload: event.payload,
                    })),
                }
            }
            Envelope::Command(cmd) => pb::Envelope {
                version: PROTOCOL_VERSION,
                origin: cmd.origin,
                ttl: cmd.ttl,
                kind: Some(pb::envelope::Kind::Command(pb::CommandFrame {
                    request_id: cmd.request_id.to_string(),
                    targets: cmd.targets,
                    command: cmd.spec.command,
                    timeout_ms: cmd.timeout.as_millis() as u64,
                })),
            },
            Envelope::Result(res) => pb::Envelope {
                version: PROTOCOL_VERSION,
                origin: res.origin,
                ttl: res.ttl,
                kind: Some(pb::envelope::Kind::Result(pb::ResultFrame {
                    request_id: res.request_id.to_string(),
                    results: res.results.into_iter().map(result_to_proto).collect(),
                    complete: res.complete,
                })),
            },
        }
    }

    pub fn from_proto(env: pb::Envelope) -> Result<Envelope, WireError> {
        if env.version != PROTOCOL_VERSION {
            return Err(WireError::Version { got: env.version });
        }
        let kind = env.kind.ok_or(WireError::MissingKind)?;

        match kind {
            pb::envelope::Kind::Hello(hello) => Ok(Envelope::Hello(Hello {
                node_id: hello.node_id,
                protocol: hello.protocol,
                role: role_from_proto(hello.role)?,
                subtree: hello.subtree,
            })),
            pb::envelope::Kind::Heartbeat(hb) => Ok(Envelope::Heartbeat { seq: hb.seq }),
            pb::envelope::Kind::Event(frame) => {
                let direction = match pb::Direction::try_from(frame.direction) {
                    Ok(pb::Direction::Up) => Direction::Up,
                    Ok(pb::Direction::DownAll) => Direction::DownAll,
                    Ok(pb::Direction::DownSubset) => Direction::DownSubset(frame.targets),
                    _ => {
                        return Err(WireError::InvalidField {
                            field: "direction",
                            reason: format!("unknown value {}", frame.direction),
                        })
                    }
                };
                Ok(Envelope::Event(Event {
                    event_id: parse_uuid("event_id", &frame.event_id)?,
                    origin: env.origin,
                    direction,
                    name: frame.name,
                    payload: frame.payload,
                    ttl: env.ttl,
                }))
            }
            pb::envelope::Kind::Command(frame) => Ok(Envelope::Command(CommandEnvelope {
                request_id: parse_uuid("request_id", &frame.request_id)?,
                origin: env.origin,
                targets: frame.targets,
                spec: CommandSpec {
                    command: frame.command,
                },
                timeout: Duration::from_millis(frame.timeout_ms),
                ttl: env.ttl,
            })),
            pb::envelope::Kind::Result(frame) => Ok(Envelope::Result(ResultEnvelope {
                request_id: parse_uuid("request_id", &frame.request_id)?,
                origin: env.origin,
                results: frame
                    .results
                    .into_iter()
                    .map(result_from_proto)
                    .collect::<Result<_, _>>()?,
                complete: frame.complete,
                ttl: env.ttl,
            })),
        }
    }
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, WireError> {
    Uuid::parse_str(value).map_err(|e| WireError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn role_to_proto(role: LinkRole) -> pb::LinkRole {
    match role {
        LinkRole::Parent => pb::LinkRole::Parent,
        LinkRole::Child => pb::LinkRole::Child,
    }
}

fn role_from_proto(value: i32) -> Result<LinkRole, WireError> {
    match pb::LinkRole::try_from(value) {
        Ok(pb::LinkRole::Parent) => Ok(LinkRole::Parent),
        Ok(pb::LinkRole::Child) => Ok(LinkRole::Child),
        _ => Err(WireError::InvalidField {
            field: "role",
            reason: format!("unknown value {}", value),
        }),
    }
}

pub(crate) fn result_to_proto(result: CommandResult) -> pb::CommandResult {
    let status = match result.status {
        CommandStatus::Ok => pb::ResultStatus::Ok,
        CommandStatus::ExecError => pb::ResultStatus::ExecError,
        CommandStatus::TimedOut => pb::ResultStatus::TimedOut,
        CommandStatus::Unreachable => pb::ResultStatus::Unreachable,
    };
    pb::CommandResult {
        node_id: result.node_id,
        status: status as i32,
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        error: result.error,
    }
}

pub(crate) fn result_from_proto(result: pb::CommandResult) -> Result<CommandResult, WireError> {
    let status = match pb::ResultStatus::try_from(result.status) {
        Ok(pb::ResultStatus::Ok) => CommandStatus::Ok,
        Ok(pb::ResultStatus::ExecError) => CommandStatus::ExecError,
        Ok(pb::ResultStatus::TimedOut) => CommandStatus::TimedOut,
        Ok(pb::ResultStatus::Unreachable) => CommandStatus::Unreachable,
        _ => {
            return Err(WireError::InvalidField {
                field: "status",
                reason: format!("unknown value {}", result.status),
            })
        }
    };
    Ok(CommandResult {
        node_id: result.node_id,
        status,
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
        error: result.error,
    })
}
