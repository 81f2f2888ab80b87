pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod link;
pub mod routing;
pub mod runtime;
pub mod topology;
pub mod wire;

/// Opaque node identifier, assigned by configuration and immutable for
/// the life of the node.
pub type NodeId = String;

pub use config::{NodeConfig, Tuning};
pub use dispatch::{
    CommandResponseSet, CommandResult, CommandRunner, CommandSpec, CommandStatus, ShellRunner,
};
pub use error::{ConfigError, LinkError, RouteError, StateError, TopologyError, WireError};
pub use grpc::{start_grpc_server, GrpcDialer, GrpcServerHandle};
pub use link::{InMemoryHub, LinkDialer, LinkEvent, LinkManager, LinkRole, LinkState};
pub use routing::{Direction, Event, EventFilter, EventId, EventRouter};
pub use runtime::NodeRuntime;
pub use topology::{JsonStateStore, NullStateStore, StateStore, TopologySnapshot};
pub use wire::{Envelope, PROTOCOL_VERSION};
