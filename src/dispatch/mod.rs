//! Command fan-out and result aggregation

pub mod dispatcher;
pub mod executor;
pub mod types;

pub use dispatcher::CommandDispatcher;
pub use executor::{CommandRunner, ShellRunner};
pub use types::{
    CommandEnvelope, CommandResponseSet, CommandResult, CommandSpec, CommandStatus, RequestId,
    ResultEnvelope,
};
