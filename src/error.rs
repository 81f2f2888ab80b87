//! Error types for the tree overlay

use std::fmt;
use uuid::Uuid;

use crate::NodeId;

/// Errors that can occur on a link
#[derive(Debug, Clone)]
pub enum LinkError {
    /// Peer has no link in the CONNECTED state
    Unavailable { peer: NodeId },

    /// The peer's bounded outbound queue is full
    Backpressure { peer: NodeId },

    /// Failed to reach the remote address
    Dial { addr: String, reason: String },

    /// The hello exchange failed or was rejected
    Handshake { reason: String },

    /// The link was closed while the operation was in flight
    Closed { peer: NodeId },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Unavailable { peer } => {
                write!(f, "no connected link to peer {}", peer)
            }
            LinkError::Backpressure { peer } => {
                write!(f, "outbound queue full for peer {}", peer)
            }
            LinkError::Dial { addr, reason } => {
                write!(f, "failed to dial {}: {}", addr, reason)
            }
            LinkError::Handshake { reason } => {
                write!(f, "link handshake failed: {}", reason)
            }
            LinkError::Closed { peer } => {
                write!(f, "link to peer {} closed", peer)
            }
        }
    }
}

impl std::error::Error for LinkError {}

/// Errors raised by topology mutations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The mutation would violate the tree shape (cycle or duplicate parent)
    Conflict { reason: String },

    /// The referenced node is not a known child
    UnknownChild { peer: NodeId },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyError::Conflict { reason } => {
                write!(f, "topology conflict: {}", reason)
            }
            TopologyError::UnknownChild { peer } => {
                write!(f, "node {} is not a known child", peer)
            }
        }
    }
}

impl std::error::Error for TopologyError {}

/// Errors that can occur while routing an event
#[derive(Debug, Clone)]
pub enum RouteError {
    /// TTL reached zero before the event left this node
    LoopDetected { event_id: Uuid },

    /// The router is shutting down and no longer accepts events
    Closed,
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::LoopDetected { event_id } => {
                write!(f, "event {} exhausted its TTL", event_id)
            }
            RouteError::Closed => write!(f, "event router is closed"),
        }
    }
}

impl std::error::Error for RouteError {}

/// Errors from the wire envelope conversion layer
#[derive(Debug, Clone)]
pub enum WireError {
    /// Remote speaks a protocol version we do not understand
    Version { got: u32 },

    /// The envelope carried no kind
    MissingKind,

    /// A field could not be decoded
    InvalidField { field: &'static str, reason: String },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Version { got } => {
                write!(f, "unsupported protocol version {}", got)
            }
            WireError::MissingKind => write!(f, "envelope has no kind"),
            WireError::InvalidField { field, reason } => {
                write!(f, "invalid field {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Errors from the persisted state store
#[derive(Debug)]
pub enum StateError {
    /// Underlying I/O failure
    Io { reason: String },

    /// Stored snapshot could not be decoded
    Corrupt { reason: String },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Io { reason } => write!(f, "state store I/O error: {}", reason),
            StateError::Corrupt { reason } => {
                write!(f, "persisted snapshot is corrupt: {}", reason)
            }
        }
    }
}

impl std::error::Error for StateError {}

/// Errors raised while loading node configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Could not read the artifact file
    Io { path: String, reason: String },

    /// The artifact is not valid JSON or misses required fields
    Parse { reason: String },

    /// The artifact decoded but describes an unusable configuration
    Invalid { reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, reason } => {
                write!(f, "failed to read config {}: {}", path, reason)
            }
            ConfigError::Parse { reason } => {
                write!(f, "failed to parse config: {}", reason)
            }
            ConfigError::Invalid { reason } => {
                write!(f, "invalid config: {}", reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
