//! Links to tree neighbors: connection state, liveness, transport

pub mod backoff;
pub mod manager;
pub mod memory;

pub use backoff::BackoffPolicy;
pub use manager::{
    DialedLink, Inbound, LinkDialer, LinkEvent, LinkManager, LinkRole, LinkSettings, LinkState,
};
pub use memory::{InMemoryDialer, InMemoryHub};
