//! Tree membership: the node's view of its parent, children and, when
//! reported, the descendants under each child.

pub mod snapshot;
pub mod store;

pub use snapshot::{JsonStateStore, NullStateStore, StateStore, TopologySnapshot};
pub use store::TopologyStore;
