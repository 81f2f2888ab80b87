//! Event routing along the tree

pub mod dedup;
pub mod event;
pub mod router;

pub use dedup::DedupCache;
pub use event::{Direction, DirectionKind, Event, EventId};
pub use router::{EventFilter, EventRouter, RouteOutcome};
