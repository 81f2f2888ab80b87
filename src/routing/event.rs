//! Routed events

use uuid::Uuid;

use crate::NodeId;

pub type EventId = Uuid;

/// Where an event travels from the node currently holding it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Toward the root; locally terminal there.
    Up,
    /// To every node below this one.
    DownAll,
    /// Down, but only subtrees containing one of the targets care.
    DownSubset(Vec<NodeId>),
}

impl Direction {
    pub fn kind(&self) -> DirectionKind {
        match self {
            Direction::Up => DirectionKind::Up,
            Direction::DownAll => DirectionKind::DownAll,
            Direction::DownSubset(_) => DirectionKind::DownSubset,
        }
    }
}

/// Direction without its payload, for subscription filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionKind {
    Up,
    DownAll,
    DownSubset,
}

/// An event moving through the tree.
///
/// Immutable after creation; forwarding only decrements the TTL on the
/// copy it sends onward.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub origin: NodeId,
    pub direction: Direction,
    pub name: String,
    pub payload: Vec<u8>,
    pub ttl: u32,
}

impl Event {
    pub fn new(
        origin: NodeId,
        direction: Direction,
        name: impl Into<String>,
        payload: Vec<u8>,
        ttl: u32,
    ) -> Self {
        Event {
            event_id: Uuid::new_v4(),
            origin,
            direction,
            name: name.into(),
            payload,
            ttl,
        }
    }
}
