//! Node runtime: composes topology, links, routing and dispatch into a
//! running tree node.

pub mod node;

pub use node::{NodeRuntime, MEMBERSHIP_EVENT};
