//! In-process link transport
//!
//! Wires multiple `LinkManager`s together through channels so whole
//! trees can run inside one test process without sockets. Mirrors what
//! the gRPC transport does: the dialer side gets a [`DialedLink`], the
//! accepting side goes through [`LinkManager::accept`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::LinkError;
use crate::link::manager::{DialedLink, LinkDialer, LinkManager};
use crate::wire::Hello;

/// Registry of dialable in-process endpoints, keyed by address string.
pub struct InMemoryHub {
    endpoints: Mutex<HashMap<String, Arc<LinkManager>>>,
    queue_depth: usize,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryHub {
            endpoints: Mutex::new(HashMap::new()),
            queue_depth: 64,
        })
    }

    pub async fn register(&self, addr: impl Into<String>, manager: Arc<LinkManager>) {
        self.endpoints.lock().await.insert(addr.into(), manager);
    }

    /// Make an address undialable, simulating a dead host. Links that
    /// are already up are not affected.
    pub async fn unregister(&self, addr: &str) {
        self.endpoints.lock().await.remove(addr);
    }

    pub fn dialer(self: &Arc<Self>) -> Arc<InMemoryDialer> {
        Arc::new(InMemoryDialer { hub: self.clone() })
    }
}

pub struct InMemoryDialer {
    hub: Arc<InMemoryHub>,
}

#[tonic::async_trait]
impl LinkDialer for InMemoryDialer {
    async fn dial(&self, addr: &str, hello: Hello) -> Result<DialedLink, LinkError> {
        let remote = {
            let endpoints = self.hub.endpoints.lock().await;
            endpoints.get(addr).cloned()
        }
        .ok_or_else(|| LinkError::Dial {
            addr: addr.to_string(),
            reason: "no such endpoint".to_string(),
        })?;

        let (to_remote_tx, mut to_remote_rx) = mpsc::channel(self.hub.queue_depth);
        let (to_dialer_tx, to_dialer_rx) = mpsc::channel(self.hub.queue_depth);

        let remote_hello = remote.local_hello(hello.role.opposite());
        let dialer_id = hello.node_id.clone();
        let gen = remote.accept(hello, to_dialer_tx).await?;

        // Read loop on the accepting side, the counterpart of what the
        // gRPC server spawns per attached stream.
        let remote_mgr = remote.clone();
        let peer = dialer_id.clone();
        tokio::spawn(async move {
            while let Some(envelope) = to_remote_rx.recv().await {
                if !remote_mgr.deliver_inbound(&peer, gen, envelope).await {
                    break;
                }
            }
            remote_mgr.peer_closed(&peer, gen).await;
        });

        Ok(DialedLink {
            peer: remote_hello.node_id,
            subtree: remote_hello.subtree,
            tx: to_remote_tx,
            rx: to_dialer_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::manager::{LinkEvent, LinkRole, LinkSettings};
    use crate::topology::TopologySnapshot;
    use crate::wire::Envelope;
    use slog::Logger;
    use tokio::sync::watch;

    fn node(
        id: &str,
        hub: &Arc<InMemoryHub>,
    ) -> (
        Arc<LinkManager>,
        mpsc::Receiver<crate::link::manager::Inbound>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (_topo_tx, topo_rx) = watch::channel(TopologySnapshot::empty(id.to_string()));
        LinkManager::new(
            id.to_string(),
            LinkSettings::default(),
            hub.dialer(),
            topo_rx,
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    #[tokio::test]
    async fn test_dial_establishes_both_sides() {
        let hub = InMemoryHub::new();
        let (parent, _p_in, mut p_events) = node("parent", &hub);
        let (child, _c_in, mut c_events) = node("child", &hub);
        hub.register("parent:4310", parent.clone()).await;

        child.connect("parent:4310".to_string(), LinkRole::Parent);

        assert!(matches!(
            c_events.recv().await,
            Some(LinkEvent::Connected { role: LinkRole::Parent, .. })
        ));
        assert!(matches!(
            p_events.recv().await,
            Some(LinkEvent::Connected { role: LinkRole::Child, .. })
        ));
        assert_eq!(child.parent_peer().await, Some("parent".to_string()));
        assert_eq!(parent.child_peers().await, vec!["child".to_string()]);
    }

    #[tokio::test]
    async fn test_envelopes_cross_the_link() {
        let hub = InMemoryHub::new();
        let (parent, mut p_in, _p_events) = node("parent", &hub);
        let (child, _c_in, mut c_events) = node("child", &hub);
        hub.register("parent:4310", parent.clone()).await;

        child.connect("parent:4310".to_string(), LinkRole::Parent);
        assert!(matches!(
            c_events.recv().await,
            Some(LinkEvent::Connected { .. })
        ));

        let event = crate::routing::Event::new(
            "child".to_string(),
            crate::routing::Direction::Up,
            "ping",
            vec![1, 2, 3],
            8,
        );
        child
            .send(&"parent".to_string(), Envelope::Event(event.clone()))
            .await
            .unwrap();

        let inbound = p_in.recv().await.unwrap();
        assert_eq!(inbound.from, "child");
        assert_eq!(inbound.envelope, Envelope::Event(event));
    }

    #[tokio::test]
    async fn test_dialing_dead_address_fails() {
        let hub = InMemoryHub::new();
        let dialer = hub.dialer();
        let hello = Hello {
            node_id: "n1".to_string(),
            protocol: crate::wire::PROTOCOL_VERSION,
            role: LinkRole::Child,
            subtree: vec!["n1".to_string()],
        };
        assert!(matches!(
            dialer.dial("nowhere:1", hello).await,
            Err(LinkError::Dial { .. })
        ));
    }
}
