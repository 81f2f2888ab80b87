//! Event router
//!
//! Decides, per event and per hop, where an envelope travels next: up
//! toward the parent, down to children, or into local subscribers.
//! De-duplicates against the shared seen-ID cache, enforces TTL, and
//! sheds load per child on backpressure instead of stalling the tree.

use std::sync::{Arc, Mutex as StdMutex};

use slog::{debug, warn, Logger};
use tokio::sync::{mpsc, watch};

use crate::error::LinkError;
use crate::link::LinkManager;
use crate::routing::dedup::DedupCache;
use crate::routing::event::{Direction, DirectionKind, Event, EventId};
use crate::topology::TopologySnapshot;
use crate::wire::Envelope;
use crate::NodeId;

/// What a subscriber wants to see. Empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub direction: Option<DirectionKind>,
    pub name: Option<String>,
}

impl EventFilter {
    pub fn any() -> Self {
        EventFilter::default()
    }

    pub fn for_name(name: impl Into<String>) -> Self {
        EventFilter {
            direction: None,
            name: Some(name.into()),
        }
    }

    pub fn for_direction(direction: DirectionKind) -> Self {
        EventFilter {
            direction: Some(direction),
            name: None,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(direction) = self.direction {
            if event.direction.kind() != direction {
                return false;
            }
        }
        if let Some(ref name) = self.name {
            if event.name != *name {
                return false;
            }
        }
        true
    }
}

/// What happened to one event at this hop.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RouteOutcome {
    pub delivered_local: bool,
    pub forwarded: Vec<NodeId>,
    /// Children whose queue was full; the event was dropped for them.
    pub backpressured: Vec<NodeId>,
    pub duplicate: bool,
    pub ttl_expired: bool,
}

pub struct EventRouter {
    self_id: NodeId,
    links: Arc<LinkManager>,
    topo: watch::Receiver<TopologySnapshot>,
    dedup: Arc<StdMutex<DedupCache>>,
    subscribers: StdMutex<Vec<(EventFilter, mpsc::UnboundedSender<Event>)>>,
    default_ttl: u32,
    logger: Logger,
}

impl EventRouter {
    pub fn new(
        self_id: NodeId,
        links: Arc<LinkManager>,
        topo: watch::Receiver<TopologySnapshot>,
        dedup: Arc<StdMutex<DedupCache>>,
        default_ttl: u32,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(EventRouter {
            self_id,
            links,
            topo,
            dedup,
            subscribers: StdMutex::new(Vec::new()),
            default_ttl,
            logger,
        })
    }

    /// Publish an event originating at this node.
    pub async fn publish(
        &self,
        direction: Direction,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> EventId {
        let event = Event::new(
            self.self_id.clone(),
            direction,
            name,
            payload,
            self.default_ttl,
        );
        let id = event.event_id;
        self.route(event, None).await;
        id
    }

    /// Register a subscriber. Events matching the filter are delivered
    /// on the returned channel until the receiver is dropped.
    pub fn subscribe(&self, filter: EventFilter) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push((filter, tx));
        rx
    }

    /// Route an event received from a link.
    pub async fn handle_inbound(&self, from: &NodeId, event: Event) -> RouteOutcome {
        self.route(event, Some(from)).await
    }

    async fn route(&self, event: Event, from: Option<&NodeId>) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        {
            let mut dedup = match self.dedup.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !dedup.observe(event.event_id) {
                debug!(self.logger, "dropping duplicate event";
                    "event_id" => %event.event_id);
                outcome.duplicate = true;
                return outcome;
            }
        }

        if event.ttl == 0 {
            warn!(self.logger, "event TTL exhausted, dropping";
                "event_id" => %event.event_id, "name" => %event.name,
                "origin" => %event.origin);
            outcome.ttl_expired = true;
            return outcome;
        }

        let snapshot = self.topo.borrow().clone();
        let mut forward = event.clone();
        forward.ttl -= 1;

        match &event.direction {
            Direction::Up => {
                if snapshot.is_root() {
                    outcome.delivered_local = self.deliver_local(&event);
                } else {
                    self.forward_up(forward, &mut outcome).await;
                }
            }
            Direction::DownAll => {
                outcome.delivered_local = self.deliver_local(&event);
                let failures = self
                    .links
                    .broadcast_children(Envelope::Event(forward))
                    .await;
                let children = self.links.child_peers().await;
                for child in children {
                    if !failures.iter().any(|(peer, _)| *peer == child) {
                        outcome.forwarded.push(child);
                    }
                }
                self.record_failures(failures, &event, &mut outcome);
            }
            Direction::DownSubset(targets) => {
                if targets.iter().any(|t| *t == self.self_id) {
                    outcome.delivered_local = self.deliver_local(&event);
                }
                let mut failures = Vec::new();
                for child in snapshot.route_down_targets(targets) {
                    if Some(&child) == from {
                        continue;
                    }
                    match self
                        .links
                        .send(&child, Envelope::Event(forward.clone()))
                        .await
                    {
                        Ok(()) => outcome.forwarded.push(child),
                        Err(e) => failures.push((child, e)),
                    }
                }
                self.record_failures(failures, &event, &mut outcome);
            }
        }

        outcome
    }

    async fn forward_up(&self, event: Event, outcome: &mut RouteOutcome) {
        let Some(parent) = self.links.parent_peer().await else {
            warn!(self.logger, "no parent link for upward event, dropping";
                "event_id" => %event.event_id, "name" => %event.name);
            return;
        };
        match self.links.send(&parent, Envelope::Event(event)).await {
            Ok(()) => outcome.forwarded.push(parent),
            Err(LinkError::Backpressure { peer }) => {
                warn!(self.logger, "parent link backpressured, event dropped";
                    "peer" => %peer);
                outcome.backpressured.push(peer);
            }
            Err(e) => {
                warn!(self.logger, "failed to forward event upward"; "error" => %e);
            }
        }
    }

    fn record_failures(
        &self,
        failures: Vec<(NodeId, LinkError)>,
        event: &Event,
        outcome: &mut RouteOutcome,
    ) {
        for (peer, error) in failures {
            match error {
                LinkError::Backpressure { .. } => {
                    warn!(self.logger, "child backpressured, event dropped for subtree";
                        "peer" => %peer, "event_id" => %event.event_id);
                    outcome.backpressured.push(peer);
                }
                e => {
                    warn!(self.logger, "failed to forward event to child";
                        "peer" => %peer, "error" => %e);
                }
            }
        }
    }

    /// Hand the event to every matching local subscriber. Returns true
    /// when at least one subscriber received it.
    fn deliver_local(&self, event: &Event) -> bool {
        let mut delivered = false;
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|(filter, tx)| {
            if !filter.matches(event) {
                return !tx.is_closed();
            }
            match tx.send(event.clone()) {
                Ok(()) => {
                    delivered = true;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    fn lock_subscribers(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(EventFilter, mpsc::UnboundedSender<Event>)>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{InMemoryHub, LinkSettings};
    use std::time::Duration;

    fn router_fixture(
        self_id: &str,
    ) -> (Arc<EventRouter>, watch::Sender<TopologySnapshot>) {
        let logger = Logger::root(slog::Discard, slog::o!());
        let hub = InMemoryHub::new();
        let (topo_tx, topo_rx) =
            watch::channel(TopologySnapshot::empty(self_id.to_string()));
        let (links, _inbound, _events) = LinkManager::new(
            self_id.to_string(),
            LinkSettings::default(),
            hub.dialer(),
            topo_rx.clone(),
            logger.clone(),
        );
        let dedup = Arc::new(StdMutex::new(DedupCache::new(
            Duration::from_secs(60),
            128,
        )));
        let router = EventRouter::new(
            self_id.to_string(),
            links,
            topo_rx,
            dedup,
            16,
            logger,
        );
        (router, topo_tx)
    }

    #[tokio::test]
    async fn test_down_all_delivers_locally_at_root() {
        let (router, _topo) = router_fixture("root");
        let mut rx = router.subscribe(EventFilter::any());

        router
            .publish(Direction::DownAll, "cfg.changed", b"v2".to_vec())
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "cfg.changed");
        assert_eq!(event.payload, b"v2");
    }

    #[tokio::test]
    async fn test_up_is_terminal_at_root() {
        let (router, _topo) = router_fixture("root");
        let mut rx = router.subscribe(EventFilter::for_direction(DirectionKind::Up));

        router.publish(Direction::Up, "alert", vec![]).await;
        assert_eq!(rx.recv().await.unwrap().name, "alert");
    }

    #[tokio::test]
    async fn test_name_filter_excludes_other_events() {
        let (router, _topo) = router_fixture("root");
        let mut wanted = router.subscribe(EventFilter::for_name("wanted"));
        let mut all = router.subscribe(EventFilter::any());

        router.publish(Direction::DownAll, "noise", vec![]).await;
        router.publish(Direction::DownAll, "wanted", vec![]).await;

        assert_eq!(wanted.recv().await.unwrap().name, "wanted");
        assert_eq!(all.recv().await.unwrap().name, "noise");
        assert_eq!(all.recv().await.unwrap().name, "wanted");
    }

    #[tokio::test]
    async fn test_duplicate_event_not_redelivered() {
        let (router, _topo) = router_fixture("root");
        let mut rx = router.subscribe(EventFilter::any());

        let event = Event::new(
            "other".to_string(),
            Direction::DownAll,
            "once",
            vec![],
            8,
        );
        let first = router.handle_inbound(&"p".to_string(), event.clone()).await;
        let second = router.handle_inbound(&"p".to_string(), event).await;

        assert!(first.delivered_local);
        assert!(second.duplicate);
        assert!(!second.delivered_local);

        assert_eq!(rx.recv().await.unwrap().name, "once");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exhausted_ttl_drops_event() {
        let (router, _topo) = router_fixture("root");
        let mut rx = router.subscribe(EventFilter::any());

        let event = Event::new("other".to_string(), Direction::DownAll, "late", vec![], 0);
        let outcome = router.handle_inbound(&"p".to_string(), event).await;

        assert!(outcome.ttl_expired);
        assert!(!outcome.delivered_local);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_down_subset_delivers_only_when_targeted() {
        let (router, _topo) = router_fixture("n5");
        let mut rx = router.subscribe(EventFilter::any());

        let miss = Event::new(
            "root".to_string(),
            Direction::DownSubset(vec!["n9".to_string()]),
            "miss",
            vec![],
            8,
        );
        let hit = Event::new(
            "root".to_string(),
            Direction::DownSubset(vec!["n5".to_string()]),
            "hit",
            vec![],
            8,
        );
        let miss_outcome = router.handle_inbound(&"p".to_string(), miss).await;
        let hit_outcome = router.handle_inbound(&"p".to_string(), hit).await;

        assert!(!miss_outcome.delivered_local);
        assert!(hit_outcome.delivered_local);
        assert_eq!(rx.recv().await.unwrap().name, "hit");
        assert!(rx.try_recv().is_err());
    }
}
