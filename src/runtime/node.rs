//! Node runtime
//!
//! Owns the topology store and runs the single control task that every
//! other component feeds: inbound envelopes are matched on their kind
//! and handed to the router or dispatcher, link state changes mutate the
//! topology, and every confirmed topology change is persisted and
//! re-published as an immutable snapshot.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use slog::{debug, error, info, warn, Logger};
use tokio::sync::{mpsc, watch};

use crate::config::NodeConfig;
use crate::dispatch::{
    CommandDispatcher, CommandResponseSet, CommandRunner, CommandSpec, ShellRunner,
};
use crate::link::{Inbound, LinkDialer, LinkEvent, LinkManager, LinkRole};
use crate::routing::{DedupCache, Direction, Event, EventFilter, EventId, EventRouter};
use crate::topology::{StateStore, TopologySnapshot, TopologyStore};
use crate::wire::Envelope;
use crate::NodeId;

/// Internal event name nodes use to report their subtree upward. Each
/// hop refreshes its descendant cache from the payload and re-emits its
/// own membership, so changes ripple to the root.
pub const MEMBERSHIP_EVENT: &str = "canopy.membership";

pub struct NodeRuntime {
    config: NodeConfig,
    links: Arc<LinkManager>,
    router: Arc<EventRouter>,
    dispatcher: Arc<CommandDispatcher>,
    topo: watch::Receiver<TopologySnapshot>,
    shutdown_tx: watch::Sender<bool>,
    logger: Logger,
}

impl NodeRuntime {
    /// Start a node with the default shell command runner.
    pub async fn start(
        config: NodeConfig,
        dialer: Arc<dyn LinkDialer>,
        state_store: Arc<dyn StateStore>,
        logger: Logger,
    ) -> Arc<NodeRuntime> {
        let runner = ShellRunner::new(config.tuning.exec_concurrency, logger.clone());
        Self::start_with_runner(config, dialer, state_store, runner, logger).await
    }

    /// Start a node with a custom command runner (embedders, tests).
    pub async fn start_with_runner(
        config: NodeConfig,
        dialer: Arc<dyn LinkDialer>,
        state_store: Arc<dyn StateStore>,
        runner: Arc<dyn CommandRunner>,
        logger: Logger,
    ) -> Arc<NodeRuntime> {
        let self_id = config.node_id.clone();
        let logger = logger.new(slog::o!("node_id" => self_id.clone()));

        // Restart fallback: the persisted snapshot supplies the parent
        // address when the artifact names none.
        let recovered = match state_store.load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(logger, "ignoring unreadable persisted state"; "error" => %e);
                None
            }
        };

        let store = TopologyStore::new(self_id.clone());
        let (topo_tx, topo_rx) = watch::channel(store.snapshot());

        let (links, inbound_rx, events_rx) = LinkManager::new(
            self_id.clone(),
            config.link_settings(),
            dialer,
            topo_rx.clone(),
            logger.clone(),
        );

        let dedup = Arc::new(StdMutex::new(DedupCache::new(
            config.dedup_window(),
            config.tuning.dedup_capacity,
        )));
        let router = EventRouter::new(
            self_id.clone(),
            links.clone(),
            topo_rx.clone(),
            dedup.clone(),
            config.tuning.default_ttl,
            logger.clone(),
        );
        let dispatcher = CommandDispatcher::new(
            self_id.clone(),
            links.clone(),
            topo_rx.clone(),
            runner,
            dedup,
            config.tuning.default_ttl,
            logger.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let parent_addr = config
            .parent_addr
            .clone()
            .or_else(|| recovered.as_ref().and_then(|s| s.parent_addr.clone()));
        if config.parent_addr.is_none() && parent_addr.is_some() {
            info!(logger, "recovered parent address from persisted state");
        }

        let control = ControlState {
            store,
            topo_tx,
            state_store,
            router: router.clone(),
            dispatcher: dispatcher.clone(),
            links: links.clone(),
            fallbacks: config.fallback_parents.clone(),
            current_parent_addr: parent_addr.clone(),
            logger: logger.clone(),
        };
        tokio::spawn(control.run(inbound_rx, events_rx, shutdown_rx));

        if let Some(addr) = parent_addr {
            links.connect(addr, LinkRole::Parent);
        }
        for child_addr in &config.bootstrap_children {
            links.connect(child_addr.clone(), LinkRole::Child);
        }

        info!(logger, "node runtime started";
            "listen" => %config.listen,
            "root" => config.parent_addr.is_none());

        Arc::new(NodeRuntime {
            config,
            links,
            router,
            dispatcher,
            topo: topo_rx,
            shutdown_tx,
            logger,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn links(&self) -> &Arc<LinkManager> {
        &self.links
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> TopologySnapshot {
        self.topo.borrow().clone()
    }

    pub fn topology_watch(&self) -> watch::Receiver<TopologySnapshot> {
        self.topo.clone()
    }

    /// Publish an event from this node.
    pub async fn publish(
        &self,
        direction: Direction,
        name: impl Into<String>,
        payload: Vec<u8>,
    ) -> EventId {
        self.router.publish(direction, name, payload).await
    }

    /// Subscribe to events delivered at this node.
    pub fn subscribe(&self, filter: EventFilter) -> mpsc::UnboundedReceiver<Event> {
        self.router.subscribe(filter)
    }

    /// Fan a command out to `targets` and collect the results. The
    /// operator-facing entry point.
    pub async fn execute(
        &self,
        targets: Vec<NodeId>,
        spec: CommandSpec,
        timeout: Duration,
    ) -> CommandResponseSet {
        self.dispatcher.execute(targets, spec, timeout).await
    }

    /// Outstanding command requests (diagnostics).
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.pending_len()
    }

    pub async fn shutdown(&self) {
        info!(self.logger, "node runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        self.links.shutdown().await;
    }
}

/// State owned by the control task. Nothing else mutates the topology.
struct ControlState {
    store: TopologyStore,
    topo_tx: watch::Sender<TopologySnapshot>,
    state_store: Arc<dyn StateStore>,
    router: Arc<EventRouter>,
    dispatcher: Arc<CommandDispatcher>,
    links: Arc<LinkManager>,
    /// Re-parent candidates not yet tried.
    fallbacks: Vec<String>,
    current_parent_addr: Option<String>,
    logger: Logger,
}

impl ControlState {
    async fn run(
        mut self,
        mut inbound_rx: mpsc::Receiver<Inbound>,
        mut events_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(self.logger, "control task stopping");
                    return;
                }
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => return,
                },
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_link_event(event).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { from, envelope } = inbound;
        match envelope {
            Envelope::Event(event) => {
                if event.name == MEMBERSHIP_EVENT && self.store.children().contains(&from) {
                    self.apply_membership(&from, &event.payload).await;
                } else {
                    self.router.handle_inbound(&from, event).await;
                }
            }
            Envelope::Command(cmd) => {
                self.dispatcher.handle_command(&from, cmd).await;
            }
            Envelope::Result(res) => {
                self.dispatcher.handle_result(&from, res).await;
            }
            // Consumed by the link layer; nothing to do here.
            Envelope::Hello(_) | Envelope::Heartbeat { .. } => {}
        }
    }

    async fn apply_membership(&mut self, child: &NodeId, payload: &[u8]) {
        let subtree: Vec<NodeId> = match serde_json::from_slice(payload) {
            Ok(subtree) => subtree,
            Err(e) => {
                warn!(self.logger, "ignoring malformed membership report";
                    "from" => %child, "error" => %e);
                return;
            }
        };
        let set: HashSet<NodeId> = subtree.into_iter().collect();
        if let Err(e) = self.store.set_descendants(child, set) {
            warn!(self.logger, "ignoring membership report"; "from" => %child, "error" => %e);
            return;
        }
        debug!(self.logger, "descendant cache refreshed"; "child" => %child);
        self.publish_topology();
        self.send_membership_up().await;
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected {
                peer,
                role,
                subtree,
            } => match role {
                LinkRole::Child => {
                    if let Err(e) = self.store.add_child(peer.clone()) {
                        warn!(self.logger, "refusing child link"; "peer" => %peer, "error" => %e);
                        self.links.disconnect(&peer).await;
                        return;
                    }
                    let set: HashSet<NodeId> = subtree.into_iter().collect();
                    let _ = self.store.set_descendants(&peer, set);
                    self.publish_topology();
                    self.send_membership_up().await;
                }
                LinkRole::Parent => {
                    if let Err(e) = self.store.set_parent(Some(peer.clone())) {
                        warn!(self.logger, "refusing parent link"; "peer" => %peer, "error" => %e);
                        self.links.disconnect(&peer).await;
                        return;
                    }
                    self.store.set_parent_addr(self.current_parent_addr.clone());
                    self.publish_topology();
                }
            },
            LinkEvent::Degraded { peer } => {
                debug!(self.logger, "link degraded"; "peer" => %peer);
            }
            LinkEvent::Closed { peer, role } => match role {
                LinkRole::Child => {
                    self.store.remove_child(&peer);
                    self.publish_topology();
                    self.send_membership_up().await;
                }
                LinkRole::Parent => {
                    // The link manager keeps redialing; the edge comes
                    // back through a fresh Connected event.
                    let _ = self.store.set_parent(None);
                    self.publish_topology();
                }
            },
            LinkEvent::ParentLost { addr, attempts } => {
                warn!(self.logger, "parent lost after retry exhaustion";
                    "addr" => %addr, "attempts" => attempts);
                match self.next_fallback(&addr) {
                    Some(next) => {
                        info!(self.logger, "re-parenting to fallback"; "addr" => %next);
                        self.current_parent_addr = Some(next.clone());
                        self.links.connect(next, LinkRole::Parent);
                    }
                    None => {
                        error!(self.logger,
                            "no fallback parents left, operating detached");
                        self.current_parent_addr = None;
                    }
                }
            }
        }
    }

    fn next_fallback(&mut self, failed: &str) -> Option<String> {
        while !self.fallbacks.is_empty() {
            let candidate = self.fallbacks.remove(0);
            if candidate != failed {
                return Some(candidate);
            }
        }
        None
    }

    /// Publish the new snapshot to every watcher and persist it.
    fn publish_topology(&mut self) {
        let snapshot = self.store.snapshot();
        if let Err(e) = self.state_store.save(&snapshot) {
            warn!(self.logger, "failed to persist topology snapshot"; "error" => %e);
        }
        self.topo_tx.send_replace(snapshot);
    }

    /// Report this node's subtree to its parent.
    async fn send_membership_up(&mut self) {
        let Some(parent) = self.links.parent_peer().await else {
            return;
        };
        let payload = match serde_json::to_vec(&self.store.subtree()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(self.logger, "failed to encode membership report"; "error" => %e);
                return;
            }
        };
        let event = Event::new(
            self.store.self_id().clone(),
            Direction::Up,
            MEMBERSHIP_EVENT,
            payload,
            1,
        );
        if let Err(e) = self.links.send(&parent, Envelope::Event(event)).await {
            debug!(self.logger, "could not send membership report"; "error" => %e);
        }
    }
}
