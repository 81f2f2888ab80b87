//! Link manager
//!
//! Owns every live connection to a neighbor (the parent and each child)
//! and is the sole mutator of link state. Each link runs its own
//! connect/retry machine: CONNECTING -> CONNECTED, then heartbeat misses
//! walk it through DEGRADED to CLOSED, after which dialed links retry
//! with capped, jittered exponential backoff. A parent link that cannot
//! be re-established within the attempt budget is surfaced to the
//! runtime as `ParentLost` instead of looping forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use slog::{debug, info, warn, Logger};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;

use crate::error::LinkError;
use crate::link::backoff::{delay_for_attempt, BackoffPolicy};
use crate::topology::TopologySnapshot;
use crate::wire::{Envelope, Hello, PROTOCOL_VERSION};
use crate::NodeId;

/// Who the remote peer is on a link, from this node's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkRole {
    Parent,
    Child,
}

impl LinkRole {
    pub fn opposite(self) -> LinkRole {
        match self {
            LinkRole::Parent => LinkRole::Child,
            LinkRole::Child => LinkRole::Parent,
        }
    }
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRole::Parent => write!(f, "parent"),
            LinkRole::Child => write!(f, "child"),
        }
    }
}

/// Connection state of one link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Degraded,
    Closed,
}

/// State changes surfaced to the node runtime.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Connected {
        peer: NodeId,
        role: LinkRole,
        subtree: Vec<NodeId>,
    },
    Degraded {
        peer: NodeId,
    },
    Closed {
        peer: NodeId,
        role: LinkRole,
    },
    /// The parent could not be reached within the dial attempt budget.
    ParentLost {
        addr: String,
        attempts: u32,
    },
}

/// An envelope received on a link, tagged with its sender.
#[derive(Debug)]
pub struct Inbound {
    pub from: NodeId,
    pub envelope: Envelope,
}

/// A successfully dialed connection, as returned by a [`LinkDialer`].
pub struct DialedLink {
    pub peer: NodeId,
    pub subtree: Vec<NodeId>,
    pub tx: mpsc::Sender<Envelope>,
    pub rx: mpsc::Receiver<Envelope>,
}

/// Protocol-specific connection establishment (gRPC, or in-process for
/// tests). The dialer performs the hello exchange and hands back the
/// two halves of the link.
#[tonic::async_trait]
pub trait LinkDialer: Send + Sync {
    async fn dial(&self, addr: &str, hello: Hello) -> Result<DialedLink, LinkError>;
}

/// Tuning knobs for the link layer.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    /// Bound of each link's outbound queue.
    pub queue_depth: usize,
    /// Idle interval after which a heartbeat is sent.
    pub heartbeat_interval: std::time::Duration,
    /// Missed intervals before a link is DEGRADED; twice this closes it.
    pub heartbeat_miss_limit: u32,
    pub backoff: BackoffPolicy,
    /// Dial attempts before a parent is declared lost.
    pub dial_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            queue_depth: 64,
            heartbeat_interval: std::time::Duration::from_secs(2),
            heartbeat_miss_limit: 3,
            backoff: BackoffPolicy::default(),
            dial_attempts: 8,
        }
    }
}

struct LinkEntry {
    role: LinkRole,
    state: LinkState,
    gen: u64,
    tx: mpsc::Sender<Envelope>,
    last_seen: Instant,
    last_sent: Instant,
    hb_seq: u64,
}

/// Capacity of the mailbox feeding the runtime control task.
const INBOUND_QUEUE: usize = 1024;

pub struct LinkManager {
    self_id: NodeId,
    settings: LinkSettings,
    dialer: Arc<dyn LinkDialer>,
    topo: watch::Receiver<TopologySnapshot>,
    links: RwLock<HashMap<NodeId, LinkEntry>>,
    next_gen: AtomicU64,
    dialing: StdMutex<std::collections::HashSet<String>>,
    inbound_tx: mpsc::Sender<Inbound>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    shutdown_tx: watch::Sender<bool>,
    logger: Logger,
}

impl LinkManager {
    /// Create the manager and start its heartbeat loop. Returns the
    /// inbound mailbox and the link event stream, both consumed by the
    /// node runtime.
    pub fn new(
        self_id: NodeId,
        settings: LinkSettings,
        dialer: Arc<dyn LinkDialer>,
        topo: watch::Receiver<TopologySnapshot>,
        logger: Logger,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<Inbound>,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(LinkManager {
            self_id,
            settings,
            dialer,
            topo,
            links: RwLock::new(HashMap::new()),
            next_gen: AtomicU64::new(1),
            dialing: StdMutex::new(std::collections::HashSet::new()),
            inbound_tx,
            events_tx,
            shutdown_tx,
            logger,
        });

        let hb = manager.clone();
        tokio::spawn(async move {
            hb.run_heartbeat_loop().await;
        });

        (manager, inbound_rx, events_rx)
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Build the hello this node sends when opening or answering a link.
    pub fn local_hello(&self, my_role: LinkRole) -> Hello {
        Hello {
            node_id: self.self_id.clone(),
            protocol: PROTOCOL_VERSION,
            role: my_role,
            subtree: self.topo.borrow().subtree(),
        }
    }

    /// Register an inbound link accepted by the server side.
    ///
    /// `hello` is the remote's opening frame; its role field states what
    /// the remote is to us. Returns the connection generation the caller
    /// must tag delivered envelopes with.
    pub async fn accept(
        &self,
        hello: Hello,
        tx: mpsc::Sender<Envelope>,
    ) -> Result<u64, LinkError> {
        if hello.protocol != PROTOCOL_VERSION {
            return Err(LinkError::Handshake {
                reason: format!("peer speaks protocol {}", hello.protocol),
            });
        }
        self.validate_peer(&hello.node_id, hello.role)?;
        let gen = self
            .register(hello.node_id.clone(), hello.role, tx)
            .await;
        self.emit(LinkEvent::Connected {
            peer: hello.node_id,
            role: hello.role,
            subtree: hello.subtree,
        });
        Ok(gen)
    }

    fn validate_peer(&self, peer: &NodeId, role: LinkRole) -> Result<(), LinkError> {
        if *peer == self.self_id {
            return Err(LinkError::Handshake {
                reason: "link loops back to this node".to_string(),
            });
        }
        let snap = self.topo.borrow().clone();
        match role {
            LinkRole::Parent => {
                if let Some(current) = snap.parent.as_ref() {
                    if current != peer {
                        return Err(LinkError::Handshake {
                            reason: format!(
                                "{} claims to be parent but {} already is",
                                peer, current
                            ),
                        });
                    }
                }
                if snap.subtree().contains(peer) {
                    return Err(LinkError::Handshake {
                        reason: format!("{} is a descendant and cannot become parent", peer),
                    });
                }
            }
            LinkRole::Child => {
                if snap.parent.as_ref() == Some(peer) {
                    return Err(LinkError::Handshake {
                        reason: format!("{} is the parent and cannot attach as child", peer),
                    });
                }
            }
        }
        Ok(())
    }

    async fn register(&self, peer: NodeId, role: LinkRole, tx: mpsc::Sender<Envelope>) -> u64 {
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let entry = LinkEntry {
            role,
            state: LinkState::Connected,
            gen,
            tx,
            last_seen: now,
            last_sent: now,
            hb_seq: 0,
        };
        let old = self.links.write().await.insert(peer.clone(), entry);
        if old.is_some() {
            debug!(self.logger, "replaced existing link"; "peer" => %peer);
        }
        info!(self.logger, "link established"; "peer" => %peer, "role" => %role);
        gen
    }

    /// Dial a neighbor and keep the link alive until shutdown.
    ///
    /// Runs in the background: retries with backoff, re-registers on
    /// every successful connect, and redials when an established link
    /// drops. Parent dial exhaustion emits `ParentLost`.
    pub fn connect(self: &Arc<Self>, addr: String, remote_role: LinkRole) {
        {
            let mut dialing = match self.dialing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !dialing.insert(addr.clone()) {
                return;
            }
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_dial_loop(addr.clone(), remote_role).await;
            let mut dialing = match manager.dialing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            dialing.remove(&addr);
        });
    }

    async fn run_dial_loop(&self, addr: String, remote_role: LinkRole) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            let hello = self.local_hello(remote_role.opposite());
            match self.dialer.dial(&addr, hello).await {
                Ok(link) => {
                    if let Err(e) = self.validate_peer(&link.peer, remote_role) {
                        warn!(self.logger, "rejecting dialed link"; "addr" => %addr, "error" => %e);
                        self.dial_gave_up(&addr, remote_role, attempt);
                        return;
                    }
                    let peer = link.peer.clone();
                    let gen = self.register(peer.clone(), remote_role, link.tx).await;
                    self.emit(LinkEvent::Connected {
                        peer: peer.clone(),
                        role: remote_role,
                        subtree: link.subtree,
                    });
                    attempt = 0;

                    self.pump_dialed(&peer, gen, link.rx).await;
                    self.close_entry(&peer, gen).await;

                    if *shutdown_rx.borrow() {
                        return;
                    }
                    info!(self.logger, "link lost, redialing"; "peer" => %peer, "addr" => %addr);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(self.logger, "dial failed";
                        "addr" => %addr, "attempt" => attempt, "error" => %e);
                    if attempt >= self.settings.dial_attempts {
                        self.dial_gave_up(&addr, remote_role, attempt);
                        return;
                    }
                }
            }

            let delay = delay_for_attempt(&self.settings.backoff, attempt.saturating_sub(1));
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn dial_gave_up(&self, addr: &str, remote_role: LinkRole, attempts: u32) {
        match remote_role {
            LinkRole::Parent => {
                self.emit(LinkEvent::ParentLost {
                    addr: addr.to_string(),
                    attempts,
                });
            }
            LinkRole::Child => {
                warn!(self.logger, "giving up on bootstrap child";
                    "addr" => %addr, "attempts" => attempts);
            }
        }
    }

    /// Read loop for a dialed link. Returns when the connection or the
    /// registered entry goes away.
    async fn pump_dialed(&self, peer: &NodeId, gen: u64, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            match tokio::time::timeout(self.settings.heartbeat_interval, rx.recv()).await {
                Ok(Some(envelope)) => {
                    if !self.deliver_inbound(peer, gen, envelope).await {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    if !self.is_live(peer, gen).await {
                        return;
                    }
                }
            }
        }
    }

    async fn is_live(&self, peer: &NodeId, gen: u64) -> bool {
        self.links
            .read()
            .await
            .get(peer)
            .map(|entry| entry.gen == gen)
            .unwrap_or(false)
    }

    /// Hand an envelope received on a link to the runtime.
    ///
    /// Returns `false` once the link's registration is gone and the
    /// caller's read loop should stop. Heartbeats are consumed here;
    /// any received envelope refreshes liveness.
    pub async fn deliver_inbound(&self, peer: &NodeId, gen: u64, envelope: Envelope) -> bool {
        {
            let mut links = self.links.write().await;
            let entry = match links.get_mut(peer) {
                Some(entry) if entry.gen == gen => entry,
                _ => return false,
            };
            entry.last_seen = Instant::now();
            if entry.state == LinkState::Degraded {
                entry.state = LinkState::Connected;
                info!(self.logger, "link recovered"; "peer" => %peer);
            }
        }

        if let Envelope::Heartbeat { seq } = envelope {
            debug!(self.logger, "heartbeat"; "peer" => %peer, "seq" => seq);
            return true;
        }
        if matches!(envelope, Envelope::Hello(_)) {
            // Hellos are handled during link setup; a repeat is noise.
            return true;
        }

        self.inbound_tx
            .send(Inbound {
                from: peer.clone(),
                envelope,
            })
            .await
            .is_ok()
    }

    /// Mark a link closed from the server side (stream ended).
    pub async fn peer_closed(&self, peer: &NodeId, gen: u64) {
        self.close_entry(peer, gen).await;
    }

    async fn close_entry(&self, peer: &NodeId, gen: u64) {
        let removed = {
            let mut links = self.links.write().await;
            match links.get(peer) {
                Some(entry) if entry.gen == gen => links.remove(peer),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            info!(self.logger, "link closed"; "peer" => %peer, "role" => %entry.role);
            self.emit(LinkEvent::Closed {
                peer: peer.clone(),
                role: entry.role,
            });
        }
    }

    /// Drop a link deliberately.
    pub async fn disconnect(&self, peer: &NodeId) {
        let removed = self.links.write().await.remove(peer);
        if let Some(entry) = removed {
            info!(self.logger, "link disconnected"; "peer" => %peer, "role" => %entry.role);
            self.emit(LinkEvent::Closed {
                peer: peer.clone(),
                role: entry.role,
            });
        }
    }

    /// Queue an envelope for a peer.
    ///
    /// Fails fast instead of blocking: `Unavailable` when the link is
    /// absent or not CONNECTED, `Backpressure` when its bounded queue is
    /// full. A backpressured envelope is dropped, isolating a slow peer
    /// from the rest of the tree.
    pub async fn send(&self, peer: &NodeId, envelope: Envelope) -> Result<(), LinkError> {
        let mut links = self.links.write().await;
        let entry = links.get_mut(peer).ok_or_else(|| LinkError::Unavailable {
            peer: peer.clone(),
        })?;
        if entry.state != LinkState::Connected {
            return Err(LinkError::Unavailable { peer: peer.clone() });
        }
        match entry.tx.try_send(envelope) {
            Ok(()) => {
                entry.last_sent = Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(LinkError::Backpressure { peer: peer.clone() })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(LinkError::Closed { peer: peer.clone() })
            }
        }
    }

    /// The peer currently linked as parent, if any.
    pub async fn parent_peer(&self) -> Option<NodeId> {
        self.links
            .read()
            .await
            .iter()
            .find(|(_, entry)| entry.role == LinkRole::Parent)
            .map(|(peer, _)| peer.clone())
    }

    /// Peers currently linked as children.
    pub async fn child_peers(&self) -> Vec<NodeId> {
        self.links
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.role == LinkRole::Child)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Send to every connected child, returning the per-child failures.
    pub async fn broadcast_children(&self, envelope: Envelope) -> Vec<(NodeId, LinkError)> {
        let children = self.child_peers().await;
        let mut failures = Vec::new();
        for child in children {
            if let Err(e) = self.send(&child, envelope.clone()).await {
                failures.push((child, e));
            }
        }
        failures
    }

    pub async fn link_state(&self, peer: &NodeId) -> Option<LinkState> {
        self.links.read().await.get(peer).map(|entry| entry.state)
    }

    pub fn queue_depth(&self) -> usize {
        self.settings.queue_depth
    }

    /// Stop the heartbeat loop, all dial loops and drop every link.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.links.write().await.clear();
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let degraded_after =
                self.settings.heartbeat_interval * self.settings.heartbeat_miss_limit;
            let closed_after = degraded_after * 2;

            let mut newly_degraded = Vec::new();
            let mut to_close = Vec::new();
            {
                let mut links = self.links.write().await;
                for (peer, entry) in links.iter_mut() {
                    let idle = now.duration_since(entry.last_seen);
                    if idle >= closed_after {
                        to_close.push(peer.clone());
                        continue;
                    }
                    if idle >= degraded_after && entry.state == LinkState::Connected {
                        entry.state = LinkState::Degraded;
                        newly_degraded.push(peer.clone());
                    }
                    if now.duration_since(entry.last_sent) >= self.settings.heartbeat_interval {
                        entry.hb_seq += 1;
                        entry.last_sent = now;
                        let _ = entry.tx.try_send(Envelope::Heartbeat { seq: entry.hb_seq });
                    }
                }
            }

            for peer in newly_degraded {
                warn!(self.logger, "link degraded, heartbeats missing"; "peer" => %peer);
                self.emit(LinkEvent::Degraded { peer });
            }
            for peer in to_close {
                let removed = self.links.write().await.remove(&peer);
                if let Some(entry) = removed {
                    warn!(self.logger, "link closed after heartbeat loss";
                        "peer" => %peer, "role" => %entry.role);
                    self.emit(LinkEvent::Closed {
                        peer,
                        role: entry.role,
                    });
                }
            }
        }
    }
}
