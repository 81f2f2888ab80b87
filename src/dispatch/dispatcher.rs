//! Command dispatcher
//!
//! Fans a command out toward its target subtrees, executes it locally
//! when this node is targeted, and aggregates results flowing back up.
//! Every node on the path reports upward exactly once per request, so
//! the issuer receives one consolidated batch per immediate child
//! instead of one message per leaf.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use slog::{debug, info, warn, Logger};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::dispatch::executor::CommandRunner;
use crate::dispatch::types::{
    CommandEnvelope, CommandResponseSet, CommandResult, CommandSpec, RequestId, ResultEnvelope,
};
use crate::link::LinkManager;
use crate::routing::DedupCache;
use crate::topology::TopologySnapshot;
use crate::wire::Envelope;
use crate::NodeId;

enum RequestOrigin {
    /// Issued on this node; the caller is waiting on the channel.
    Local {
        tx: oneshot::Sender<CommandResponseSet>,
    },
    /// Relayed from a neighbor; the batch goes back up that link.
    Remote { via: NodeId },
}

struct PendingRequest {
    origin: RequestOrigin,
    targets: Vec<NodeId>,
    /// Children this node forwarded the command to.
    expected_acks: HashSet<NodeId>,
    /// Children whose batch has arrived.
    acked: HashSet<NodeId>,
    results: BTreeMap<NodeId, CommandResult>,
    local_pending: bool,
}

enum FinishAction {
    Respond {
        tx: oneshot::Sender<CommandResponseSet>,
        set: CommandResponseSet,
    },
    Forward {
        via: NodeId,
        envelope: ResultEnvelope,
    },
}

pub struct CommandDispatcher {
    self_id: NodeId,
    links: Arc<LinkManager>,
    topo: watch::Receiver<TopologySnapshot>,
    runner: Arc<dyn CommandRunner>,
    dedup: Arc<StdMutex<DedupCache>>,
    pending: StdMutex<HashMap<RequestId, PendingRequest>>,
    default_ttl: u32,
    logger: Logger,
}

impl CommandDispatcher {
    pub fn new(
        self_id: NodeId,
        links: Arc<LinkManager>,
        topo: watch::Receiver<TopologySnapshot>,
        runner: Arc<dyn CommandRunner>,
        dedup: Arc<StdMutex<DedupCache>>,
        default_ttl: u32,
        logger: Logger,
    ) -> Arc<Self> {
        Arc::new(CommandDispatcher {
            self_id,
            links,
            topo,
            runner,
            dedup,
            pending: StdMutex::new(HashMap::new()),
            default_ttl,
            logger,
        })
    }

    /// Issue a command against `targets` and wait for the consolidated
    /// response set.
    ///
    /// Never fails as a whole: targets that cannot be reached come back
    /// as `Unreachable`, targets that stay silent past `timeout` as
    /// `TimedOut`. The request is forgotten once this returns; results
    /// arriving later are dropped as unknown.
    pub async fn execute(
        self: &Arc<Self>,
        targets: Vec<NodeId>,
        spec: CommandSpec,
        timeout: Duration,
    ) -> CommandResponseSet {
        let request_id = Uuid::new_v4();
        self.observe_dedup(request_id);

        let (tx, mut rx) = oneshot::channel();
        let local = targets.iter().any(|t| *t == self.self_id);
        {
            let mut pending = self.lock_pending();
            pending.insert(
                request_id,
                PendingRequest {
                    origin: RequestOrigin::Local { tx },
                    targets: targets.clone(),
                    expected_acks: HashSet::new(),
                    acked: HashSet::new(),
                    results: BTreeMap::new(),
                    local_pending: local,
                },
            );
        }

        let cmd = CommandEnvelope {
            request_id,
            origin: self.self_id.clone(),
            targets,
            spec: spec.clone(),
            timeout,
            ttl: self.default_ttl,
        };
        info!(self.logger, "dispatching command";
            "request_id" => %request_id, "targets" => cmd.targets.len(),
            "command" => %spec.command);

        self.fan_out(&cmd, None).await;
        if local {
            self.spawn_local(request_id, spec, timeout);
        }
        self.try_finalize(request_id).await;

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            res = &mut rx => match res {
                Ok(set) => set,
                Err(_) => CommandResponseSet {
                    request_id,
                    results: BTreeMap::new(),
                },
            },
            _ = &mut sleep => {
                match self.finalize_timeout(request_id) {
                    Some(set) => set,
                    // Completed in the same instant; the set is in flight.
                    None => match rx.await {
                        Ok(set) => set,
                        Err(_) => CommandResponseSet {
                            request_id,
                            results: BTreeMap::new(),
                        },
                    },
                }
            }
        }
    }

    /// Handle a command routed to this node from a neighbor.
    pub async fn handle_command(self: &Arc<Self>, from: &NodeId, cmd: CommandEnvelope) {
        if !self.observe_dedup(cmd.request_id) {
            debug!(self.logger, "dropping duplicate command";
                "request_id" => %cmd.request_id);
            return;
        }
        if cmd.ttl == 0 {
            warn!(self.logger, "command TTL exhausted, dropping";
                "request_id" => %cmd.request_id, "origin" => %cmd.origin);
            return;
        }

        let local = cmd.targets.iter().any(|t| *t == self.self_id);
        {
            let mut pending = self.lock_pending();
            pending.insert(
                cmd.request_id,
                PendingRequest {
                    origin: RequestOrigin::Remote { via: from.clone() },
                    targets: cmd.targets.clone(),
                    expected_acks: HashSet::new(),
                    acked: HashSet::new(),
                    results: BTreeMap::new(),
                    local_pending: local,
                },
            );
        }

        self.fan_out(&cmd, Some(from)).await;
        if local {
            self.spawn_local(cmd.request_id, cmd.spec.clone(), cmd.timeout);
        }

        // Flush a partial batch before the issuer gives up on us.
        let deadline = relay_deadline(cmd.timeout);
        let dispatcher = self.clone();
        let request_id = cmd.request_id;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            dispatcher.flush_partial(request_id).await;
        });

        self.try_finalize(cmd.request_id).await;
    }

    /// Merge a result batch reported by a child. Only a complete batch
    /// counts as that branch's ack; a partial flush merges its results
    /// but leaves the branch outstanding for the deadline to resolve.
    pub async fn handle_result(self: &Arc<Self>, from: &NodeId, res: ResultEnvelope) {
        {
            let mut pending = self.lock_pending();
            let Some(entry) = pending.get_mut(&res.request_id) else {
                debug!(self.logger, "result for unknown request, dropping";
                    "request_id" => %res.request_id, "from" => %from);
                return;
            };
            for result in res.results {
                entry.results.insert(result.node_id.clone(), result);
            }
            if res.complete {
                entry.acked.insert(from.clone());
            }
        }
        self.try_finalize(res.request_id).await;
    }

    /// Outstanding request count; drained entries mean no leaks.
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Forward the command toward every child whose subtree may hold a
    /// target. Children that cannot be reached get `Unreachable`
    /// entries synthesized for the targets known to sit behind them.
    async fn fan_out(self: &Arc<Self>, cmd: &CommandEnvelope, from: Option<&NodeId>) {
        let snapshot = self.topo.borrow().clone();
        let mut forward = cmd.clone();
        forward.ttl -= 1;

        for child in snapshot.route_down_targets(&cmd.targets) {
            if Some(&child) == from {
                continue;
            }
            match self
                .links
                .send(&child, Envelope::Command(forward.clone()))
                .await
            {
                Ok(()) => {
                    let mut pending = self.lock_pending();
                    if let Some(entry) = pending.get_mut(&cmd.request_id) {
                        entry.expected_acks.insert(child);
                    }
                }
                Err(e) => {
                    warn!(self.logger, "cannot forward command to child";
                        "peer" => %child, "request_id" => %cmd.request_id, "error" => %e);
                    let mut unreachable: Vec<NodeId> = Vec::new();
                    if cmd.targets.contains(&child) {
                        unreachable.push(child.clone());
                    }
                    if let Some(descendants) = snapshot.descendants.get(&child) {
                        for target in &cmd.targets {
                            if target != &child && descendants.contains(target) {
                                unreachable.push(target.clone());
                            }
                        }
                    }
                    let mut pending = self.lock_pending();
                    if let Some(entry) = pending.get_mut(&cmd.request_id) {
                        for target in unreachable {
                            entry
                                .results
                                .entry(target.clone())
                                .or_insert_with(|| CommandResult::unreachable(target));
                        }
                    }
                }
            }
        }
    }

    fn spawn_local(self: &Arc<Self>, request_id: RequestId, spec: CommandSpec, timeout: Duration) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let result = dispatcher
                .runner
                .run(&dispatcher.self_id, &spec, timeout)
                .await;
            {
                let mut pending = dispatcher.lock_pending();
                if let Some(entry) = pending.get_mut(&request_id) {
                    entry.results.insert(dispatcher.self_id.clone(), result);
                    entry.local_pending = false;
                }
            }
            dispatcher.try_finalize(request_id).await;
        });
    }

    /// Complete the request if the local run and every forwarded branch
    /// have reported. Issuer entries fill never-seen targets as
    /// `Unreachable` (every live branch answered, so they are not in the
    /// tree); relay entries forward their batch upward.
    async fn try_finalize(self: &Arc<Self>, request_id: RequestId) {
        let action = {
            let mut pending = self.lock_pending();
            let done = match pending.get(&request_id) {
                Some(entry) => {
                    !entry.local_pending && entry.expected_acks.is_subset(&entry.acked)
                }
                None => false,
            };
            if !done {
                return;
            }
            let entry = match pending.remove(&request_id) {
                Some(entry) => entry,
                None => return,
            };
            self.finish_action(request_id, entry, CommandResult::unreachable)
        };
        self.perform(action, request_id).await;
    }

    /// Give up waiting (issuer side); unheard targets become `TimedOut`.
    fn finalize_timeout(self: &Arc<Self>, request_id: RequestId) -> Option<CommandResponseSet> {
        let mut pending = self.lock_pending();
        let entry = pending.remove(&request_id)?;
        let mut results = entry.results;
        for target in &entry.targets {
            results
                .entry(target.clone())
                .or_insert_with(|| CommandResult::timed_out(target.clone()));
        }
        info!(self.logger, "command timed out"; "request_id" => %request_id);
        Some(CommandResponseSet {
            request_id,
            results,
        })
    }

    /// Relay deadline hit: forward whatever arrived so the issuer gets
    /// partial results rather than silence.
    async fn flush_partial(self: &Arc<Self>, request_id: RequestId) {
        let action = {
            let mut pending = self.lock_pending();
            let Some(entry) = pending.remove(&request_id) else {
                return;
            };
            match entry.origin {
                RequestOrigin::Remote { .. } => {
                    info!(self.logger, "relay deadline, forwarding partial results";
                        "request_id" => %request_id, "results" => entry.results.len());
                }
                RequestOrigin::Local { .. } => {}
            }
            self.finish_action_partial(request_id, entry)
        };
        if let Some(action) = action {
            self.perform(action, request_id).await;
        }
    }

    fn finish_action(
        &self,
        request_id: RequestId,
        entry: PendingRequest,
        missing: fn(NodeId) -> CommandResult,
    ) -> FinishAction {
        match entry.origin {
            RequestOrigin::Local { tx } => {
                let mut results = entry.results;
                for target in &entry.targets {
                    results
                        .entry(target.clone())
                        .or_insert_with(|| missing(target.clone()));
                }
                FinishAction::Respond {
                    tx,
                    set: CommandResponseSet {
                        request_id,
                        results,
                    },
                }
            }
            RequestOrigin::Remote { via } => FinishAction::Forward {
                via,
                envelope: ResultEnvelope {
                    request_id,
                    origin: self.self_id.clone(),
                    results: entry.results.into_values().collect(),
                    complete: true,
                    ttl: self.default_ttl,
                },
            },
        }
    }

    fn finish_action_partial(
        &self,
        request_id: RequestId,
        entry: PendingRequest,
    ) -> Option<FinishAction> {
        match entry.origin {
            // The issuer's own timeout handles the local case.
            RequestOrigin::Local { .. } => None,
            RequestOrigin::Remote { via } => Some(FinishAction::Forward {
                via,
                envelope: ResultEnvelope {
                    request_id,
                    origin: self.self_id.clone(),
                    results: entry.results.into_values().collect(),
                    complete: false,
                    ttl: self.default_ttl,
                },
            }),
        }
    }

    async fn perform(&self, action: FinishAction, request_id: RequestId) {
        match action {
            FinishAction::Respond { tx, set } => {
                let _ = tx.send(set);
            }
            FinishAction::Forward { via, envelope } => {
                if let Err(e) = self.links.send(&via, Envelope::Result(envelope)).await {
                    warn!(self.logger, "failed to forward result batch";
                        "request_id" => %request_id, "peer" => %via, "error" => %e);
                }
            }
        }
    }

    fn observe_dedup(&self, request_id: RequestId) -> bool {
        let mut dedup = match self.dedup.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        dedup.observe(request_id)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Relays flush partial batches ahead of the issuer's deadline so the
/// results are not lost to the race between the two timers.
fn relay_deadline(timeout: Duration) -> Duration {
    timeout.saturating_sub(timeout / 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::types::CommandStatus;
    use crate::link::{InMemoryHub, LinkSettings};
    use slog::Logger;

    struct StaticRunner {
        stdout: String,
        delay: Duration,
    }

    #[tonic::async_trait]
    impl CommandRunner for StaticRunner {
        async fn run(
            &self,
            node_id: &NodeId,
            _spec: &CommandSpec,
            _timeout: Duration,
        ) -> CommandResult {
            tokio::time::sleep(self.delay).await;
            CommandResult {
                node_id: node_id.clone(),
                status: CommandStatus::Ok,
                exit_code: Some(0),
                stdout: self.stdout.clone(),
                stderr: String::new(),
                error: None,
            }
        }
    }

    fn dispatcher_fixture(self_id: &str, runner: Arc<dyn CommandRunner>) -> Arc<CommandDispatcher> {
        let logger = Logger::root(slog::Discard, slog::o!());
        let hub = InMemoryHub::new();
        let (_topo_tx, topo_rx) =
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
        CommandDispatcher::new(
            self_id.to_string(),
            links,
            topo_rx,
            runner,
            dedup,
            16,
            logger,
        )
    }

    #[tokio::test]
    async fn test_empty_target_set_completes_immediately() {
        let runner = Arc::new(StaticRunner {
            stdout: String::new(),
            delay: Duration::ZERO,
        });
        let dispatcher = dispatcher_fixture("n1", runner);

        let set = dispatcher
            .execute(vec![], CommandSpec::shell("true"), Duration::from_secs(5))
            .await;

        assert!(set.results.is_empty());
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_self_target_runs_locally() {
        let runner = Arc::new(StaticRunner {
            stdout: "local\n".to_string(),
            delay: Duration::ZERO,
        });
        let dispatcher = dispatcher_fixture("n1", runner);

        let set = dispatcher
            .execute(
                vec!["n1".to_string()],
                CommandSpec::shell("echo local"),
                Duration::from_secs(5),
            )
            .await;

        let result = set.result_for("n1").unwrap();
        assert_eq!(result.status, CommandStatus::Ok);
        assert_eq!(result.stdout, "local\n");
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_every_target_and_clears_table() {
        let runner = Arc::new(StaticRunner {
            stdout: String::new(),
            delay: Duration::from_secs(3600),
        });
        let dispatcher = dispatcher_fixture("n1", runner);

        let set = dispatcher
            .execute(
                vec!["n1".to_string(), "ghost".to_string()],
                CommandSpec::shell("sleep forever"),
                Duration::from_secs(2),
            )
            .await;

        assert_eq!(
            set.result_for("n1").unwrap().status,
            CommandStatus::TimedOut
        );
        // "ghost" is not in the tree at all: no branch ever acked for
        // it, so the deadline is what resolves it
        assert_eq!(
            set.result_for("ghost").unwrap().status,
            CommandStatus::TimedOut
        );
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_result_batch_is_dropped() {
        let runner = Arc::new(StaticRunner {
            stdout: String::new(),
            delay: Duration::ZERO,
        });
        let dispatcher = dispatcher_fixture("n1", runner);

        dispatcher
            .handle_result(
                &"stranger".to_string(),
                ResultEnvelope {
                    request_id: Uuid::new_v4(),
                    origin: "stranger".to_string(),
                    results: vec![CommandResult::unreachable("x".to_string())],
                    complete: true,
                    ttl: 4,
                },
            )
            .await;

        assert_eq!(dispatcher.pending_len(), 0);
    }
}
