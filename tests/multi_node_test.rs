//! Multi-node tests: whole trees wired through the in-process hub.

use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use canopy::dispatch::{CommandResult, CommandRunner, CommandSpec, CommandStatus};
use canopy::link::InMemoryHub;
use canopy::routing::{Direction, Event, EventFilter};
use canopy::topology::NullStateStore;
use canopy::wire::Envelope;
use canopy::{NodeConfig, NodeRuntime, Tuning};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn fast_tuning() -> Tuning {
    Tuning {
        heartbeat_interval_ms: 200,
        reconnect_base_ms: 50,
        reconnect_max_ms: 400,
        ..Tuning::default()
    }
}

/// Answers instantly with a per-node marker instead of forking a shell.
struct EchoRunner;

#[tonic::async_trait]
impl CommandRunner for EchoRunner {
    async fn run(
        &self,
        node_id: &String,
        spec: &CommandSpec,
        _timeout: Duration,
    ) -> CommandResult {
        CommandResult {
            node_id: node_id.clone(),
            status: CommandStatus::Ok,
            exit_code: Some(0),
            stdout: format!("{}> {}", node_id, spec.command),
            stderr: String::new(),
            error: None,
        }
    }
}

/// Never answers within any sane test deadline.
struct SlowRunner;

#[tonic::async_trait]
impl CommandRunner for SlowRunner {
    async fn run(
        &self,
        node_id: &String,
        _spec: &CommandSpec,
        _timeout: Duration,
    ) -> CommandResult {
        tokio::time::sleep(Duration::from_secs(600)).await;
        CommandResult {
            node_id: node_id.clone(),
            status: CommandStatus::Ok,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        }
    }
}

fn addr_of(id: &str) -> String {
    format!("{}:4310", id)
}

async fn start_node(
    hub: &Arc<InMemoryHub>,
    id: &str,
    parent: Option<&str>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<NodeRuntime> {
    let addr = addr_of(id);
    let config = match parent {
        Some(parent) => NodeConfig::joining(id, addr.clone(), addr_of(parent)),
        None => NodeConfig::root(id, addr.clone()),
    }
    .with_tuning(fast_tuning());

    let runtime = NodeRuntime::start_with_runner(
        config,
        hub.dialer(),
        Arc::new(NullStateStore),
        runner,
        test_logger(),
    )
    .await;
    hub.register(addr, runtime.links().clone()).await;
    runtime
}

/// Root, two mid nodes, one leaf under each mid.
async fn three_level_tree(hub: &Arc<InMemoryHub>) -> Vec<Arc<NodeRuntime>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(EchoRunner);
    let root = start_node(hub, "root", None, runner.clone()).await;
    let m1 = start_node(hub, "m1", Some("root"), runner.clone()).await;
    let m2 = start_node(hub, "m2", Some("root"), runner.clone()).await;
    let leaf_a = start_node(hub, "leaf-a", Some("m1"), runner.clone()).await;
    let leaf_b = start_node(hub, "leaf-b", Some("m2"), runner).await;
    let nodes = vec![root, m1, m2, leaf_a, leaf_b];
    wait_until("tree assembly", || {
        nodes[0].topology().subtree()
            == vec!["leaf-a", "leaf-b", "m1", "m2", "root"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
    })
    .await;
    nodes
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_three_level_tree_assembles_with_descendant_caches() {
    let hub = InMemoryHub::new();
    let nodes = three_level_tree(&hub).await;
    let root = &nodes[0];
    let m1 = &nodes[1];

    let snap = root.topology();
    assert!(snap.is_root());
    assert_eq!(snap.children, vec!["m1".to_string(), "m2".to_string()]);
    // Membership reports ripple up: the root knows each mid's subtree
    assert_eq!(
        snap.descendants["m1"],
        vec!["leaf-a".to_string(), "m1".to_string()]
    );
    assert_eq!(
        snap.descendants["m2"],
        vec!["leaf-b".to_string(), "m2".to_string()]
    );

    assert_eq!(m1.topology().parent.as_deref(), Some("root"));
    assert_eq!(m1.topology().children, vec!["leaf-a".to_string()]);
}

#[tokio::test]
async fn test_down_all_from_root_delivers_once_everywhere() {
    let hub = InMemoryHub::new();
    let nodes = three_level_tree(&hub).await;

    let mut subscriptions: Vec<_> = nodes
        .iter()
        .map(|node| node.subscribe(EventFilter::for_name("cfg.push")))
        .collect();

    nodes[0]
        .publish(Direction::DownAll, "cfg.push", b"v2".to_vec())
        .await;

    for rx in &mut subscriptions {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event should arrive")
            .expect("subscription should stay open");
        assert_eq!(event.payload, b"v2");
        assert_eq!(event.origin, "root");
    }

    // No second copy anywhere
    tokio::time::sleep(Duration::from_millis(300)).await;
    for rx in &mut subscriptions {
        assert!(rx.try_recv().is_err(), "event delivered twice");
    }
}

#[tokio::test]
async fn test_republished_event_id_is_not_redelivered() {
    let hub = InMemoryHub::new();
    let runner: Arc<dyn CommandRunner> = Arc::new(EchoRunner);
    let root = start_node(&hub, "root", None, runner.clone()).await;
    let child = start_node(&hub, "child", Some("root"), runner).await;
    wait_until("link up", || {
        root.topology().children == vec!["child".to_string()]
    })
    .await;

    let mut rx = root.subscribe(EventFilter::for_name("once"));
    let event = Event::new("child".to_string(), Direction::Up, "once", vec![], 8);
    for _ in 0..3 {
        child
            .links()
            .send(&"root".to_string(), Envelope::Event(event.clone()))
            .await
            .unwrap();
    }

    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first copy should arrive")
        .expect("subscription open");
    assert_eq!(delivered.event_id, event.event_id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "duplicate EventID was redelivered");
}

#[tokio::test]
async fn test_exec_collects_results_from_targeted_leaves() {
    let hub = InMemoryHub::new();
    let nodes = three_level_tree(&hub).await;
    let root = &nodes[0];

    let set = root
        .execute(
            vec!["leaf-a".to_string(), "leaf-b".to_string()],
            CommandSpec::shell("uname"),
            Duration::from_secs(5),
        )
        .await;

    assert_eq!(set.results.len(), 2, "exactly the targeted nodes answer");
    let a = set.result_for("leaf-a").unwrap();
    assert_eq!(a.status, CommandStatus::Ok);
    assert_eq!(a.stdout, "leaf-a> uname");
    let b = set.result_for("leaf-b").unwrap();
    assert_eq!(b.status, CommandStatus::Ok);
    assert_eq!(b.stdout, "leaf-b> uname");

    assert_eq!(root.pending_requests(), 0);
}

#[tokio::test]
async fn test_severed_leaf_reports_unreachable_sibling_still_answers() {
    let hub = InMemoryHub::new();
    let nodes = three_level_tree(&hub).await;
    let (root, m2, leaf_b) = (&nodes[0], &nodes[2], &nodes[4]);

    leaf_b.shutdown().await;
    hub.unregister(&addr_of("leaf-b")).await;
    wait_until("m2 notices the dead leaf", || {
        m2.topology().children.is_empty()
    })
    .await;

    let set = root
        .execute(
            vec!["leaf-a".to_string(), "leaf-b".to_string()],
            CommandSpec::shell("uname"),
            Duration::from_secs(5),
        )
        .await;

    assert_eq!(set.results.len(), 2);
    assert_eq!(set.result_for("leaf-a").unwrap().status, CommandStatus::Ok);
    assert_eq!(set.result_for("leaf-a").unwrap().stdout, "leaf-a> uname");
    assert_eq!(
        set.result_for("leaf-b").unwrap().status,
        CommandStatus::Unreachable
    );
    assert_eq!(root.pending_requests(), 0);
}

#[tokio::test]
async fn test_timeout_marks_silent_targets_timed_out() {
    let hub = InMemoryHub::new();
    let runner: Arc<dyn CommandRunner> = Arc::new(SlowRunner);
    let root = start_node(&hub, "root", None, runner.clone()).await;
    let _mid = start_node(&hub, "mid", Some("root"), runner.clone()).await;
    let _leaf = start_node(&hub, "leaf", Some("mid"), runner).await;
    wait_until("tree assembly", || {
        root.topology().subtree()
            == vec!["leaf".to_string(), "mid".to_string(), "root".to_string()]
    })
    .await;

    let set = root
        .execute(
            vec!["leaf".to_string()],
            CommandSpec::shell("hang"),
            Duration::from_millis(700),
        )
        .await;

    assert_eq!(
        set.result_for("leaf").unwrap().status,
        CommandStatus::TimedOut
    );
    // The request table must not leak the completed request
    assert_eq!(root.pending_requests(), 0);
}
