mod common;

use common::{init_tracing, recorder, statuses_of, test_registry, Calls, GraphBuilder};
use std::sync::Arc;
use std::time::Duration;
use weavecore::{
    CancellationToken, ErrorKind, EventBus, FlowError, GraphError, NodeExecutionState, NodeStatus,
    PendingInputRegistry, SkipReason, TimeoutPolicy, Value,
};
use weaveruntime::{FlowExecutor, NodeDispatcher, RunOptions};

fn executor(calls: &Calls, timeouts: TimeoutPolicy) -> FlowExecutor {
    init_tracing();
    let registry = Arc::new(test_registry(calls));
    let dispatcher = Arc::new(NodeDispatcher::new(registry, timeouts, 8));
    FlowExecutor::new(dispatcher, EventBus::new(256))
}

#[tokio::test]
async fn test_linear_chain_produces_terminal_output() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("hello"))
        .node("gen", "upper")
        .node("out", "sink")
        .edge("in", "gen")
        .edge("gen", "out")
        .build();

    let (observer, log) = recorder();
    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new().with_observer(observer))
        .await
        .unwrap();

    assert_eq!(calls.get("gen"), 1);
    assert_eq!(result.output("out"), Some(&Value::from("HELLO")));
    assert_eq!(result.first_output(), Some(&Value::from("HELLO")));
    assert!(result.is_success());

    let log = log.lock();
    assert_eq!(
        statuses_of(&log, "gen"),
        vec![NodeStatus::Pending, NodeStatus::Running, NodeStatus::Success]
    );
}

#[tokio::test]
async fn test_failing_branch_does_not_stop_sibling() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("x"))
        .node("bad", "fail")
        .node("bad_out", "sink")
        .node("good", "upper")
        .node("good_out", "sink")
        .edge("in", "bad")
        .edge("bad", "bad_out")
        .edge("in", "good")
        .edge("good", "good_out")
        .build();

    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(result.output("good_out"), Some(&Value::from("X")));
    assert_eq!(result.output("bad_out"), None);
    assert_eq!(
        result.state("bad").and_then(|s| s.error_kind()),
        Some(ErrorKind::Execution)
    );
    match result.state("bad_out") {
        Some(NodeExecutionState::Error { kind, message }) => {
            assert_eq!(*kind, ErrorKind::Validation);
            assert!(message.contains("'bad'"), "unexpected message {}", message);
        }
        other => panic!("expected bad_out to fail, got {:?}", other),
    }
    assert_eq!(result.count(NodeStatus::Skipped), 0);
    assert!(!result.is_success());
}

#[tokio::test]
async fn test_join_runs_once_after_both_parents() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("a"))
        .node("slow", "upper")
        .node_with("fast", "source", "value", Value::from("b"))
        .node("join", "join")
        .node("out", "sink")
        .edge("in", "slow")
        .edge_to("slow", "join", "left")
        .edge_to("fast", "join", "right")
        .edge("join", "out")
        .build();

    let (observer, log) = recorder();
    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new().with_observer(observer))
        .await
        .unwrap();

    assert_eq!(calls.get("join"), 1);
    assert_eq!(result.output("out"), Some(&Value::from("A+b")));
    let running = statuses_of(&log.lock(), "join")
        .into_iter()
        .filter(|s| *s == NodeStatus::Running)
        .count();
    assert_eq!(running, 1);
}

#[tokio::test]
async fn test_multiple_edges_into_one_port_arrive_as_array() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("a", "source", "value", Value::from("one"))
        .node_with("b", "source", "value", Value::from("two"))
        .node("out", "sink")
        .edge("a", "out")
        .edge("b", "out")
        .build();

    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(
        result.output("out"),
        Some(&Value::Array(vec![Value::from("one"), Value::from("two")]))
    );
}

#[tokio::test]
async fn test_initial_input_reaches_root() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node("in", "source")
        .node("out", "sink")
        .edge("in", "out")
        .build();

    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new().with_input("seed"))
        .await
        .unwrap();

    assert_eq!(result.output("out"), Some(&Value::from("seed")));
}

#[tokio::test]
async fn test_missing_required_input_is_validation_error() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new().node("gen", "upper").build();

    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(calls.get("gen"), 0);
    assert_eq!(
        result.state("gen").and_then(|s| s.error_kind()),
        Some(ErrorKind::Validation)
    );
}

#[tokio::test(start_paused = true)]
async fn test_hung_node_fails_with_timeout_at_deadline() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::uniform(1_000));
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("x"))
        .node("gen", "hang")
        .node("out", "sink")
        .edge("in", "gen")
        .edge("gen", "out")
        .build();

    let started = tokio::time::Instant::now();
    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(calls.get("gen"), 1);
    assert_eq!(
        result.state("gen").and_then(|s| s.error_kind()),
        Some(ErrorKind::Timeout)
    );
    assert_eq!(result.count(NodeStatus::Error), 2);
    assert_eq!(result.count(NodeStatus::Skipped), 0);
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn test_queued_node_gets_its_full_deadline() {
    let calls = Calls::default();
    init_tracing();
    let registry = Arc::new(test_registry(&calls));
    let dispatcher = Arc::new(NodeDispatcher::new(registry, TimeoutPolicy::uniform(1_000), 1));
    let exec = FlowExecutor::new(dispatcher, EventBus::new(256));
    let graph = GraphBuilder::new()
        .node_with("a", "nap", "millis", Value::from(800.0))
        .node_with("b", "nap", "millis", Value::from(800.0))
        .build();

    let started = tokio::time::Instant::now();
    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(result.state("a").map(|s| s.status()), Some(NodeStatus::Success));
    assert_eq!(result.state("b").map(|s| s.status()), Some(NodeStatus::Success));
    assert_eq!(calls.get("a") + calls.get("b"), 2);
    assert!(started.elapsed() >= Duration::from_millis(1_600));
}

#[tokio::test]
async fn test_cancel_before_start_makes_no_calls() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("x"))
        .node("gen", "upper")
        .node("out", "sink")
        .edge("in", "gen")
        .edge("gen", "out")
        .build();

    let token = CancellationToken::new();
    token.cancel();
    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new().with_cancel(token))
        .await
        .unwrap();

    assert!(result.cancelled);
    assert_eq!(calls.total(), 0);
    assert_eq!(
        result.state("in").and_then(|s| s.error_kind()),
        Some(ErrorKind::Cancelled)
    );
    assert_eq!(
        result.state("out"),
        Some(&NodeExecutionState::Skipped {
            reason: SkipReason::Cancelled
        })
    );
    assert!(result.outputs.is_empty());
}

async fn wait_until_waiting(registry: &PendingInputRegistry, node_id: &str) {
    for _ in 0..200 {
        if registry.is_waiting(node_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never started waiting", node_id);
}

#[tokio::test]
async fn test_cancel_mid_run_releases_waiting_node() {
    let calls = Calls::default();
    let exec = Arc::new(executor(&calls, TimeoutPolicy::default()));
    let graph = GraphBuilder::new()
        .node("mic", "wait")
        .node("out", "sink")
        .edge("mic", "out")
        .build();

    let token = CancellationToken::new();
    let registry = PendingInputRegistry::new();
    let options = RunOptions::new()
        .with_cancel(token.clone())
        .with_pending_inputs(registry.clone());

    let run = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.execute_flow(Arc::new(graph), options).await })
    };

    wait_until_waiting(&registry, "mic").await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run settles after cancel")
        .unwrap()
        .unwrap();

    assert!(result.cancelled);
    assert!(registry.waiting_nodes().is_empty());
    assert_eq!(
        result.state("mic").and_then(|s| s.error_kind()),
        Some(ErrorKind::Cancelled)
    );
    assert_eq!(result.count(NodeStatus::Skipped), 1);
}

#[tokio::test]
async fn test_resolved_input_flows_downstream() {
    let calls = Calls::default();
    let exec = Arc::new(executor(&calls, TimeoutPolicy::default()));
    let graph = GraphBuilder::new()
        .node("mic", "wait")
        .node("out", "sink")
        .edge("mic", "out")
        .build();

    let registry = PendingInputRegistry::new();
    let options = RunOptions::new().with_pending_inputs(registry.clone());
    let run = {
        let exec = exec.clone();
        tokio::spawn(async move { exec.execute_flow(Arc::new(graph), options).await })
    };

    wait_until_waiting(&registry, "mic").await;
    assert!(registry.resolve_input("mic", Value::from("spoken words")));

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.output("out"), Some(&Value::from("spoken words")));
}

#[tokio::test]
async fn test_handler_panic_becomes_node_error() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("x"))
        .node("bad", "boom")
        .node("out", "sink")
        .edge("in", "bad")
        .edge("in", "out")
        .build();

    let result = exec
        .execute_flow(Arc::new(graph), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(
        result.state("bad").and_then(|s| s.error_kind()),
        Some(ErrorKind::Execution)
    );
    assert_eq!(result.output("out"), Some(&Value::from("x")));
}

#[tokio::test]
async fn test_invalid_graphs_are_rejected_before_running() {
    let calls = Calls::default();
    let exec = executor(&calls, TimeoutPolicy::default());

    let unknown = GraphBuilder::new().node("x", "teleport").build();
    match exec.execute_flow(Arc::new(unknown), RunOptions::new()).await {
        Err(FlowError::Graph(GraphError::UnknownNodeType(t))) => assert_eq!(t, "teleport"),
        other => panic!("unexpected: {:?}", other.map(|r| r.run_id)),
    }

    let cyclic = GraphBuilder::new()
        .node("a", "upper")
        .node("b", "upper")
        .edge("a", "b")
        .edge("b", "a")
        .build();
    assert!(matches!(
        exec.execute_flow(Arc::new(cyclic), RunOptions::new()).await,
        Err(FlowError::Graph(GraphError::CyclicDependency))
    ));
    assert_eq!(calls.total(), 0);
}
