mod common;

use common::{test_registry, Calls, GraphBuilder};
use std::sync::Arc;
use std::time::Duration;
use weavecore::{ErrorKind, ExecutionEvent, NodeStatus, Value};
use weaveruntime::{FlowRuntime, RunHandle, RuntimeConfig};

fn runtime(calls: &Calls) -> FlowRuntime {
    FlowRuntime::with_registry(Arc::new(test_registry(calls)), RuntimeConfig::default())
}

async fn wait_for_waiter(handle: &RunHandle, node_id: &str) {
    for _ in 0..200 {
        if handle.waiting_nodes().iter().any(|id| id == node_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never started waiting", node_id);
}

#[tokio::test]
async fn test_background_run_reads_its_snapshot() {
    let calls = Calls::default();
    let runtime = runtime(&calls);
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("snap"))
        .node("gen", "upper")
        .node("out", "sink")
        .edge("in", "gen")
        .edge("gen", "out")
        .build();
    let graph_id = graph.id;
    let store = runtime.register_graph(graph).await;

    let handle = runtime.run_graph(graph_id, None).await.unwrap();
    // Editing after the run started does not change what it executes.
    store.update(|g| g.nodes.retain(|n| n.id != "out"));

    let result = handle.wait().await.expect("run finishes");
    assert_eq!(result.output("out"), Some(&Value::from("SNAP")));
    assert_eq!(handle.graph_version(), 0);
    assert_eq!(store.version(), 1);

    let projector = handle.projector();
    let logged: Vec<_> = projector.log().map(|e| e.node_id.clone()).collect();
    assert_eq!(logged, vec!["out".to_string()]);
    assert_eq!(projector.view("gen").map(|v| v.status), Some(NodeStatus::Success));

    assert!(runtime.run(handle.run_id()).await.is_some());
}

#[tokio::test]
async fn test_unknown_graph_is_not_found() {
    let calls = Calls::default();
    let runtime = runtime(&calls);
    assert!(runtime.run_graph(uuid::Uuid::new_v4(), None).await.is_err());
}

#[tokio::test]
async fn test_handle_delivers_input_to_waiting_node() {
    let calls = Calls::default();
    let runtime = runtime(&calls);
    let graph = GraphBuilder::new()
        .node("mic", "wait")
        .node("out", "sink")
        .edge("mic", "out")
        .build();
    let graph_id = graph.id;
    runtime.register_graph(graph).await;

    let handle = runtime.run_graph(graph_id, None).await.unwrap();
    wait_for_waiter(&handle, "mic").await;

    assert!(!handle.provide_input("out", Value::from("wrong node")));
    assert!(handle.provide_input("mic", Value::from("hi there")));

    let result = handle.wait().await.unwrap();
    assert_eq!(result.output("out"), Some(&Value::from("hi there")));
}

#[tokio::test]
async fn test_handle_cancel_settles_run() {
    let calls = Calls::default();
    let runtime = runtime(&calls);
    let mut events = runtime.subscribe_events();
    let graph = GraphBuilder::new()
        .node("mic", "wait")
        .node("out", "sink")
        .edge("mic", "out")
        .build();
    let graph_id = graph.id;
    runtime.register_graph(graph).await;

    let handle = runtime.run_graph(graph_id, None).await.unwrap();
    wait_for_waiter(&handle, "mic").await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancel settles the run")
        .unwrap();
    assert!(result.cancelled);
    assert!(handle.is_cancelled());
    assert_eq!(
        result.state("mic").and_then(|s| s.error_kind()),
        Some(ErrorKind::Cancelled)
    );

    let mut completed = false;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::RunCompleted { run_id, cancelled, .. } = event {
            assert_eq!(run_id, handle.run_id());
            assert!(cancelled);
            completed = true;
        }
    }
    assert!(completed);
}

#[test]
fn test_config_file_fills_missing_fields_with_defaults() {
    let path = std::env::temp_dir().join(format!("weave-config-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, r#"{ "timeouts": { "text_ms": 5000 }, "output_log_capacity": 50 }"#)
        .unwrap();

    let config = RuntimeConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.output_log_capacity, 50);
    assert_eq!(config.timeouts.text_ms, Some(5000));
    assert_eq!(config.timeouts.image_ms, Some(180_000));
    assert_eq!(config.sandbox.max_code_length, 10_000);
}

#[tokio::test]
async fn test_oldest_finished_runs_are_evicted() {
    let calls = Calls::default();
    let config = RuntimeConfig {
        max_retained_runs: 2,
        ..RuntimeConfig::default()
    };
    let runtime = FlowRuntime::with_registry(Arc::new(test_registry(&calls)), config);
    let graph = GraphBuilder::new()
        .node_with("in", "source", "value", Value::from("x"))
        .node("out", "sink")
        .edge("in", "out")
        .build();
    let graph_id = graph.id;
    runtime.register_graph(graph).await;

    let mut finished = Vec::new();
    for _ in 0..3 {
        let handle = runtime.run_graph(graph_id, None).await.unwrap();
        handle.wait().await.expect("run finishes");
        finished.push(handle.run_id());
    }
    // Three finished runs are over the cap only once the next run starts.
    assert_eq!(runtime.list_runs().await.len(), 3);

    let latest = runtime.run_graph(graph_id, None).await.unwrap();
    let kept: Vec<_> = runtime.list_runs().await.iter().map(|r| r.run_id()).collect();
    assert_eq!(kept.len(), 3);
    assert!(!kept.contains(&finished[0]));
    assert_eq!(kept, vec![finished[1], finished[2], latest.run_id()]);

    latest.wait().await.expect("run finishes");
    assert!(runtime.remove_run(latest.run_id()).await);
    assert!(runtime.run(latest.run_id()).await.is_none());
}

#[tokio::test]
async fn test_running_run_cannot_be_removed() {
    let calls = Calls::default();
    let runtime = runtime(&calls);
    let graph = GraphBuilder::new().node("mic", "wait").build();
    let graph_id = graph.id;
    runtime.register_graph(graph).await;

    let handle = runtime.run_graph(graph_id, None).await.unwrap();
    wait_for_waiter(&handle, "mic").await;
    assert!(!runtime.remove_run(handle.run_id()).await);

    handle.cancel();
    handle.wait().await.expect("run finishes");
    assert!(runtime.remove_run(handle.run_id()).await);
}
