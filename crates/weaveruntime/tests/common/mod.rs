#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use weavecore::{
    Edge, Graph, Node, NodeContext, NodeError, NodeExecutionState, NodeId, NodeOutput, NodeSpec,
    NodeStatus, OperationClass, StateObserver, Value,
};
use weaveruntime::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};

pub type Behavior =
    Arc<dyn Fn(NodeContext) -> BoxFuture<'static, Result<NodeOutput, NodeError>> + Send + Sync>;

pub fn behavior<F, Fut>(f: F) -> Behavior
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

struct TestNode {
    node_type: String,
    behavior: Behavior,
}

#[async_trait]
impl Node for TestNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        (self.behavior)(ctx).await
    }
}

pub struct TestFactory {
    node_type: String,
    metadata: NodeMetadata,
    behavior: Behavior,
}

impl NodeFactory for TestFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TestNode {
            node_type: self.node_type.clone(),
            behavior: self.behavior.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        self.metadata.clone()
    }
}

pub fn factory(
    node_type: &str,
    inputs: Vec<PortDefinition>,
    terminal: bool,
    class: OperationClass,
    behavior: Behavior,
) -> Arc<dyn NodeFactory> {
    Arc::new(TestFactory {
        node_type: node_type.to_string(),
        metadata: NodeMetadata {
            inputs,
            terminal,
            operation_class: class,
            ..NodeMetadata::default()
        },
        behavior,
    })
}

/// Counts handler invocations per node id.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<HashMap<String, usize>>>);

impl Calls {
    pub fn hit(&self, node_id: &str) {
        *self.0.lock().entry(node_id.to_string()).or_default() += 1;
    }

    pub fn get(&self, node_id: &str) -> usize {
        self.0.lock().get(node_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.lock().values().sum()
    }
}

/// Registry with the node types used across the tests.
///
/// - `source`: emits its `value` setting, else its input
/// - `upper`: uppercases `input` (text class)
/// - `sink`: terminal, passes `input` through
/// - `fail`: always fails
/// - `hang`: never finishes (text class)
/// - `wait`: waits on the pending-input registry (interactive)
/// - `join`: concatenates `left` and `right`
/// - `boom`: panics
/// - `nap`: sleeps `millis` then succeeds (text class)
pub fn test_registry(calls: &Calls) -> NodeRegistry {
    let mut registry = NodeRegistry::new();

    registry.register(factory(
        "source",
        vec![PortDefinition::optional("input", "fallback value")],
        false,
        OperationClass::Passthrough,
        behavior(|ctx: NodeContext| async move {
            let value = ctx
                .data
                .get("value")
                .or_else(|| ctx.inputs.get("input"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(NodeOutput::single(value))
        }),
    ));

    let c = calls.clone();
    registry.register(factory(
        "upper",
        vec![PortDefinition::required("input", "text")],
        false,
        OperationClass::Text,
        behavior(move |ctx: NodeContext| {
            let c = c.clone();
            async move {
                c.hit(&ctx.node_id);
                let text = ctx.require_text("input")?;
                Ok(NodeOutput::single(text.to_uppercase()))
            }
        }),
    ));

    registry.register(factory(
        "sink",
        vec![PortDefinition::required("input", "value")],
        true,
        OperationClass::Passthrough,
        behavior(|ctx: NodeContext| async move {
            Ok(NodeOutput::single(ctx.require_input("input")?.clone()))
        }),
    ));

    registry.register(factory(
        "fail",
        vec![PortDefinition::optional("input", "ignored")],
        false,
        OperationClass::Passthrough,
        behavior(|_ctx: NodeContext| async move {
            Err(NodeError::ExecutionFailed("boom".to_string()))
        }),
    ));

    let c = calls.clone();
    registry.register(factory(
        "hang",
        vec![PortDefinition::optional("input", "ignored")],
        false,
        OperationClass::Text,
        behavior(move |ctx: NodeContext| {
            let c = c.clone();
            async move {
                c.hit(&ctx.node_id);
                futures::future::pending::<Result<NodeOutput, NodeError>>().await
            }
        }),
    ));

    registry.register(factory(
        "wait",
        vec![PortDefinition::optional("input", "ignored")],
        false,
        OperationClass::Interactive,
        behavior(|ctx: NodeContext| async move {
            let waiter = ctx
                .pending_inputs
                .wait_for_input(&ctx.node_id)
                .map_err(|e| NodeError::Validation(e.to_string()))?;
            match waiter.await {
                Some(value) => Ok(NodeOutput::single(value)),
                None => Err(NodeError::Cancelled),
            }
        }),
    ));

    let c = calls.clone();
    registry.register(factory(
        "join",
        vec![
            PortDefinition::required("left", "left"),
            PortDefinition::required("right", "right"),
        ],
        false,
        OperationClass::Passthrough,
        behavior(move |ctx: NodeContext| {
            let c = c.clone();
            async move {
                c.hit(&ctx.node_id);
                let left = ctx.require_text("left")?;
                let right = ctx.require_text("right")?;
                Ok(NodeOutput::single(format!("{}+{}", left, right)))
            }
        }),
    ));

    registry.register(factory(
        "boom",
        vec![PortDefinition::optional("input", "ignored")],
        false,
        OperationClass::Passthrough,
        behavior(|_ctx: NodeContext| async move {
            if true {
                panic!("handler bug");
            }
            Ok(NodeOutput::new())
        }),
    ));

    let c = calls.clone();
    registry.register(factory(
        "nap",
        vec![PortDefinition::optional("input", "ignored")],
        false,
        OperationClass::Text,
        behavior(move |ctx: NodeContext| {
            let c = c.clone();
            async move {
                c.hit(&ctx.node_id);
                let millis = ctx.data.get("millis").and_then(Value::as_f64).unwrap_or(0.0);
                tokio::time::sleep(std::time::Duration::from_millis(millis as u64)).await;
                Ok(NodeOutput::single(ctx.node_id.clone()))
            }
        }),
    ));

    registry
}

pub struct GraphBuilder {
    graph: Graph,
    edges: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            graph: Graph::new("test"),
            edges: 0,
        }
    }

    pub fn node(mut self, id: &str, node_type: &str) -> Self {
        self.graph.add_node(NodeSpec::new(id, node_type));
        self
    }

    pub fn node_with(mut self, id: &str, node_type: &str, key: &str, value: Value) -> Self {
        self.graph
            .add_node(NodeSpec::new(id, node_type).with_data(key, value));
        self
    }

    pub fn edge(self, from: &str, to: &str) -> Self {
        self.edge_to(from, to, "input")
    }

    pub fn edge_to(mut self, from: &str, to: &str, port: &str) -> Self {
        self.edges += 1;
        self.graph
            .connect(Edge::new(format!("e{}", self.edges), from, to).to_port(port));
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Observer that records every transition in order.
pub fn recorder() -> (StateObserver, Arc<Mutex<Vec<(NodeId, NodeExecutionState)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let observer: StateObserver = Arc::new(move |id: &NodeId, state: &NodeExecutionState| {
        sink.lock().push((id.clone(), state.clone()));
    });
    (observer, log)
}

pub fn statuses_of(log: &[(NodeId, NodeExecutionState)], node_id: &str) -> Vec<NodeStatus> {
    log.iter()
        .filter(|(id, _)| id == node_id)
        .map(|(_, state)| state.status())
        .collect()
}

/// Route handler logs to the test output; `RUST_LOG` picks the level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
