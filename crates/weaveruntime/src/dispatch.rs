use crate::registry::{NodeMetadata, NodeRegistry};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use weavecore::{
    CancelSignal, CancellationToken, GraphError, NodeContext, NodeError, NodeOutput, NodeSpec,
    OperationClass, TimeoutPolicy,
};

/// Looks up the handler for a node type and runs it under the node's signal.
pub struct NodeDispatcher {
    registry: Arc<NodeRegistry>,
    timeouts: TimeoutPolicy,
    permits: Arc<Semaphore>,
}

impl NodeDispatcher {
    pub fn new(registry: Arc<NodeRegistry>, timeouts: TimeoutPolicy, max_parallel: usize) -> Self {
        Self {
            registry,
            timeouts,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn metadata(&self, node_type: &str) -> Result<NodeMetadata, GraphError> {
        self.registry
            .get_metadata(node_type)
            .ok_or_else(|| GraphError::UnknownNodeType(node_type.to_string()))
    }

    /// Compose the run token with the deadline for `class`.
    pub fn signal_for(&self, class: OperationClass, run_token: &CancellationToken) -> CancelSignal {
        CancelSignal::compose(run_token.clone(), self.timeouts.timeout_for(class))
    }

    /// Wait for a parallelism slot, giving up only when the run is cancelled.
    ///
    /// Interactive and audio nodes get `None` without waiting since they may
    /// wait on a person.
    pub async fn acquire(
        &self,
        class: OperationClass,
        run_token: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, NodeError> {
        if matches!(class, OperationClass::Interactive | OperationClass::Audio) {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = run_token.cancelled() => Err(NodeError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit
                .map(Some)
                .map_err(|e| NodeError::ExecutionFailed(e.to_string())),
        }
    }

    /// Run the handler for `spec` under `ctx.cancellation`.
    ///
    /// The handler runs on its own task so a panic becomes a node error
    /// instead of tearing down the walk.
    pub async fn dispatch(&self, spec: &NodeSpec, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let node = self
            .registry
            .create_node(&spec.node_type, &spec.data)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        node.validate_data(&spec.data)?;

        let signal = ctx.cancellation.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { signal.guard(node.execute(ctx)).await });

        match handle.await {
            Ok(Ok(mut output)) => {
                output.metadata.execution_time_ms = started.elapsed().as_millis() as u64;
                Ok(output)
            }
            Ok(Err(e)) => Err(e),
            Err(join_error) if join_error.is_panic() => {
                tracing::error!("Handler for {} panicked", spec.id);
                Err(NodeError::ExecutionFailed("handler panicked".to_string()))
            }
            Err(_) => Err(NodeError::Cancelled),
        }
    }
}
