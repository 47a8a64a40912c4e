use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use weavecore::{
    Node, NodeContext, NodeError, NodeOutput, OperationClass, Value, DEFAULT_INPUT_PORT,
    DEFAULT_OUTPUT_PORT,
};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn validate_data(&self, data: &HashMap<String, Value>) -> Result<(), NodeError> {
        match data.get("delay_ms") {
            Some(v) if v.as_f64().map_or(true, |ms| ms < 0.0) => Err(NodeError::InvalidInputType {
                field: "delay_ms".to_string(),
                expected: "non-negative number".to_string(),
                actual: v.to_text(),
            }),
            _ => Ok(()),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .data
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0) as u64; // Default to 1 second if not specified

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        ctx.cancellation
            .guard(async {
                sleep(Duration::from_millis(delay_ms)).await;
                Ok(())
            })
            .await?;

        // Pass through any inputs; the default input also lands on the default output
        let mut outputs = ctx.inputs.clone();
        if let Some(value) = ctx.inputs.get(DEFAULT_INPUT_PORT) {
            outputs.insert(DEFAULT_OUTPUT_PORT.to_string(), value.clone());
        }

        Ok(NodeOutput {
            outputs,
            metadata: weavecore::NodeMetadata::default(),
        })
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PortDefinition::optional("input", "Passed through unchanged")],
            outputs: vec![PortDefinition::optional("output", "The delayed input")],
            terminal: false,
            operation_class: OperationClass::Pacing,
        }
    }
}
