use async_trait::async_trait;
use std::collections::HashMap;
use weavecore::{Node, NodeContext, NodeError, NodeOutput, Value, DEFAULT_INPUT_PORT};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition};

/// Entry point: emits its inline `value`, or the run's initial input
pub struct InputNode;

#[async_trait]
impl Node for InputNode {
    fn node_type(&self) -> &str {
        "input"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .data
            .get("value")
            .filter(|v| !v.is_null())
            .or_else(|| ctx.inputs.get(DEFAULT_INPUT_PORT))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(NodeOutput::single(value))
    }
}

pub struct InputNodeFactory;

impl NodeFactory for InputNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(InputNode))
    }

    fn node_type(&self) -> &str {
        "input"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Feed a literal value or the run input into the graph".to_string(),
            category: "io".to_string(),
            inputs: vec![PortDefinition::optional("input", "Initial run input")],
            outputs: vec![PortDefinition::optional("output", "The value")],
            ..NodeMetadata::default()
        }
    }
}

/// Exit point: its value becomes part of the run result
pub struct OutputNode;

#[async_trait]
impl Node for OutputNode {
    fn node_type(&self) -> &str {
        "output"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input(DEFAULT_INPUT_PORT)?.clone();
        Ok(NodeOutput::single(value))
    }
}

pub struct OutputNodeFactory;

impl NodeFactory for OutputNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(OutputNode))
    }

    fn node_type(&self) -> &str {
        "output"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Collect a value into the run result".to_string(),
            category: "io".to_string(),
            inputs: vec![PortDefinition::required("input", "Value to collect")],
            outputs: vec![PortDefinition::optional("output", "The collected value")],
            terminal: true,
            ..NodeMetadata::default()
        }
    }
}
