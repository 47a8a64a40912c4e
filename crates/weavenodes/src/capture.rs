use async_trait::async_trait;
use std::collections::HashMap;
use weavecore::{
    BinaryPayload, DataKind, Node, NodeContext, NodeError, NodeOutput, OperationClass, Value,
};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition};

/// Suspends the run until someone delivers a recording (or a transcript).
pub struct AudioCaptureNode;

fn normalize(value: Value) -> Value {
    match value {
        Value::Json(json) => match BinaryPayload::from_envelope(&json) {
            Some(payload) => Value::Binary(payload),
            None => Value::Json(json),
        },
        Value::Binary(mut payload) if payload.kind != DataKind::Audio => {
            payload.kind = DataKind::Audio;
            Value::Binary(payload)
        }
        other => other,
    }
}

#[async_trait]
impl Node for AudioCaptureNode {
    fn node_type(&self) -> &str {
        "audio.capture"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let waiter = ctx
            .pending_inputs
            .wait_for_input(&ctx.node_id)
            .map_err(|e| NodeError::Validation(e.to_string()))?;

        let prompt = ctx.data_str("prompt").map(str::to_string);
        ctx.events.awaiting_input(prompt);
        tracing::debug!("{} waiting for audio", ctx.node_id);

        match waiter.await {
            Some(value) => Ok(NodeOutput::single(normalize(value))),
            None => Err(NodeError::Cancelled),
        }
    }
}

pub struct AudioCaptureNodeFactory;

impl NodeFactory for AudioCaptureNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(AudioCaptureNode))
    }

    fn node_type(&self) -> &str {
        "audio.capture"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Wait for a recording supplied while the run is live".to_string(),
            category: "input".to_string(),
            inputs: vec![PortDefinition::optional("input", "Ignored; orders the capture")],
            outputs: vec![PortDefinition::optional("output", "Delivered audio or text")],
            terminal: false,
            operation_class: OperationClass::Audio,
        }
    }
}
