use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{Node, NodeContext, NodeError, NodeOutput, OperationClass, Value};
use weaveruntime::{
    AiBackend, BackendRequest, BackendResponse, NodeFactory, NodeMetadata, Operation,
    PortDefinition, StreamChunk,
};

/// Opens a duplex backend session and leaves it running beside the graph.
///
/// The node settles as soon as the session is open; incoming chunks are
/// relayed as `data` events until the run is cancelled or the backend hangs
/// up.
pub struct RealtimeSessionNode {
    backend: Arc<dyn AiBackend>,
    default_provider: String,
}

impl RealtimeSessionNode {
    pub fn new(backend: Arc<dyn AiBackend>, default_provider: impl Into<String>) -> Self {
        Self {
            backend,
            default_provider: default_provider.into(),
        }
    }
}

#[async_trait]
impl Node for RealtimeSessionNode {
    fn node_type(&self) -> &str {
        "realtime.session"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let provider = ctx.data_str("provider").unwrap_or(&self.default_provider);
        let mut request = BackendRequest::new(Operation::Session, provider)
            .with_model(ctx.data_str("model").map(str::to_string))
            .streaming(true);
        if let Some(instructions) = ctx.optional_text("instructions") {
            request = request.with_input("instructions", Value::String(instructions));
        }
        if let Some(voice) = ctx.data.get("voice") {
            request = request.with_parameter("voice", voice.clone());
        }

        let signal = &ctx.cancellation;
        let response = signal
            .guard(async {
                self.backend
                    .invoke(request, signal)
                    .await
                    .map_err(NodeError::from)
            })
            .await?;

        let mut stream = match response {
            BackendResponse::Stream(stream) => stream,
            BackendResponse::Complete(_) => {
                return Err(NodeError::ExecutionFailed(
                    "backend did not open a session stream".to_string(),
                ))
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let events = ctx.events.clone();
        ctx.sessions.spawn(session_id.clone(), async move {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::Text(text)) => events.data("transcript", Value::String(text)),
                    Ok(StreamChunk::Binary(payload)) => events.data("audio", Value::Binary(payload)),
                    Err(e) => {
                        events.warn(format!("Session closed: {}", e));
                        break;
                    }
                }
            }
        });
        ctx.events.info(format!("Session {} open", session_id));

        let mut output = HashMap::new();
        output.insert("session_id".to_string(), Value::String(session_id));
        output.insert("status".to_string(), Value::from("open"));
        Ok(NodeOutput::single(Value::Object(output)))
    }
}

pub struct RealtimeSessionNodeFactory {
    pub backend: Arc<dyn AiBackend>,
    pub default_provider: String,
}

impl NodeFactory for RealtimeSessionNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(RealtimeSessionNode::new(
            self.backend.clone(),
            self.default_provider.clone(),
        )))
    }

    fn node_type(&self) -> &str {
        "realtime.session"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Open a realtime voice session".to_string(),
            category: "ai".to_string(),
            inputs: vec![PortDefinition::optional("instructions", "Session instructions")],
            outputs: vec![PortDefinition::optional("output", "Session handle")],
            terminal: false,
            operation_class: OperationClass::Audio,
        }
    }
}
