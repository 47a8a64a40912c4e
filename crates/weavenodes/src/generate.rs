use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{BinaryPayload, DataKind, Node, NodeContext, NodeError, NodeOutput, OperationClass, Value};
use weaveruntime::{
    collect_response, AiBackend, BackendRequest, NodeFactory, NodeMetadata, Operation,
    PortDefinition,
};

/// Inline settings forwarded to the backend untouched.
const TEXT_PARAMETERS: &[&str] = &["temperature", "max_tokens", "top_p"];
const IMAGE_PARAMETERS: &[&str] = &["size", "quality", "style"];

fn base_request(
    ctx: &NodeContext,
    operation: Operation,
    default_provider: &str,
    parameters: &[&str],
) -> BackendRequest {
    let provider = ctx.data_str("provider").unwrap_or(default_provider);
    let model = ctx.data_str("model").map(str::to_string);

    let mut request = BackendRequest::new(operation, provider).with_model(model);
    for name in parameters {
        if let Some(value) = ctx.data.get(*name) {
            request = request.with_parameter(*name, value.clone());
        }
    }
    request
}

fn check_numeric(data: &HashMap<String, Value>, names: &[&str]) -> Result<(), NodeError> {
    for name in names {
        match data.get(*name) {
            None | Some(Value::Null) | Some(Value::Number(_)) => {}
            Some(other) => {
                return Err(NodeError::InvalidInputType {
                    field: name.to_string(),
                    expected: "number".to_string(),
                    actual: other.to_text(),
                })
            }
        }
    }
    Ok(())
}

/// Accept an image as a payload, a JSON envelope, a data URL or bare base64.
pub fn as_image(field: &str, value: &Value) -> Result<BinaryPayload, NodeError> {
    let invalid = |actual: &str| NodeError::InvalidInputType {
        field: field.to_string(),
        expected: "image".to_string(),
        actual: actual.to_string(),
    };

    match value {
        Value::Binary(payload) if payload.kind == DataKind::Image => Ok(payload.clone()),
        Value::Binary(_) => Err(invalid("audio")),
        Value::Json(json) => BinaryPayload::from_envelope(json)
            .filter(|p| p.kind == DataKind::Image)
            .ok_or_else(|| invalid("json")),
        Value::String(s) => {
            let (media_type, encoded) = match s.strip_prefix("data:") {
                Some(rest) => {
                    let (header, data) = rest.split_once(',').ok_or_else(|| invalid("data url"))?;
                    let media = header.trim_end_matches(";base64");
                    (media.to_string(), data)
                }
                None => ("image/png".to_string(), s.as_str()),
            };
            BinaryPayload::from_base64(DataKind::Image, encoded, media_type)
                .map_err(|_| invalid("text"))
        }
        _ => Err(invalid("other")),
    }
}

/// Text generation through the AI backend
pub struct TextGenerationNode {
    backend: Arc<dyn AiBackend>,
    default_provider: String,
}

impl TextGenerationNode {
    pub fn new(backend: Arc<dyn AiBackend>, default_provider: impl Into<String>) -> Self {
        Self {
            backend,
            default_provider: default_provider.into(),
        }
    }
}

#[async_trait]
impl Node for TextGenerationNode {
    fn node_type(&self) -> &str {
        "text.generate"
    }

    fn validate_data(&self, data: &HashMap<String, Value>) -> Result<(), NodeError> {
        check_numeric(data, TEXT_PARAMETERS)
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let prompt = ctx.require_text("prompt")?;
        let stream = ctx.data.get("stream").and_then(Value::as_bool).unwrap_or(true);

        let mut request = base_request(&ctx, Operation::Text, &self.default_provider, TEXT_PARAMETERS)
            .streaming(stream)
            .with_input("prompt", Value::String(prompt));
        if let Some(system) = ctx.optional_text("system") {
            request = request.with_input("system", Value::String(system));
        }
        if let Some(image) = ctx.inputs.get("image").filter(|v| !v.is_null()) {
            request = request.with_input("image", Value::Binary(as_image("image", image)?));
        }

        ctx.events
            .info(format!("Generating text via {}", request.provider));

        let signal = &ctx.cancellation;
        let response = signal
            .guard(async {
                self.backend
                    .invoke(request, signal)
                    .await
                    .map_err(NodeError::from)
            })
            .await?;

        let events = ctx.events.clone();
        let text = collect_response(response, signal, |partial| events.partial(partial)).await?;

        Ok(NodeOutput::single(text))
    }
}

pub struct TextGenerationNodeFactory {
    pub backend: Arc<dyn AiBackend>,
    pub default_provider: String,
}

impl NodeFactory for TextGenerationNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TextGenerationNode::new(
            self.backend.clone(),
            self.default_provider.clone(),
        )))
    }

    fn node_type(&self) -> &str {
        "text.generate"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Generate text from a prompt".to_string(),
            category: "ai".to_string(),
            inputs: vec![
                PortDefinition::required("prompt", "Prompt text"),
                PortDefinition::optional("system", "System instructions"),
                PortDefinition::optional("image", "Image to reason about"),
            ],
            outputs: vec![PortDefinition::optional("output", "Generated text")],
            terminal: false,
            operation_class: OperationClass::Text,
        }
    }
}

/// Image generation through the AI backend
pub struct ImageGenerationNode {
    backend: Arc<dyn AiBackend>,
    default_provider: String,
}

impl ImageGenerationNode {
    pub fn new(backend: Arc<dyn AiBackend>, default_provider: impl Into<String>) -> Self {
        Self {
            backend,
            default_provider: default_provider.into(),
        }
    }
}

#[async_trait]
impl Node for ImageGenerationNode {
    fn node_type(&self) -> &str {
        "image.generate"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let prompt = ctx.require_text("prompt")?;

        let mut request =
            base_request(&ctx, Operation::Image, &self.default_provider, IMAGE_PARAMETERS)
                .with_input("prompt", Value::String(prompt));
        if let Some(reference) = ctx.inputs.get("image").filter(|v| !v.is_null()) {
            request = request.with_input("image", Value::Binary(as_image("image", reference)?));
        }

        ctx.events
            .info(format!("Generating image via {}", request.provider));

        let signal = &ctx.cancellation;
        let response = signal
            .guard(async {
                self.backend
                    .invoke(request, signal)
                    .await
                    .map_err(NodeError::from)
            })
            .await?;
        let value = collect_response(response, signal, |_| {}).await?;

        let image = as_image("output", &value).map_err(|_| {
            NodeError::ExecutionFailed("backend returned no image".to_string())
        })?;
        Ok(NodeOutput::single(image))
    }
}

pub struct ImageGenerationNodeFactory {
    pub backend: Arc<dyn AiBackend>,
    pub default_provider: String,
}

impl NodeFactory for ImageGenerationNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ImageGenerationNode::new(
            self.backend.clone(),
            self.default_provider.clone(),
        )))
    }

    fn node_type(&self) -> &str {
        "image.generate"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Generate an image from a prompt".to_string(),
            category: "ai".to_string(),
            inputs: vec![
                PortDefinition::required("prompt", "Image description"),
                PortDefinition::optional("image", "Reference image"),
            ],
            outputs: vec![PortDefinition::optional("output", "Generated image")],
            terminal: false,
            operation_class: OperationClass::Image,
        }
    }
}
