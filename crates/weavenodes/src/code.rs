use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{Node, NodeContext, NodeError, NodeOutput, OperationClass, Value};
use weaveruntime::{CodeEvaluator, NodeFactory, NodeMetadata, PortDefinition};

/// Runs a code snippet against the node's inputs.
///
/// The snippet usually comes from an upstream text node on the `code` port
/// and falls back to the inline `code` setting. It sees `input` and the full
/// `inputs` map; whatever it returns becomes the node's text output.
pub struct CodeTransformNode {
    evaluator: Arc<dyn CodeEvaluator>,
}

impl CodeTransformNode {
    pub fn new(evaluator: Arc<dyn CodeEvaluator>) -> Self {
        Self { evaluator }
    }
}

/// Strip a surrounding markdown fence, which generated code often carries.
fn strip_fence(code: &str) -> &str {
    let trimmed = code.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[async_trait]
impl Node for CodeTransformNode {
    fn node_type(&self) -> &str {
        "code.transform"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let source = ctx.require_text("code")?;
        let code = strip_fence(&source);

        let mut inputs = ctx.inputs.clone();
        inputs.remove("code");

        ctx.events.info(format!("Evaluating {} bytes of code", code.len()));
        let output = self
            .evaluator
            .evaluate(code, &inputs, &ctx.cancellation)
            .await?;

        Ok(NodeOutput::single(output))
    }
}

pub struct CodeTransformNodeFactory {
    pub evaluator: Arc<dyn CodeEvaluator>,
}

impl NodeFactory for CodeTransformNodeFactory {
    fn create(&self, _data: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(CodeTransformNode::new(self.evaluator.clone())))
    }

    fn node_type(&self) -> &str {
        "code.transform"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Transform a value with a code snippet".to_string(),
            category: "transform".to_string(),
            inputs: vec![
                PortDefinition::required("code", "Snippet body; `return` yields the output"),
                PortDefinition::optional("input", "Value exposed as `input`"),
            ],
            outputs: vec![PortDefinition::optional("output", "Snippet result as text")],
            terminal: false,
            operation_class: OperationClass::Code,
        }
    }
}
