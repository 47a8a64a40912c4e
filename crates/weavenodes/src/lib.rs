//! Standard node library
//!
//! Built-in nodes: graph input/output, text and image generation, snippet
//! transforms, audio capture, realtime sessions and delays.

mod capture;
mod code;
mod generate;
mod http_backend;
mod passthrough;
mod session;
mod time;

pub use capture::{AudioCaptureNode, AudioCaptureNodeFactory};
pub use code::{CodeTransformNode, CodeTransformNodeFactory};
pub use generate::{
    as_image, ImageGenerationNode, ImageGenerationNodeFactory, TextGenerationNode,
    TextGenerationNodeFactory,
};
pub use http_backend::{HttpBackend, HttpBackendConfig};
pub use passthrough::{InputNode, InputNodeFactory, OutputNode, OutputNodeFactory};
pub use session::{RealtimeSessionNode, RealtimeSessionNodeFactory};
pub use time::{DelayNode, DelayNodeFactory};

use std::sync::Arc;
use weaveruntime::{AiBackend, CodeEvaluator, NodeRegistry};

/// Collaborators shared by the nodes that reach outside the process
#[derive(Clone)]
pub struct NodeServices {
    pub backend: Arc<dyn AiBackend>,
    pub evaluator: Arc<dyn CodeEvaluator>,
    pub default_provider: String,
}

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry, services: &NodeServices) {
    registry.register(Arc::new(InputNodeFactory));
    registry.register(Arc::new(OutputNodeFactory));
    registry.register(Arc::new(TextGenerationNodeFactory {
        backend: services.backend.clone(),
        default_provider: services.default_provider.clone(),
    }));
    registry.register(Arc::new(ImageGenerationNodeFactory {
        backend: services.backend.clone(),
        default_provider: services.default_provider.clone(),
    }));
    registry.register(Arc::new(CodeTransformNodeFactory {
        evaluator: services.evaluator.clone(),
    }));
    registry.register(Arc::new(AudioCaptureNodeFactory));
    registry.register(Arc::new(RealtimeSessionNodeFactory {
        backend: services.backend.clone(),
        default_provider: services.default_provider.clone(),
    }));
    registry.register(Arc::new(DelayNodeFactory));
}
