//! Contract between generation nodes and the remote AI backend.
//!
//! The engine never talks to a model provider directly. Nodes build a
//! [`BackendRequest`] and hand it to whatever [`AiBackend`] the runtime was
//! configured with; failures come back as [`BackendError`] carrying a
//! [`FailureReason`] that maps onto the node's error kind.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use weavecore::{BinaryPayload, CancelSignal, FailureReason, NodeError, Value};

/// Which backend operation a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Text,
    Image,
    Session,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Text => "text",
            Operation::Image => "image",
            Operation::Session => "session",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub operation: Operation,
    pub provider: String,
    pub model: Option<String>,
    /// Resolved node inputs (prompt, system, image...)
    pub inputs: HashMap<String, Value>,
    /// Provider options taken from the node's inline data
    pub parameters: HashMap<String, Value>,
    /// Ask for incremental output when the backend supports it
    pub stream: bool,
}

impl BackendRequest {
    pub fn new(operation: Operation, provider: impl Into<String>) -> Self {
        Self {
            operation,
            provider: provider.into(),
            model: None,
            inputs: HashMap::new(),
            parameters: HashMap::new(),
            stream: false,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// One increment of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Text delta, appended to what came before
    Text(String),
    /// Complete binary payload; the last one wins
    Binary(BinaryPayload),
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk, BackendError>>;

pub enum BackendResponse {
    Complete(Value),
    Stream(ChunkStream),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendResponse::Complete(value) => f.debug_tuple("Complete").field(value).finish(),
            BackendResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason}: {message}")]
pub struct BackendError {
    pub reason: FailureReason,
    pub message: String,
}

impl BackendError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Network, message)
    }

    /// Error for a request abandoned because its signal tripped.
    pub fn from_signal(signal: &CancelSignal) -> Self {
        match signal.check() {
            Err(NodeError::Timeout { millis }) => {
                Self::new(FailureReason::Timeout, format!("no response within {}ms", millis))
            }
            _ => Self::new(FailureReason::Cancelled, "request aborted"),
        }
    }
}

impl From<BackendError> for NodeError {
    fn from(err: BackendError) -> Self {
        match err.reason {
            FailureReason::Network => NodeError::Network(err.message),
            FailureReason::Cancelled => NodeError::Cancelled,
            reason => NodeError::Remote {
                reason,
                message: err.message,
            },
        }
    }
}

/// Remote AI backend
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn name(&self) -> &str {
        "backend"
    }

    /// Issue one request. Implementations must abandon the transport call
    /// once `cancel` trips.
    async fn invoke(
        &self,
        request: BackendRequest,
        cancel: &CancelSignal,
    ) -> Result<BackendResponse, BackendError>;
}

/// Drain a response into its final value.
///
/// Text deltas are accumulated and each running total is handed to
/// `on_partial`. Stops with the signal's error if it trips mid-stream.
pub async fn collect_response<F>(
    response: BackendResponse,
    cancel: &CancelSignal,
    mut on_partial: F,
) -> Result<Value, NodeError>
where
    F: FnMut(Value),
{
    let mut stream = match response {
        BackendResponse::Complete(value) => return Ok(value),
        BackendResponse::Stream(stream) => stream,
    };

    let mut text = String::new();
    let mut binary: Option<BinaryPayload> = None;

    while let Some(chunk) = cancel.guard(async { Ok(stream.next().await) }).await? {
        match chunk? {
            StreamChunk::Text(delta) => {
                text.push_str(&delta);
                on_partial(Value::String(text.clone()));
            }
            StreamChunk::Binary(payload) => binary = Some(payload),
        }
    }

    Ok(match binary {
        Some(payload) => Value::Binary(payload),
        None => Value::String(text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use weavecore::{CancellationToken, DataKind, ErrorKind};

    #[test]
    fn backend_reasons_map_to_node_error_kinds() {
        let cases = [
            (FailureReason::Network, ErrorKind::Network),
            (FailureReason::Cancelled, ErrorKind::Cancelled),
            (FailureReason::Timeout, ErrorKind::Timeout),
            (FailureReason::RateLimited, ErrorKind::Remote),
            (FailureReason::Unauthorized, ErrorKind::Remote),
        ];
        for (reason, kind) in cases {
            let err: NodeError = BackendError::new(reason, "x").into();
            assert_eq!(err.kind(), kind, "{:?}", reason);
        }
    }

    #[tokio::test]
    async fn collect_accumulates_text_and_reports_partials() {
        let chunks = vec![
            Ok(StreamChunk::Text("Hel".into())),
            Ok(StreamChunk::Text("lo".into())),
        ];
        let response = BackendResponse::Stream(stream::iter(chunks).boxed());
        let mut partials = Vec::new();

        let value = collect_response(response, &CancelSignal::detached(), |v| partials.push(v))
            .await
            .unwrap();

        assert_eq!(value, Value::from("Hello"));
        assert_eq!(partials, vec![Value::from("Hel"), Value::from("Hello")]);
    }

    #[tokio::test]
    async fn collect_keeps_last_binary() {
        let image = BinaryPayload::new(DataKind::Image, vec![1, 2, 3], "image/png");
        let chunks = vec![Ok(StreamChunk::Binary(image.clone()))];
        let response = BackendResponse::Stream(stream::iter(chunks).boxed());

        let value = collect_response(response, &CancelSignal::detached(), |_| {})
            .await
            .unwrap();
        assert_eq!(value, Value::Binary(image));
    }

    #[tokio::test]
    async fn collect_stops_when_cancelled() {
        let token = CancellationToken::new();
        let signal = CancelSignal::compose(token.clone(), None);
        token.cancel();

        let response = BackendResponse::Stream(stream::pending().boxed());
        let result = collect_response(response, &signal, |_| {}).await;
        assert_eq!(result, Err(NodeError::Cancelled));
    }

    #[tokio::test]
    async fn stream_error_surfaces_as_node_error() {
        let chunks = vec![
            Ok(StreamChunk::Text("partial".into())),
            Err(BackendError::new(FailureReason::RateLimited, "slow down")),
        ];
        let response = BackendResponse::Stream(stream::iter(chunks).boxed());

        let err = collect_response(response, &CancelSignal::detached(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
    }
}
