use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use weavecore::{BinaryPayload, CancelSignal, FailureReason, Value};
use weaveruntime::{
    AiBackend, BackendError, BackendRequest, BackendResponse, ChunkStream, StreamChunk,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Provider used when a node does not name one
    pub default_provider: String,
    pub connect_timeout_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            default_provider: "openai".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

/// AI backend reached over HTTP.
///
/// Each request is a `POST {base_url}/v1/{operation}`. Complete answers come
/// back as `{"output": ...}`; streamed answers as newline-delimited JSON
/// (`{"delta": "..."}` or a binary envelope per line). Failures carry
/// `{"reason", "message"}`.
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        // A local gateway is never reached through a proxy.
        let loopback = reqwest::Url::parse(&config.base_url)
            .ok()
            .and_then(|url| url.host_str().map(|h| matches!(h, "localhost" | "127.0.0.1" | "[::1]")))
            .unwrap_or(false);
        if loopback {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| BackendError::network(format!("Failed to build client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn endpoint(&self, request: &BackendRequest) -> String {
        format!(
            "{}/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            request.operation.as_str()
        )
    }

    async fn send(&self, request: BackendRequest) -> Result<BackendResponse, BackendError> {
        let url = self.endpoint(&request);
        let plain = |map: &std::collections::HashMap<String, Value>| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.to_plain_json()))
                .collect::<serde_json::Map<_, _>>()
        };
        let body = json!({
            "operation": request.operation,
            "provider": request.provider,
            "model": request.model,
            "inputs": plain(&request.inputs),
            "parameters": plain(&request.parameters),
            "stream": request.stream,
        });

        tracing::debug!("POST {} (provider {})", url, request.provider);
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        if request.stream {
            builder = builder.header(ACCEPT, "application/x-ndjson");
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_body(status, &text));
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.contains("ndjson") || ct.contains("event-stream"));
        if streamed {
            return Ok(BackendResponse::Stream(line_stream(response)));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            BackendError::new(FailureReason::Remote, format!("Invalid response body: {}", e))
        })?;
        let output = json.get("output").cloned().unwrap_or(json);
        Ok(BackendResponse::Complete(Value::from_plain_json(output)))
    }
}

#[async_trait]
impl AiBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(
        &self,
        request: BackendRequest,
        cancel: &CancelSignal,
    ) -> Result<BackendResponse, BackendError> {
        if cancel.is_tripped() {
            return Err(BackendError::from_signal(cancel));
        }
        // Dropping the send future aborts the connection.
        tokio::select! {
            biased;
            _ = cancel.tripped() => Err(BackendError::from_signal(cancel)),
            res = self.send(request) => res,
        }
    }
}

fn classify(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new(FailureReason::Timeout, err.to_string())
    } else {
        BackendError::network(err.to_string())
    }
}

fn status_reason(status: StatusCode) -> FailureReason {
    match status.as_u16() {
        401 | 403 => FailureReason::Unauthorized,
        429 => FailureReason::RateLimited,
        408 | 504 => FailureReason::Timeout,
        400 | 404 | 422 => FailureReason::InvalidRequest,
        _ => FailureReason::Remote,
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    reason: Option<String>,
    message: Option<String>,
}

fn error_from_body(status: StatusCode, text: &str) -> BackendError {
    let body: Option<ErrorBody> = serde_json::from_str(text).ok();
    let reason = body
        .as_ref()
        .and_then(|b| b.reason.as_deref())
        .map(FailureReason::parse)
        .unwrap_or_else(|| status_reason(status));
    let message = body
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                status.to_string()
            } else {
                text.trim().to_string()
            }
        });
    BackendError::new(reason, message)
}

/// One line of a streamed body; `None` for blank lines and keep-alives.
pub(crate) fn parse_line(line: &[u8]) -> Option<Result<StreamChunk, BackendError>> {
    let line = String::from_utf8_lossy(line);
    let text = line.trim();
    let text = text.strip_prefix("data:").map(str::trim).unwrap_or(text);
    if text.is_empty()
        || text == "[DONE]"
        || text.starts_with(':')
        || text.starts_with("event:")
        || text.starts_with("id:")
    {
        return None;
    }

    let json: serde_json::Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => {
            return Some(Err(BackendError::new(
                FailureReason::Remote,
                format!("Malformed stream chunk: {}", e),
            )))
        }
    };

    if let Some(err) = json.get("error") {
        let reason = err
            .get("reason")
            .and_then(|r| r.as_str())
            .map_or(FailureReason::Remote, FailureReason::parse);
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("stream failed");
        return Some(Err(BackendError::new(reason, message)));
    }
    if let Some(delta) = json.get("delta").and_then(|d| d.as_str()) {
        return Some(Ok(StreamChunk::Text(delta.to_string())));
    }
    BinaryPayload::from_envelope(&json).map(|payload| Ok(StreamChunk::Binary(payload)))
}

fn line_stream(response: reqwest::Response) -> ChunkStream {
    let bytes = Box::pin(response.bytes_stream());
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, mut done)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    match parse_line(&line) {
                        Some(item) => return Some((item, (bytes, buf, done))),
                        None => continue,
                    }
                }
                if done {
                    let rest = std::mem::take(&mut buf);
                    return parse_line(&rest).map(|item| (item, (bytes, buf, true)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(classify(&e)), (bytes, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}
