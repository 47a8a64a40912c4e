//! Evaluation of user-authored code snippets.
//!
//! Snippets pass a static [`CodeFilter`] and then run in a separate
//! interpreter process with a cleared environment, a heap cap, a wall-clock
//! kill and capped output. None of this is a security boundary: the filter is
//! a keyword screen and the process shares the host's filesystem and
//! network. Treat snippets as trusted-ish input.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use weavecore::{CancelSignal, NodeError, Value};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Code too large (max {max} bytes, got {actual} bytes)")]
    CodeTooLarge { max: usize, actual: usize },

    #[error("Dangerous code detected: {0}")]
    DangerousCode(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Output too large (max {max} bytes)")]
    OutputTooLarge { max: usize },

    #[error("Execution timeout after {millis}ms")]
    ExecutionTimeout { millis: u64 },

    #[error("{0}")]
    Interrupted(NodeError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<SandboxError> for NodeError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::CodeTooLarge { .. } | SandboxError::DangerousCode(_) => {
                NodeError::Validation(err.to_string())
            }
            SandboxError::ExecutionTimeout { millis } => NodeError::Timeout { millis },
            SandboxError::Interrupted(inner) => inner,
            other => NodeError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Something that can run a snippet against resolved node inputs.
#[async_trait]
pub trait CodeEvaluator: Send + Sync {
    /// Evaluate `code` as a function body with `input` and `inputs` in scope.
    async fn evaluate(
        &self,
        code: &str,
        inputs: &HashMap<String, Value>,
        cancel: &CancelSignal,
    ) -> Result<String, SandboxError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter executable
    pub program: String,
    /// Extra interpreter flags placed before the harness
    pub args: Vec<String>,
    pub max_code_length: usize,
    pub max_output_bytes: usize,
    pub memory_limit_mb: u64,
    /// Wall-clock limit; the process is killed when it elapses
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: Vec::new(),
            max_code_length: 10_000,
            max_output_bytes: 1024 * 1024,
            memory_limit_mb: 64,
            timeout_ms: 10_000,
        }
    }
}

/// Patterns rejected before anything runs.
const DENY_RULES: &[(&str, &str)] = &[
    (
        r"\b(?:globalThis|window|global|self|this)\s*\[",
        "indexed access into a global object",
    ),
    (r"__proto__", "prototype access"),
    (
        r"\b(?:constructor|prototype|getPrototypeOf|setPrototypeOf|defineProperty)\b",
        "prototype access",
    ),
    (
        r"\b(?:globalThis|window|global|process|require|module|import|eval|Function|Reflect|Proxy)\b",
        "global or module access",
    ),
    (r"\bwhile\s*\(\s*(?:true|1|!0)\s*\)", "unbounded loop"),
    (r"\bfor\s*\([^;)]*;\s*;", "unbounded loop"),
    (r"\bdo\s*\{", "unbounded loop"),
    (
        r"\b(?:async|await|Promise|setTimeout|setInterval|setImmediate|queueMicrotask|yield)\b",
        "asynchronous construct",
    ),
];

/// Static screen applied to every snippet.
#[derive(Debug, Clone)]
pub struct CodeFilter {
    max_code_length: usize,
    rules: Vec<(Regex, &'static str)>,
}

impl CodeFilter {
    pub fn new(max_code_length: usize) -> Result<Self, SandboxError> {
        let rules = DENY_RULES
            .iter()
            .map(|(pattern, label)| {
                Regex::new(pattern)
                    .map(|re| (re, *label))
                    .map_err(|e| SandboxError::InternalError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_code_length,
            rules,
        })
    }

    pub fn validate(&self, code: &str) -> Result<(), SandboxError> {
        if code.len() > self.max_code_length {
            return Err(SandboxError::CodeTooLarge {
                max: self.max_code_length,
                actual: code.len(),
            });
        }

        for (re, label) in &self.rules {
            if let Some(found) = re.find(code) {
                return Err(SandboxError::DangerousCode(format!(
                    "{} ('{}')",
                    label,
                    found.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Reads `{code, inputs}` from stdin and prints the snippet's return value.
const HARNESS: &str = r#"
const chunks = [];
process.stdin.on('data', (c) => chunks.push(c));
process.stdin.on('end', () => {
  const req = JSON.parse(Buffer.concat(chunks).toString('utf8'));
  let out;
  try {
    const fn = new Function('input', 'inputs', req.code);
    out = fn(req.inputs.input, req.inputs);
  } catch (e) {
    process.stderr.write(String((e && e.message) || e));
    process.exit(1);
  }
  if (out === undefined) out = null;
  process.stdout.write(typeof out === 'string' ? out : JSON.stringify(out));
});
"#;

const STDERR_CAP: u64 = 64 * 1024;

enum Outcome {
    Finished(Result<String, SandboxError>),
    TimedOut,
    Stopped(NodeError),
}

/// Runs snippets in a child interpreter process
pub struct ProcessSandbox {
    config: SandboxConfig,
    filter: CodeFilter,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let filter = CodeFilter::new(config.max_code_length)?;
        Ok(Self { config, filter })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(format!("--max-old-space-size={}", self.config.memory_limit_mb))
            .arg("-e")
            .arg(HARNESS)
            .env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CodeEvaluator for ProcessSandbox {
    async fn evaluate(
        &self,
        code: &str,
        inputs: &HashMap<String, Value>,
        cancel: &CancelSignal,
    ) -> Result<String, SandboxError> {
        self.filter.validate(code)?;
        cancel.check().map_err(SandboxError::Interrupted)?;

        let plain: serde_json::Map<String, serde_json::Value> = inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_plain_json()))
            .collect();
        let request = serde_json::json!({ "code": code, "inputs": plain });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| SandboxError::SerializationError(e.to_string()))?;

        let mut child = self.command().spawn().map_err(|e| {
            SandboxError::SandboxUnavailable(format!("{}: {}", self.config.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| SandboxError::ExecutionError(format!("Failed to write stdin: {}", e)))?;
            drop(stdin);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_output = self.config.max_output_bytes;

        let wall = Duration::from_millis(self.config.timeout_ms);
        let limit = cancel.remaining().map_or(wall, |left| left.min(wall));

        let outcome = {
            let run = async {
                let stderr_task = tokio::spawn(async move {
                    let mut data = Vec::new();
                    if let Some(err) = stderr {
                        let _ = err.take(STDERR_CAP).read_to_end(&mut data).await;
                    }
                    data
                });

                let mut out = Vec::new();
                if let Some(stdout) = stdout {
                    let _ = stdout
                        .take(max_output as u64 + 1)
                        .read_to_end(&mut out)
                        .await;
                }
                if out.len() > max_output {
                    return Err(SandboxError::OutputTooLarge { max: max_output });
                }

                let status = child
                    .wait()
                    .await
                    .map_err(|e| SandboxError::ExecutionError(format!("Process wait failed: {}", e)))?;
                let err = stderr_task.await.unwrap_or_default();

                if status.success() {
                    Ok(String::from_utf8_lossy(&out).trim_end().to_string())
                } else {
                    let message = String::from_utf8_lossy(&err).trim().to_string();
                    Err(SandboxError::ExecutionError(if message.is_empty() {
                        format!("interpreter exited with {}", status)
                    } else {
                        message
                    }))
                }
            };

            tokio::select! {
                res = tokio::time::timeout(limit, run) => match res {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut,
                },
                reason = cancel.tripped() => Outcome::Stopped(cancel.error_for(reason)),
            }
        };

        match outcome {
            Outcome::Finished(result) => {
                if result.is_err() {
                    let _ = child.kill().await;
                }
                result
            }
            Outcome::TimedOut => {
                tracing::warn!("Snippet exceeded {}ms; killing interpreter", limit.as_millis());
                let _ = child.kill().await;
                // A node deadline shorter than the sandbox limit reports as the node's timeout.
                match cancel.check() {
                    Err(e) => Err(SandboxError::Interrupted(e)),
                    Ok(()) => Err(SandboxError::ExecutionTimeout {
                        millis: limit.as_millis() as u64,
                    }),
                }
            }
            Outcome::Stopped(e) => {
                let _ = child.kill().await;
                Err(SandboxError::Interrupted(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> CodeFilter {
        CodeFilter::new(10_000).unwrap()
    }

    #[test]
    fn benign_code_passes() {
        let f = filter();
        assert!(f.validate("return input.toUpperCase();").is_ok());
        assert!(f
            .validate("const out = []; for (let i = 0; i < 3; i++) { out.push(i); } return out;")
            .is_ok());
        assert!(f.validate("return JSON.stringify({ important: true });").is_ok());
    }

    #[test]
    fn oversized_code_is_rejected() {
        let code = "x".repeat(10_001);
        assert!(matches!(
            filter().validate(&code),
            Err(SandboxError::CodeTooLarge { max: 10_000, actual: 10_001 })
        ));
    }

    #[test]
    fn each_deny_category_is_rejected() {
        let f = filter();
        let samples = [
            "return this['pro' + 'cess'];",
            "return {}.__proto__;",
            "return input.constructor.constructor('return 1')();",
            "return Object.getPrototypeOf(input);",
            "return globalThis;",
            "const fs = require('fs');",
            "return eval('1 + 1');",
            "return new Function('return 1')();",
            "while (true) {}",
            "while(1){}",
            "for (;;) {}",
            "do { x++; } while (x < 10);",
            "await fetch('x');",
            "return new Promise(() => {});",
            "setTimeout(() => {}, 10);",
        ];
        for code in samples {
            assert!(
                matches!(f.validate(code), Err(SandboxError::DangerousCode(_))),
                "expected rejection: {}",
                code
            );
        }
    }

    #[tokio::test]
    async fn rejected_code_never_starts_the_interpreter() {
        let sandbox = ProcessSandbox::new(SandboxConfig {
            program: "/nonexistent/interpreter".to_string(),
            ..SandboxConfig::default()
        })
        .unwrap();

        let err = sandbox
            .evaluate("return eval('1')", &HashMap::new(), &CancelSignal::detached())
            .await
            .unwrap_err();
        // Spawning would have failed with SandboxUnavailable.
        assert!(matches!(err, SandboxError::DangerousCode(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_is_reported() {
        let sandbox = ProcessSandbox::new(SandboxConfig {
            program: "/nonexistent/interpreter".to_string(),
            ..SandboxConfig::default()
        })
        .unwrap();

        let err = sandbox
            .evaluate("return 1;", &HashMap::new(), &CancelSignal::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SandboxUnavailable(_)));
    }

    #[test]
    fn filter_errors_are_validation_errors() {
        let err: NodeError = SandboxError::DangerousCode("x".into()).into();
        assert_eq!(err.kind(), weavecore::ErrorKind::Validation);
        let err: NodeError = SandboxError::ExecutionTimeout { millis: 5 }.into();
        assert_eq!(err, NodeError::Timeout { millis: 5 });
    }

    /// Evaluate with the default interpreter; `None` when it isn't installed.
    async fn evaluate_if_available(
        config: SandboxConfig,
        code: &str,
        inputs: &HashMap<String, Value>,
    ) -> Option<Result<String, SandboxError>> {
        let sandbox = ProcessSandbox::new(config).unwrap();
        match sandbox.evaluate(code, inputs, &CancelSignal::detached()).await {
            Err(SandboxError::SandboxUnavailable(reason)) => {
                eprintln!("skipping, interpreter unavailable: {}", reason);
                None
            }
            other => Some(other),
        }
    }

    #[tokio::test]
    async fn evaluates_snippet_with_inputs() {
        let mut inputs = HashMap::new();
        inputs.insert("input".to_string(), Value::from("hello"));

        let Some(out) =
            evaluate_if_available(SandboxConfig::default(), "return input.toUpperCase();", &inputs)
                .await
        else {
            return;
        };
        assert_eq!(out.unwrap(), "HELLO");
    }

    #[tokio::test]
    async fn runaway_snippet_is_killed_at_wall_clock_deadline() {
        let config = SandboxConfig {
            timeout_ms: 500,
            ..SandboxConfig::default()
        };
        let started = std::time::Instant::now();
        let Some(out) = evaluate_if_available(
            config,
            "let i = 0; for (;i >= 0;) { i++; }",
            &HashMap::new(),
        )
        .await
        else {
            return;
        };

        assert!(matches!(out, Err(SandboxError::ExecutionTimeout { millis: 500 })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
