use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use weavecore::{
    ExecutionEvent, Graph, IdGenerator, NodeEvent, NodeExecutionState, NodeStatus, Value,
};
use weavenodes::{HttpBackend, HttpBackendConfig, NodeServices};
use weaveruntime::{FlowRuntime, NodeRegistry, ProcessSandbox, RunHandle, RuntimeConfig};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Weave graph runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Text handed to the root nodes
        #[arg(short, long)]
        input: Option<String>,

        /// Pre-supplied answer for a node that waits for input (NODE=TEXT)
        #[arg(short, long = "answer", value_parser = parse_answer)]
        answers: Vec<(String, String)>,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        backend: BackendArgs,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a graph file
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[derive(Args, Clone)]
struct BackendArgs {
    /// Base URL of the AI backend gateway
    #[arg(long, env = "WEAVE_BACKEND_URL", default_value = "http://127.0.0.1:8787")]
    backend_url: String,

    /// Bearer token for the backend
    #[arg(long, env = "WEAVE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Provider used when a node names none
    #[arg(long, env = "WEAVE_PROVIDER", default_value = "openai")]
    provider: String,
}

impl Default for BackendArgs {
    fn default() -> Self {
        let defaults = HttpBackendConfig::default();
        Self {
            backend_url: defaults.base_url,
            api_key: None,
            provider: defaults.default_provider,
        }
    }
}

fn parse_answer(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(node, _)| !node.is_empty())
        .map(|(node, text)| (node.to_string(), text.to_string()))
        .ok_or_else(|| format!("expected NODE=TEXT, got '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            answers,
            config,
            backend,
            verbose,
        } => {
            let level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
                )
                .init();

            let answers: HashMap<String, String> = answers.into_iter().collect();
            run_graph(file, input, answers, config, backend).await?;
        }

        Commands::Validate { file } => {
            validate_graph(file)?;
        }

        Commands::Nodes => {
            list_nodes()?;
        }

        Commands::Init { output } => {
            create_example_graph(output)?;
        }
    }

    Ok(())
}

fn load_graph(file: &Path) -> Result<Graph> {
    let graph_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let graph: Graph = serde_json::from_str(&graph_json)
        .with_context(|| format!("parsing {}", file.display()))?;
    Ok(graph)
}

fn build_registry(config: &RuntimeConfig, backend: &BackendArgs) -> Result<NodeRegistry> {
    let http = HttpBackend::new(HttpBackendConfig {
        base_url: backend.backend_url.clone(),
        api_key: backend.api_key.clone(),
        default_provider: backend.provider.clone(),
        ..HttpBackendConfig::default()
    })?;
    let services = NodeServices {
        backend: Arc::new(http),
        evaluator: Arc::new(ProcessSandbox::new(config.sandbox.clone())?),
        default_provider: backend.provider.clone(),
    };

    let mut registry = NodeRegistry::new();
    weavenodes::register_all(&mut registry, &services);
    Ok(registry)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Binary(payload) => {
            format!("<{}, {} bytes>", payload.media_type, payload.data.len())
        }
        other => other.to_text(),
    }
}

async fn run_graph(
    file: PathBuf,
    input: Option<String>,
    answers: HashMap<String, String>,
    config: Option<PathBuf>,
    backend: BackendArgs,
) -> Result<()> {
    println!("🚀 Loading graph from: {}", file.display());

    let graph = load_graph(&file)?;
    println!("📋 Graph: {}", graph.name);
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    println!();

    let config = match config {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let registry = build_registry(&config, &backend)?;
    let runtime = FlowRuntime::with_registry(Arc::new(registry), config);

    // Subscribe before starting so no event is missed
    let mut events = runtime.subscribe_events();
    let store = runtime.register_graph(graph).await;
    let handle = runtime
        .start_run(store.snapshot(), input.map(Value::String))
        .await?;

    let event_task = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.run_id() != handle.run_id() {
                    continue;
                }
                if print_event(event, &handle, &answers) {
                    break;
                }
            }
        })
    };

    let finished = tokio::select! {
        result = handle.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("🛑 Cancelling run...");
            handle.cancel();
            handle.wait().await
        }
    };
    let result = finished.ok_or_else(|| anyhow!("run ended without a result"))?;

    let _ = event_task.await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", result.run_id);
    println!(
        "   Succeeded: {}  Failed: {}  Skipped: {}",
        result.count(NodeStatus::Success),
        result.count(NodeStatus::Error),
        result.count(NodeStatus::Skipped)
    );

    if !result.output_order.is_empty() {
        println!();
        println!("📤 Outputs:");
        for node_id in &result.output_order {
            if let Some(value) = result.output(node_id) {
                println!("   {}: {}", node_id, display_value(value));
            }
        }
    }

    if result.cancelled {
        return Err(anyhow!("run was cancelled"));
    }
    Ok(())
}

/// Print one event; returns true once the run has completed.
fn print_event(event: ExecutionEvent, handle: &RunHandle, answers: &HashMap<String, String>) -> bool {
    match event {
        ExecutionEvent::RunStarted { node_count, .. } => {
            println!("▶️  Run started ({} nodes)", node_count);
        }
        ExecutionEvent::NodeStateChanged { node_id, state, .. } => match state {
            NodeExecutionState::Pending => {}
            NodeExecutionState::Running { partial: None } => {
                println!("  ⚡ Starting node: {}", node_id);
            }
            NodeExecutionState::Running { partial: Some(_) } => {
                tracing::trace!("{} streamed a partial", node_id);
            }
            NodeExecutionState::Success { .. } => {
                println!("  ✅ Node {} completed", node_id);
            }
            NodeExecutionState::Error { kind, message } => {
                println!("  ❌ Node {} failed ({}): {}", node_id, kind, message);
            }
            NodeExecutionState::Skipped { reason } => {
                println!("  ⏭️  Node {} skipped ({:?})", node_id, reason);
            }
        },
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::AwaitingInput { prompt } => {
                answer_input(handle, node_id, prompt, answers);
            }
            NodeEvent::Data { port, value } => {
                println!("     📡 [{}] {}: {}", node_id, port, display_value(&value));
            }
        },
        ExecutionEvent::RunCompleted {
            cancelled,
            failed,
            duration_ms,
            ..
        } => {
            if cancelled {
                println!("🛑 Run cancelled after {}ms", duration_ms);
            } else if failed == 0 {
                println!("✨ Run completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Run finished with {} failed node(s) in {}ms", failed, duration_ms);
            }
            return true;
        }
    }
    false
}

/// Deliver a pre-supplied answer, or read one line from stdin.
fn answer_input(
    handle: &RunHandle,
    node_id: String,
    prompt: Option<String>,
    answers: &HashMap<String, String>,
) {
    if let Some(text) = answers.get(&node_id) {
        println!("     💬 [{}] answering: {}", node_id, text);
        if !handle.provide_input(&node_id, Value::String(text.clone())) {
            tracing::warn!("{} stopped waiting before the answer arrived", node_id);
        }
        return;
    }

    println!(
        "     ⏳ [{}] {} (type a line and press enter)",
        node_id,
        prompt.as_deref().unwrap_or("waiting for input")
    );
    let handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(line)) => {
                handle.provide_input(&node_id, Value::String(line));
            }
            Ok(None) => handle.cancel(),
            Err(e) => {
                tracing::error!("Failed to read input for {}: {}", node_id, e);
                handle.cancel();
            }
        }
    });
}

fn validate_graph(file: PathBuf) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let graph = load_graph(&file)?;
    let config = RuntimeConfig::default();
    let registry = build_registry(&config, &BackendArgs::default())?;
    let runtime = FlowRuntime::with_registry(Arc::new(registry), config);

    let node_count = graph.nodes.len();
    let edge_count = graph.edges.len();
    let name = graph.name.clone();
    let prepared = runtime.executor().prepare(Arc::new(graph))?;

    println!("✅ Graph is valid:");
    println!("   Name: {}", name);
    println!("   Nodes: {}", node_count);
    println!("   Edges: {}", edge_count);
    println!("   Roots: {}", prepared.topology().roots().join(", "));
    println!("   Order: {}", prepared.topology().order().join(" → "));

    Ok(())
}

fn list_nodes() -> Result<()> {
    println!("📦 Available Node Types:");
    println!();

    let registry = build_registry(&RuntimeConfig::default(), &BackendArgs::default())?;

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
            for port in &metadata.inputs {
                let marker = if port.required { "*" } else { " " };
                println!("      {} {}: {}", marker, port.name, port.description);
            }
        } else {
            println!("  • {}", node_type);
        }
    }

    Ok(())
}

fn create_example_graph(output: PathBuf) -> Result<()> {
    let mut graph = Graph::new("Example Prompt Graph");
    graph.description = Some("Sends the run input to a text model and shows the answer".to_string());

    let ids = IdGenerator::new();
    let input = graph.add_node(ids.node("input").with_name("Prompt"));
    let generate = graph.add_node(
        ids.node("text.generate")
            .with_name("Answer")
            .with_data("system", "Answer in one short paragraph.")
            .with_data("temperature", 0.7)
            .with_preview(),
    );
    let out = graph.add_node(ids.node("output").with_name("Result"));

    graph.connect(weavecore::Edge::new(ids.next_edge_id(), &input, &generate).to_port("prompt"));
    graph.link(&ids, &generate, &out);

    let json = serde_json::to_string_pretty(&graph)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weave run --file {} --input 'Why is the sky blue?'",
        output.display()
    );

    Ok(())
}
