use actix_cors::Cors;
use actix_web::{
    delete, get, post, put, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use weavecore::{FlowError, Graph, GraphError, GraphSnapshot, Value};
use weavenodes::{HttpBackend, HttpBackendConfig, NodeServices};
use weaveruntime::{FlowRuntime, NodeRegistry, ProcessSandbox, RunHandle, RuntimeConfig};

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Request body for starting a run
#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    input: Option<serde_json::Value>,
}

/// Value delivered to a waiting node
#[derive(Debug, Deserialize)]
struct InputRequest {
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventFilter {
    run_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct GraphResponse {
    id: Uuid,
    version: u64,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    run_id: Uuid,
    graph_id: Uuid,
    graph_version: u64,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn not_found(what: &str, id: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: format!("{} {} not found", what, id),
    })
}

fn flow_error_response(err: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        FlowError::Graph(GraphError::NotFound(_)) => HttpResponse::NotFound().json(body),
        FlowError::Graph(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

fn graph_summary(snapshot: &GraphSnapshot) -> serde_json::Value {
    let graph = &snapshot.graph;
    serde_json::json!({
        "id": graph.id,
        "name": graph.name,
        "description": graph.description,
        "version": snapshot.version,
        "nodes": graph.nodes.len(),
        "edges": graph.edges.len(),
    })
}

fn run_status(handle: &RunHandle) -> serde_json::Value {
    let projector = handle.projector();
    let result = handle.result();
    let log: Vec<_> = projector.log().collect();
    serde_json::json!({
        "run_id": handle.run_id(),
        "graph_id": handle.graph_id(),
        "graph_version": handle.graph_version(),
        "finished": result.is_some(),
        "cancelled": handle.is_cancelled(),
        "waiting": handle.waiting_nodes(),
        "active_sessions": handle.active_sessions(),
        "nodes": projector.views(),
        "log": log,
        "result": result.as_deref(),
    })
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "weave"
    }))
}

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();

    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .filter_map(|node_type| {
            let metadata = registry.get_metadata(node_type)?;
            let ports = |defs: &[weaveruntime::PortDefinition]| -> Vec<serde_json::Value> {
                defs.iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name,
                            "description": p.description,
                            "required": p.required,
                        })
                    })
                    .collect()
            };
            Some(serde_json::json!({
                "type": node_type,
                "description": metadata.description,
                "category": metadata.category,
                "terminal": metadata.terminal,
                "operation_class": metadata.operation_class,
                "inputs": ports(&metadata.inputs),
                "outputs": ports(&metadata.outputs),
            }))
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

/// List all graphs
#[get("/api/graphs")]
async fn list_graphs(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let graphs: Vec<_> = data
        .runtime
        .list_graphs()
        .await
        .iter()
        .map(graph_summary)
        .collect();
    Ok(HttpResponse::Ok().json(graphs))
}

/// Store a new graph
#[post("/api/graphs")]
async fn create_graph(
    data: web::Data<AppState>,
    graph: web::Json<Graph>,
) -> ActixResult<impl Responder> {
    let graph = graph.into_inner();
    info!("Creating graph: {} ({})", graph.name, graph.id);

    let store = data.runtime.register_graph(graph).await;
    let snapshot = store.snapshot();
    Ok(HttpResponse::Created().json(GraphResponse {
        id: snapshot.graph.id,
        version: snapshot.version,
    }))
}

/// Get a specific graph
#[get("/api/graphs/{id}")]
async fn get_graph(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let graph_id = path.into_inner();
    match data.runtime.graph(graph_id).await {
        Some(store) => {
            let snapshot = store.snapshot();
            Ok(HttpResponse::Ok().json(&*snapshot.graph))
        }
        None => Ok(not_found("Graph", graph_id)),
    }
}

/// Replace a graph's contents; running snapshots are unaffected
#[put("/api/graphs/{id}")]
async fn update_graph(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    graph: web::Json<Graph>,
) -> ActixResult<impl Responder> {
    let graph_id = path.into_inner();
    let mut graph = graph.into_inner();
    graph.id = graph_id;

    match data.runtime.graph(graph_id).await {
        Some(store) => {
            let version = store.replace(graph);
            info!("Updated graph {} to version {}", graph_id, version);
            Ok(HttpResponse::Ok().json(GraphResponse {
                id: graph_id,
                version,
            }))
        }
        None => Ok(not_found("Graph", graph_id)),
    }
}

/// Delete a graph
#[delete("/api/graphs/{id}")]
async fn delete_graph(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let graph_id = path.into_inner();
    if data.runtime.remove_graph(graph_id).await {
        info!("Deleted graph: {}", graph_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": "Graph deleted successfully"
        })))
    } else {
        Ok(not_found("Graph", graph_id))
    }
}

/// Start a run of the graph's current snapshot
#[post("/api/graphs/{id}/runs")]
async fn start_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: Option<web::Json<RunRequest>>,
) -> ActixResult<impl Responder> {
    let graph_id = path.into_inner();
    let input = req
        .map(|r| r.into_inner())
        .unwrap_or_default()
        .input
        .map(Value::from_plain_json);

    match data.runtime.run_graph(graph_id, input).await {
        Ok(handle) => {
            info!("Started run {} of graph {}", handle.run_id(), graph_id);
            Ok(HttpResponse::Accepted().json(RunResponse {
                run_id: handle.run_id(),
                graph_id,
                graph_version: handle.graph_version(),
            }))
        }
        Err(e) => {
            error!("Could not start graph {}: {}", graph_id, e);
            Ok(flow_error_response(&e))
        }
    }
}

/// List runs started by this server
#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let runs: Vec<_> = data
        .runtime
        .list_runs()
        .await
        .iter()
        .map(|h| {
            serde_json::json!({
                "run_id": h.run_id(),
                "graph_id": h.graph_id(),
                "finished": h.is_finished(),
                "cancelled": h.is_cancelled(),
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(runs))
}

/// Node views, output log and (once finished) the result of a run
#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.run(run_id).await {
        Some(handle) => Ok(HttpResponse::Ok().json(run_status(&handle))),
        None => Ok(not_found("Run", run_id)),
    }
}

#[post("/api/runs/{id}/cancel")]
async fn cancel_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.run(run_id).await {
        Some(handle) => {
            handle.cancel();
            info!("Cancelled run {}", run_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "run_id": run_id,
                "cancelled": true
            })))
        }
        None => Ok(not_found("Run", run_id)),
    }
}

#[delete("/api/runs/{id}")]
async fn delete_run(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    let Some(handle) = data.runtime.run(run_id).await else {
        return Ok(not_found("Run", run_id));
    };
    if !handle.is_finished() {
        return Ok(HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Run {} is still in progress", run_id),
        }));
    }
    data.runtime.remove_run(run_id).await;
    Ok(HttpResponse::NoContent().finish())
}

/// Deliver a value to a node waiting for input
#[post("/api/runs/{id}/inputs/{node_id}")]
async fn provide_input(
    data: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
    req: web::Json<InputRequest>,
) -> ActixResult<impl Responder> {
    let (run_id, node_id) = path.into_inner();
    let Some(handle) = data.runtime.run(run_id).await else {
        return Ok(not_found("Run", run_id));
    };

    let value = Value::from_plain_json(req.into_inner().value);
    if handle.provide_input(&node_id, value) {
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "run_id": run_id,
            "node_id": node_id,
            "delivered": true
        })))
    } else {
        Ok(HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Node {} is not waiting for input", node_id),
        }))
    }
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    filter: web::Query<EventFilter>,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let run_filter = filter.into_inner().run_id;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if run_filter.is_some_and(|id| id != event.run_id()) {
                                continue;
                            }
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("WebSocket client lagged, {} events dropped", missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_node_types)
        .service(list_graphs)
        .service(create_graph)
        .service(get_graph)
        .service(update_graph)
        .service(delete_graph)
        .service(start_run)
        .service(list_runs)
        .service(get_run)
        .service(cancel_run)
        .service(delete_run)
        .service(provide_input)
        .service(websocket_events);
}

fn build_runtime() -> anyhow::Result<FlowRuntime> {
    let config = match std::env::var("WEAVE_CONFIG") {
        Ok(path) => RuntimeConfig::from_file(&path)?,
        Err(_) => RuntimeConfig::default(),
    };

    let defaults = HttpBackendConfig::default();
    let backend_config = HttpBackendConfig {
        base_url: std::env::var("WEAVE_BACKEND_URL").unwrap_or(defaults.base_url),
        api_key: std::env::var("WEAVE_API_KEY").ok(),
        default_provider: std::env::var("WEAVE_PROVIDER").unwrap_or(defaults.default_provider),
        connect_timeout_ms: defaults.connect_timeout_ms,
    };
    info!("AI backend at {}", backend_config.base_url);

    let services = NodeServices {
        default_provider: backend_config.default_provider.clone(),
        backend: Arc::new(HttpBackend::new(backend_config)?),
        evaluator: Arc::new(ProcessSandbox::new(config.sandbox.clone())?),
    };

    let mut registry = NodeRegistry::new();
    weavenodes::register_all(&mut registry, &services);

    Ok(FlowRuntime::with_registry(Arc::new(registry), config))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Weave Server");

    let runtime = build_runtime()?;
    info!("✅ Runtime initialized with standard nodes");

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
