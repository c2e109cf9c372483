use actix_cors::Cors;
use actix_web::{
    get, http::StatusCode, post, web, App, HttpResponse, HttpServer, Responder,
    Result as ActixResult,
};
use actix_ws::Message;
use flowcore::{Classify, ErrorInfo, ErrorKind, StorageError, SubmitFlowRequest, Value};
use flowruntime::{ConnectionManager, FlowRuntime, RuntimeConfig, ToolRegistry};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
    /// Cancellation handles of submissions still executing, by flow run id.
    in_flight: RwLock<HashMap<String, CancellationToken>>,
}

impl AppState {
    fn new(runtime: FlowRuntime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            in_flight: RwLock::new(HashMap::new()),
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

fn error_response<E: Classify + std::fmt::Display>(err: &E) -> HttpResponse {
    let info = ErrorInfo::from_error(err);
    let status = match (info.code.as_str(), info.kind) {
        ("RunInfoNotFound", _) => StatusCode::NOT_FOUND,
        (_, ErrorKind::User) => StatusCode::BAD_REQUEST,
        (_, ErrorKind::System) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpResponse::build(status).json(ErrorResponse { error: info })
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowserver"
    }))
}

/// Execute a submission request and return its result document
#[post("/api/submit")]
async fn submit(data: web::Data<AppState>, body: web::Json<Value>) -> ActixResult<impl Responder> {
    let mut doc = body.into_inner();
    if let Some(obj) = doc.as_object_mut() {
        let missing = obj
            .get("flow_run_id")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty);
        if missing {
            obj.insert("flow_run_id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
    }

    let request = match SubmitFlowRequest::from_value(doc) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected malformed submission");
            return Ok(error_response(&e));
        }
    };
    let flow_run_id = request.flow_run_id.clone();
    info!(flow_id = %request.flow_id, flow_run_id = %flow_run_id, "Submission received");

    let token = CancellationToken::new();
    data.in_flight
        .write()
        .await
        .insert(flow_run_id.clone(), token.clone());
    let result = data.runtime.submit_with_cancellation(request, token).await;
    data.in_flight.write().await.remove(&flow_run_id);

    match result {
        Ok(result) => {
            info!(flow_run_id = %flow_run_id, outcome = ?result.outcome(), "Submission finished");
            Ok(HttpResponse::Ok().json(result))
        }
        Err(e) => {
            error!(flow_run_id = %flow_run_id, error = %e, "Submission failed");
            Ok(error_response(&e))
        }
    }
}

/// Get a flow run record
#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    match data.runtime.get_flow_run(&run_id).await {
        Ok(run) => Ok(HttpResponse::Ok().json(run)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Request cancellation of a run
#[post("/api/runs/{id}/cancel")]
async fn cancel_run(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    let run_id = path.into_inner();
    let local = data.in_flight.read().await.get(&run_id).cloned();
    if let Some(token) = &local {
        token.cancel();
    }

    match data.runtime.cancel(&run_id).await {
        Ok(()) => {}
        // Not persisted yet; the token alone stops it.
        Err(StorageError::RunInfoNotFound(_)) if local.is_some() => {}
        Err(e) => return Ok(error_response(&e)),
    }
    info!(run_id = %run_id, "Cancellation requested");
    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "run_id": run_id,
        "status": "CancelRequested",
    })))
}

/// List tool types and package tools
#[get("/api/tools")]
async fn list_tools(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();

    let tool_types: Vec<_> = registry
        .list_tool_types()
        .into_iter()
        .map(|tool_type| {
            serde_json::json!({
                "type": tool_type,
                "description": registry.factory(tool_type).map(|f| f.description()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "tool_types": tool_types,
        "package_tools": registry.list_package_tools(),
    })))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "WebSocket client is lagging, dropped events");
                        }
                        Err(_) => break,
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
        .service(submit)
        .service(get_run)
        .service(cancel_run)
        .service(list_tools)
        .service(websocket_events);
}

fn build_runtime() -> anyhow::Result<FlowRuntime> {
    let mut registry = ToolRegistry::new();
    flownodes::register_all(&mut registry)?;
    let connections = ConnectionManager::from_env()?;
    info!(connections = ?connections.names(), "Loaded connections");
    Ok(FlowRuntime::new(registry, RuntimeConfig::from_env()).with_connections(connections))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting flow server");

    let app_state = web::Data::new(AppState::new(build_runtime()?));

    info!("✅ Runtime initialized with built-in tools");

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
            .app_data(web::JsonConfig::default().limit(16 * 1024 * 1024))
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
