use std::net::SocketAddr;
use std::path::{Component, Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::io::ReaderStream;
use toolbridge::completion::{CompletionBackend, HttpCompletionClient};
use toolbridge::supervisor::{
    SupervisorConfig, TaskOutcome, TaskSupervisor, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TASK_TIMEOUT,
};
use toolbridge::tools::{ToolRegistry, TracingSink};
use toolbridge::{Dispatcher, QueryBuilder, ToolbridgeError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<TaskSupervisor>,
    pool: PgPool,
    output_dir: PathBuf,
    started: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let bind_addr = resolve_bind_address()?;
    let pool = build_pool().await?;
    let completion = build_completion_client()?;
    let queries = QueryBuilder::new(resolve_allowed_tables())?;
    let registry = ToolRegistry::new(
        pool.clone(),
        queries,
        Arc::new(completion) as Arc<dyn CompletionBackend>,
        Arc::new(TracingSink),
    );
    let dispatcher = Arc::new(Dispatcher::new(registry));

    let supervisor_config = build_supervisor_config()?;
    let output_dir = supervisor_config.output_dir().to_path_buf();
    let supervisor = Arc::new(TaskSupervisor::new(supervisor_config));

    let state = AppState {
        dispatcher,
        supervisor,
        pool,
        output_dir,
        started: Instant::now(),
    };

    let app = Router::new()
        .route("/rpc", post(handle_rpc))
        .route("/tools", get(list_tools))
        .route("/health", get(health))
        .route("/api/agent/run", post(run_agent))
        .route("/api/files/:name", get(download_file))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    info!(%bind_addr, "server starting");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8402".to_string());
    Ok(raw.parse()?)
}

async fn build_pool() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(10);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&database_url)
        .await?;
    Ok(pool)
}

fn build_completion_client() -> anyhow::Result<HttpCompletionClient> {
    let base_url = std::env::var("COMPLETION_API_URL")
        .unwrap_or_else(|_| "https://api.openai.com".to_string());
    let api_key = std::env::var("COMPLETION_API_KEY").ok();
    let model =
        std::env::var("COMPLETION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let timeout_secs = std::env::var("COMPLETION_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let client =
        HttpCompletionClient::new(base_url, api_key, model, Duration::from_secs(timeout_secs))
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(client)
}

fn resolve_allowed_tables() -> Vec<String> {
    std::env::var("STORAGE_ALLOWED_TABLES")
        .ok()
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|items| !items.is_empty())
        .unwrap_or_else(|| {
            vec![
                "users".to_string(),
                "notes".to_string(),
                "documents".to_string(),
                "tool_executions".to_string(),
            ]
        })
}

fn build_supervisor_config() -> anyhow::Result<SupervisorConfig> {
    let raw_command = std::env::var("AGENT_WORKER_COMMAND")
        .unwrap_or_else(|_| "python3 worker/agent.py".to_string());
    let mut parts = raw_command.split_whitespace().map(str::to_string);
    let command = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("AGENT_WORKER_COMMAND must not be empty"))?;
    let args: Vec<String> = parts.collect();

    let output_dir = resolve_output_dir()?;
    let timeout = std::env::var("AGENT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TASK_TIMEOUT);
    let max_output_bytes = std::env::var("AGENT_MAX_OUTPUT_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);

    SupervisorConfig::new(command, args, output_dir, timeout, max_output_bytes)
        .map_err(|err| anyhow::anyhow!(err.to_string()))
}

fn resolve_output_dir() -> anyhow::Result<PathBuf> {
    let raw = std::env::var("AGENT_OUTPUT_DIR").unwrap_or_else(|_| "./data/outbox".to_string());
    let path = PathBuf::from(&raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(path))
    }
}

async fn handle_rpc(State(state): State<AppState>, body: Bytes) -> Response {
    let bytes = state.dispatcher.handle(&body).await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "tools": state.dispatcher.tool_names() }))
}

async fn health(State(state): State<AppState>) -> Response {
    let storage_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let body = json!({
        "status": if storage_ok { "ok" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.started.elapsed().as_secs(),
    });
    let status = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
struct RunTaskBody {
    #[serde(default)]
    task: Option<String>,
}

async fn run_agent(State(state): State<AppState>, Json(body): Json<RunTaskBody>) -> Response {
    let task = match body.task {
        Some(task) if !task.trim().is_empty() => task,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": "task is required" })),
            )
                .into_response();
        }
    };

    match state.supervisor.run_task(&task).await {
        Ok(run) => {
            let success = run.outcome == TaskOutcome::Success;
            let mut payload = json!({
                "success": success,
                "task": run.task,
                "output": run.output,
                "truncated": run.truncated,
                "had_output": run.had_output,
                "exit_code": run.exit_code,
                "files": run.files,
                "timestamp": run.finished_at.to_rfc3339(),
            });
            let status = match run.outcome {
                TaskOutcome::Success => StatusCode::OK,
                TaskOutcome::Failure => {
                    payload["error"] = json!("worker process failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                TaskOutcome::Timeout => {
                    payload["error"] = json!("worker timed out");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(payload)).into_response()
        }
        Err(ToolbridgeError::WorkerUnavailable(detail)) => {
            error!(%detail, "worker runtime unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "success": false, "error": "worker runtime unavailable", "detail": detail })),
            )
                .into_response()
        }
        Err(ToolbridgeError::MissingRequiredField(field)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": format!("{field} is required") })),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "task execution failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "task execution failed" })),
            )
                .into_response()
        }
    }
}

async fn download_file(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let Some(resolved) = resolve_generated_file(&state.output_dir, &name) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid file name" })),
        )
            .into_response();
    };
    match tokio::fs::File::open(&resolved).await {
        Ok(file) => {
            let stream = ReaderStream::new(file);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{name}\""),
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "file not found" })),
        )
            .into_response(),
    }
}

/// Path-traversal guard: the name must be a single normal path component and
/// the joined path must stay inside the output directory.
fn resolve_generated_file(output_dir: &StdPath, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return None;
    }
    let mut components = StdPath::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return None,
    }
    let resolved = output_dir.join(name);
    if resolved.starts_with(output_dir) {
        Some(resolved)
    } else {
        None
    }
}
