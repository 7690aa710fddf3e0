//! Axum-based HTTP server for the queue engine.
//!
//! Handlers are thin wrappers over [`Engine`] operations. Domain errors
//! surface as a structured JSON body with an HTTP status derived from the
//! error code, so callers can branch on `code` without parsing messages.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;
use crate::error::{ErrorBody, ErrorCode};
use crate::feedback::ResultIntake;
use crate::types::{NewTask, Phase};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiServer {
    engine: Arc<Engine>,
}

impl ApiServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// JSON error response plus the HTTP status it travels under.
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let body = ErrorBody::from_anyhow(err);
        Self {
            status: status_for(body.code),
            body,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::TaskNotFound | ErrorCode::ExecutorNotFound => StatusCode::NOT_FOUND,
        ErrorCode::StaleTransition
        | ErrorCode::InvalidTransition
        | ErrorCode::CapacityExceeded
        | ErrorCode::NoEligibleExecutor
        | ErrorCode::RetryExhausted
        | ErrorCode::LoopDetected => StatusCode::CONFLICT,
        ErrorCode::BumpDisabled | ErrorCode::GuardianRequired => StatusCode::FORBIDDEN,
        ErrorCode::DependencyNotSatisfied
        | ErrorCode::DependencyCycle
        | ErrorCode::InvalidFieldValue
        | ErrorCode::InvalidConfig => StatusCode::BAD_REQUEST,
        ErrorCode::DatabaseError | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn queue_status(State(state): State<ApiServer>) -> ApiResult<Response> {
    let snapshot = state.engine.queue_snapshot()?;
    Ok(Json(snapshot).into_response())
}

fn default_actor() -> String {
    "api".to_string()
}

#[derive(Deserialize)]
struct SeedRequest {
    #[serde(default = "default_actor")]
    actor: String,
    tasks: Vec<NewTask>,
}

async fn seed_tasks(
    State(state): State<ApiServer>,
    Json(req): Json<SeedRequest>,
) -> ApiResult<Response> {
    let created = state.engine.seed_tasks(req.tasks, &req.actor)?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn task_detail(
    State(state): State<ApiServer>,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let detail = state.engine.task_detail(&task_id)?;
    Ok(Json(detail).into_response())
}

async fn submit_result(
    State(state): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(intake): Json<ResultIntake>,
) -> ApiResult<Response> {
    let outcome = state.engine.submit_result(&task_id, intake)?;
    Ok(Json(outcome).into_response())
}

/// Body shared by the admin mutations: who is acting and why.
#[derive(Deserialize)]
struct ActionRequest {
    actor: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn bump_task(
    State(state): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Response> {
    let task = state
        .engine
        .bump_task(&task_id, &req.actor, req.reason.as_deref())
        .await?;
    Ok(Json(task).into_response())
}

async fn cancel_task(
    State(state): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Response> {
    let task = state
        .engine
        .cancel_task(&task_id, &req.actor, req.reason.as_deref())?;
    Ok(Json(task).into_response())
}

async fn restart_task(
    State(state): State<ApiServer>,
    Path(task_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Response> {
    let task = state
        .engine
        .restart_task(&task_id, &req.actor, req.reason.as_deref())?;
    Ok(Json(task).into_response())
}

#[derive(Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    executor_id: Option<String>,
    #[serde(default)]
    specialization: Option<Phase>,
    #[serde(default)]
    capabilities: Vec<String>,
}

async fn register_executor(
    State(state): State<ApiServer>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Response> {
    let profile =
        state
            .engine
            .register_executor(req.executor_id, req.specialization, req.capabilities)?;
    Ok((StatusCode::CREATED, Json(profile)).into_response())
}

#[derive(Serialize)]
struct HeartbeatResponse {
    executor_id: String,
    active_assignments: i64,
}

async fn executor_heartbeat(
    State(state): State<ApiServer>,
    Path(executor_id): Path<String>,
) -> ApiResult<Response> {
    let active_assignments = state.engine.executor_heartbeat(&executor_id)?;
    Ok(Json(HeartbeatResponse {
        executor_id,
        active_assignments,
    })
    .into_response())
}

async fn list_executors(State(state): State<ApiServer>) -> ApiResult<Response> {
    let executors = state.engine.executors().await?;
    Ok(Json(executors).into_response())
}

#[derive(Serialize)]
struct TerminateResponse {
    executor_id: String,
    requeued: Vec<crate::types::Task>,
}

async fn terminate_executor(
    State(state): State<ApiServer>,
    Path(executor_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> ApiResult<Response> {
    let requeued =
        state
            .engine
            .terminate_executor(&executor_id, &req.actor, req.reason.as_deref())?;
    Ok(Json(TerminateResponse {
        executor_id,
        requeued,
    })
    .into_response())
}

fn default_event_limit() -> i64 {
    100
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after_seq: i64,
    #[serde(default = "default_event_limit")]
    limit: i64,
}

async fn list_events(
    State(state): State<ApiServer>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let events = state.engine.events_after(query.after_seq, query.limit)?;
    Ok(Json(events).into_response())
}

fn default_audit_limit() -> i64 {
    50
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: i64,
}

async fn list_audit(
    State(state): State<ApiServer>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Response> {
    let entries = state.engine.recent_audit(query.limit)?;
    Ok(Json(entries).into_response())
}

fn build_router(state: ApiServer) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Queue views
        .route("/api/queue/status", get(queue_status))
        .route("/api/events", get(list_events))
        .route("/api/audit", get(list_audit))
        // Task lifecycle
        .route("/api/tasks/seed", post(seed_tasks))
        .route("/api/tasks/{task_id}", get(task_detail))
        .route("/api/tasks/{task_id}/result", post(submit_result))
        .route("/api/tasks/{task_id}/bump", post(bump_task))
        .route("/api/tasks/{task_id}/cancel", post(cancel_task))
        .route("/api/tasks/{task_id}/restart", post(restart_task))
        // Executor fleet
        .route("/api/agents", get(list_executors))
        .route("/api/agents/register", post(register_executor))
        .route("/api/agents/{executor_id}/heartbeat", post(executor_heartbeat))
        .route("/api/agents/{executor_id}/terminate", post(terminate_executor))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Returns a oneshot sender that signals shutdown, and the address the
/// server actually bound (useful when the configured port is 0).
pub async fn start_server(
    engine: Arc<Engine>,
    host: &str,
    port: u16,
) -> anyhow::Result<(oneshot::Sender<()>, SocketAddr)> {
    let state = ApiServer::new(engine);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let bound_addr = listener.local_addr()?;

    info!("API server listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            })
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok((shutdown_tx, bound_addr))
}
