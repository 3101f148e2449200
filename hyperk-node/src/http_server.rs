//! REST API
//!
//! Thin axum layer over the [`InstanceController`]:
//! - Bearer-token authentication resolving to a [`Caller`]
//! - Instance listing, inspection, rename and power-state changes
//! - Asynchronous creation with job status polling and cancellation
//!
//! Every error is returned as `{"error": <code>, "message": <text>}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hyperk_hypervisor::InstanceView;

use crate::error::{OrchestratorError, Result};
use crate::jobs::{JobId, JobRecord};
use crate::lifecycle::{Caller, CreateInstanceRequest, InstanceController, TargetState};
use crate::repository::InstanceRepository;

/// Shared state for HTTP handlers
pub struct AppState {
    pub controller: Arc<InstanceController>,
    /// Used to resolve token owners
    pub repository: Arc<dyn InstanceRepository>,
    /// Bearer token to user id
    pub tokens: HashMap<String, i64>,
}

// ============================================================================
// Extractors
// ============================================================================

/// JSON body whose rejections use the API error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(OrchestratorError))]
struct ApiJson<T>(T);

/// Path parameters whose rejections use the API error body.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(OrchestratorError))]
struct ApiPath<T>(T);

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct InstanceListResponse {
    instances: Vec<InstanceView>,
}

#[derive(Deserialize)]
struct RenameRequest {
    name: String,
}

#[derive(Serialize)]
struct RenameResponse {
    id: Uuid,
    name: String,
}

#[derive(Deserialize)]
struct StateRequest {
    state: String,
}

#[derive(Serialize)]
struct StateResponse {
    state: TargetState,
}

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
    job_id: JobId,
}

// ============================================================================
// Router
// ============================================================================

/// Build the application router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/instances", get(list_instances))
        .route("/instances/create", post(create_instance))
        .route("/instances/:id", get(get_instance).put(rename_instance))
        .route("/instances/:id/state", post(set_instance_state))
        .route("/jobs/:id", get(get_job).delete(cancel_job))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state);

    Router::new()
        .route("/", get(health))
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` resolves.
pub async fn run_http_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Starting HTTP API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP API server stopped");
    Ok(())
}

// ============================================================================
// Authentication
// ============================================================================

/// Resolve `Authorization: Bearer <token>` to a [`Caller`] extension.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> std::result::Result<Response, OrchestratorError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| OrchestratorError::Unauthorized("missing bearer token".to_string()))?;

    let user_id = *state
        .tokens
        .get(token.trim())
        .ok_or_else(|| OrchestratorError::Unauthorized("unknown token".to_string()))?;

    let user = state
        .repository
        .get_user_by_id(user_id)
        .await
        .map_err(|_| OrchestratorError::Unauthorized("token owner does not exist".to_string()))?;

    debug!(user = %user.username, "Request authenticated");
    req.extensions_mut().insert(Caller {
        user_id: user.id,
        is_admin: user.is_admin,
    });

    Ok(next.run(req).await)
}

// ============================================================================
// Handlers
// ============================================================================

/// GET / - Liveness
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /api/v1/instances - List instances visible to the caller
///
/// Instances whose domain has disappeared from the hypervisor are skipped.
async fn list_instances(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<InstanceListResponse>> {
    let mut views = state.controller.list_instances(caller).await?;
    let mut instances = Vec::new();

    while let Some(item) = views.next().await {
        match item {
            Ok(view) => instances.push(view),
            Err(OrchestratorError::NotFound(what)) => {
                warn!(missing = %what, "Tracked instance has no domain, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(Json(InstanceListResponse { instances }))
}

/// GET /api/v1/instances/:id - Get one instance
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<InstanceView>> {
    Ok(Json(state.controller.get_instance(id, caller).await?))
}

/// PUT /api/v1/instances/:id - Rename an instance
async fn rename_instance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<RenameRequest>,
) -> Result<Json<RenameResponse>> {
    let instance = state.controller.rename_instance(id, &body.name, caller).await?;
    Ok(Json(RenameResponse {
        id: instance.id,
        name: instance.name,
    }))
}

/// POST /api/v1/instances/:id/state - Start, power off or pause
async fn set_instance_state(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<StateRequest>,
) -> Result<Json<StateResponse>> {
    let target = state.controller.set_instance_state(id, &body.state, caller).await?;
    Ok(Json(StateResponse { state: target }))
}

/// POST /api/v1/instances/create - Queue a new instance
async fn create_instance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiJson(body): ApiJson<CreateInstanceRequest>,
) -> Result<impl IntoResponse> {
    let accepted = state.controller.submit_creation(caller, body).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            job_id: accepted.job_id,
        }),
    ))
}

/// GET /api/v1/jobs/:id - Creation job status
async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiPath(job_id): ApiPath<JobId>,
) -> Result<Json<JobRecord>> {
    Ok(Json(state.controller.job_status(job_id, caller)?))
}

/// DELETE /api/v1/jobs/:id - Cancel a queued or running creation job
async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    ApiPath(job_id): ApiPath<JobId>,
) -> Result<impl IntoResponse> {
    let record = state.controller.cancel_job(job_id, caller)?;
    info!(job_id = %job_id, "Job cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(record)))
}
