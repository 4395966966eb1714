use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use skyflow::core::job::JobStatus;
use skyflow::core::spec;
use skyflow::error::{Error, ErrorKind};

use crate::runtime::Runtime;

pub async fn serve(runtime: Runtime) -> anyhow::Result<()> {
    let addr = format!("{}:{}", runtime.config.daemon.host, runtime.config.daemon.port);
    let state = Arc::new(runtime);

    let app = Router::new()
        .route("/", get(|| async { "skyflow" }))
        .route("/healthz", get(healthz))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/events", get(job_events))
        .route("/jobs/:id/allocations", get(job_allocations))
        .route("/jobs/:id/artifacts", get(job_artifacts))
        .route("/jobs/:id/metrics", get(job_metrics))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/pool", get(pool_stats))
        .route("/gpus", get(gpu_ledger))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    match Arc::try_unwrap(state) {
        Ok(runtime) => runtime.shutdown().await,
        Err(_) => tracing::warn!("runtime still referenced at shutdown"),
    }
    Ok(())
}

/// Map error kinds onto HTTP statuses; the kind string rides along in
/// the body.
enum ApiError {
    NotFound(String),
    Core(Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "not_found".to_string(),
                format!("{what} not found"),
            ),
            ApiError::Core(e) => {
                let status = match e.kind {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::InfeasibleJob | ErrorKind::Topology => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    ErrorKind::Capacity | ErrorKind::Cancelled => StatusCode::CONFLICT,
                    ErrorKind::PricingStale => StatusCode::SERVICE_UNAVAILABLE,
                    ErrorKind::ProvisioningFailed
                    | ErrorKind::ExecutionFailed
                    | ErrorKind::BudgetExceeded
                    | ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.kind.to_string(), e.message)
            }
        };
        let body = serde_json::json!({ "kind": kind, "message": message });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Core(e)
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::NotFound(what.to_string())
}

async fn healthz(State(state): State<Arc<Runtime>>) -> Result<impl IntoResponse, ApiError> {
    state.db.health_check()?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct SubmitRequest {
    name: String,
    #[serde(default)]
    owner: Option<String>,
    spec_yaml: String,
}

async fn submit_job(
    State(state): State<Arc<Runtime>>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = request.owner.as_deref().unwrap_or("unknown");
    let job = spec::parse_job_spec(&request.name, owner, &request.spec_yaml)?;
    let job = state.scheduler.submit(job)?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<JobStatus>,
}

async fn list_jobs(
    State(state): State<Arc<Runtime>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state.db.list_jobs(query.status)?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.db.get_job(&id)? {
        Some(job) => Ok(Json(job)),
        None => Err(not_found("job")),
    }
}

async fn job_events(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.events_for_job(&id)?))
}

async fn job_allocations(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.allocations_for_job(&id)?))
}

async fn job_artifacts(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.artifacts_for_job(&id)?))
}

async fn job_metrics(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.monitor.metrics_for(&id)?))
}

async fn cancel_job(
    State(state): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.scheduler.cancel(&id)?;
    Ok(Json(job))
}

async fn pool_stats(State(state): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(state.pool.stats())
}

async fn gpu_ledger(State(state): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(state.sharing.snapshot())
}
