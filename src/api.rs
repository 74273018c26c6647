//! Thin HTTP command surface over the pipeline components. Auth and CORS
//! middleware are a deployment concern layered outside this router.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::errors::{ApprovalError, PipelineError, StoreError, WebhookError};
use crate::models::{ApprovalDecision, JobDetail, ScanCadence, TriggerSource};
use crate::remediation::RemediationWorkflow;
use crate::scheduler::ScanScheduler;
use crate::service::JobService;
use crate::store::{JobFilter, JobStore};
use crate::webhook::{PushEvent, PushOutcome, WebhookIngestor};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub jobs: Arc<JobService>,
    pub workflow: Arc<RemediationWorkflow>,
    pub scheduler: Arc<ScanScheduler>,
    pub ingestor: WebhookIngestor,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartJobRequest {
    pub commit_ref: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ApprovalRequest {
    pub decision: String,
    pub selected_action_ids: Option<Vec<String>>,
    pub actor: Option<String>,
    pub comments: Option<String>,
}

#[derive(Deserialize)]
pub struct RunDueRequest {
    pub cadence: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

// ── Error mapping ─────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, msg).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound { .. } | StoreError::ProjectNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            StoreError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StoreError::Database(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::JobNotFound { .. } | PipelineError::ProjectNotFound { .. } => {
                ApiError::NotFound(e.to_string())
            }
            PipelineError::Store(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::JobNotFound { .. } => ApiError::NotFound(e.to_string()),
            ApprovalError::AlreadyDecided { .. } | ApprovalError::NotAwaitingApproval { .. } => {
                ApiError::Conflict(e.to_string())
            }
            ApprovalError::UnknownAction { .. } => ApiError::BadRequest(e.to_string()),
            ApprovalError::Store(inner) => inner.into(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/projects/{id}/jobs",
            post(start_job).get(list_project_jobs),
        )
        .route("/api/projects/{id}/history", get(project_history))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/approval", post(submit_approval))
        .route("/api/scheduler/run", post(run_scheduled))
        .route("/api/webhooks/push", post(push_webhook))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn start_job(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<StartJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .jobs
        .start_job(
            &project_id,
            req.commit_ref.as_deref(),
            TriggerSource::Manual,
            None,
            req.user_id,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .store
        .get_job(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", id)))?;
    let history = state.store.history_for_job(&id).await?;
    Ok(Json(JobDetail { job, history }))
}

async fn list_project_jobs(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let jobs = state
        .store
        .list_jobs(&JobFilter::for_project(&project_id))
        .await?;
    Ok(Json(jobs))
}

/// Trend reporting: a project's history entries, optionally bounded to a
/// recorded-time range.
async fn project_history(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let range = match (query.from, query.to) {
        (None, None) => None,
        (from, to) => Some((
            from.unwrap_or(DateTime::<Utc>::MIN_UTC),
            to.unwrap_or_else(Utc::now),
        )),
    };
    let history = state
        .store
        .history_for_project(&project_id, range)
        .await?;
    Ok(Json(history))
}

async fn submit_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision: ApprovalDecision = req
        .decision
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let job = state
        .workflow
        .submit_decision(
            &id,
            decision,
            req.selected_action_ids.as_deref(),
            req.actor,
            req.comments,
        )
        .await?;
    Ok(Json(job))
}

/// Privileged operational entry point: run one due-scan sweep now.
async fn run_scheduled(
    State(state): State<SharedState>,
    Json(req): Json<RunDueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cadence: ScanCadence = req
        .cadence
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let summary = state.scheduler.run_due(cadence).await?;
    Ok(Json(summary))
}

async fn push_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let event: PushEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed push payload: {}", e)))?;

    match state.ingestor.handle_push(signature, &body, &event).await {
        Ok(PushOutcome::Accepted { job }) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "job_id": job.id })),
        )),
        Ok(PushOutcome::Ignored { reason }) => Ok((
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": reason })),
        )),
        Err(WebhookError::InvalidSignature) => {
            Err(ApiError::Unauthorized("invalid webhook signature".into()))
        }
        Err(WebhookError::Malformed(msg)) => Err(ApiError::BadRequest(msg)),
        Err(WebhookError::Enqueue(e)) => Err(e.into()),
        Err(WebhookError::Store(e)) => Err(e.into()),
    }
}
